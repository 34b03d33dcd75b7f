//! Line codec: one JSON object per line.
//!
//! Decoding never fails outright. Text that does not look like a JSON
//! object is worker chatter and goes to the diagnostic sink; text that looks
//! like JSON but is not a valid message is reported as malformed so the read
//! loop can log it and move on.

use serde_json::{Map, Value};

use super::{CallId, ErrorObject, Message, MessageId, PROTOCOL_VERSION, Request, Response};

/// Outcome of decoding one line of worker stdout.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Message(Message),
    /// Not protocol traffic; forward verbatim to the diagnostic sink
    Diagnostic(String),
    /// Looked like JSON but could not be understood
    Malformed { line: String, reason: String },
}

/// Structural check: does the line start with `{` and end with `}`?
pub(crate) fn looks_like_json_object(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

/// Decode one line of worker output.
pub(crate) fn decode_line(line: &str) -> Decoded {
    if !looks_like_json_object(line) {
        return Decoded::Diagnostic(line.to_string());
    }

    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(e) => {
            return Decoded::Malformed {
                line: line.to_string(),
                reason: e.to_string(),
            };
        }
    };

    match classify(value) {
        Ok(message) => Decoded::Message(message),
        Err(reason) => Decoded::Malformed {
            line: line.to_string(),
            reason: reason.to_string(),
        },
    }
}

fn classify(value: Value) -> Result<Message, &'static str> {
    let Value::Object(mut object) = value else {
        return Err("message is not a JSON object");
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(MessageId::from_value(&raw).ok_or("id must be an integer or a string")?),
    };

    match object.remove("method") {
        Some(Value::String(method)) => Ok(Message::Request(Request {
            id,
            method,
            params: match object.remove("params") {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(params) => params,
            },
            call_id: object.remove("callId").and_then(call_id_from_value),
            timeout_ms: object.get("timeoutMs").and_then(timeout_from_value),
        })),
        Some(_) => Err("method must be a string"),
        None => {
            let id = id.ok_or("message has neither method nor id")?;
            let outcome = match object.remove("error") {
                None | Some(Value::Null) => Ok(object.remove("result").unwrap_or(Value::Null)),
                Some(error) => Err(error_from_value(error)),
            };
            Ok(Message::Response(Response { id, outcome }))
        }
    }
}

fn call_id_from_value(value: Value) -> Option<CallId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(CallId::from(s)),
        Value::Number(n) => Some(CallId::from(n.to_string())),
        _ => None,
    }
}

fn timeout_from_value(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|ms| *ms >= 0.0).map(|ms| ms as u64))
}

fn error_from_value(error: Value) -> ErrorObject {
    match error {
        Value::String(message) => ErrorObject::new(message),
        Value::Object(mut object) => {
            let message = match object.remove("message") {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => "unknown error".to_string(),
            };
            ErrorObject {
                message,
                data: object.remove("data").filter(|data| !data.is_null()),
            }
        }
        other => ErrorObject::new(other.to_string()),
    }
}

/// Serialize a message as exactly one newline-terminated JSON line.
pub fn encode(message: &Message) -> serde_json::Result<String> {
    let mut object = Map::new();
    object.insert("jsonrpc".into(), Value::from(PROTOCOL_VERSION));

    match message {
        Message::Request(request) => {
            if let Some(id) = &request.id {
                object.insert("id".into(), id.to_value());
            }
            object.insert("method".into(), Value::from(request.method.as_str()));
            object.insert("params".into(), request.params.clone());
            if let Some(call_id) = &request.call_id {
                object.insert("callId".into(), Value::from(call_id.as_str()));
            }
            if let Some(timeout_ms) = request.timeout_ms {
                object.insert("timeoutMs".into(), Value::from(timeout_ms));
            }
        }
        Message::Response(response) => {
            object.insert("id".into(), response.id.to_value());
            match &response.outcome {
                Ok(result) => {
                    object.insert("result".into(), result.clone());
                }
                Err(error) => {
                    object.insert("error".into(), serde_json::to_value(error)?);
                }
            }
        }
    }

    let mut line = serde_json::to_string(&Value::Object(object))?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn decode_message(line: &str) -> Message {
        match decode_line(line) {
            Decoded::Message(message) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[rstest]
    #[case::plain_log_line("worker started on port 9000")]
    #[case::python_traceback("Traceback (most recent call last):")]
    #[case::json_array("[1, 2, 3]")]
    #[case::unterminated_object("{\"id\": 1")]
    #[case::empty("")]
    fn non_object_lines_are_diagnostics(#[case] line: &str) {
        assert_eq!(decode_line(line), Decoded::Diagnostic(line.to_string()));
    }

    #[rstest]
    #[case::broken_json("{\"id\": 1,}", "")]
    #[case::neither_method_nor_id("{\"result\": 1}", "neither method nor id")]
    #[case::method_not_string("{\"method\": 5, \"id\": 1}", "method must be a string")]
    #[case::fractional_id("{\"id\": 1.5, \"result\": null}", "id must be")]
    fn json_looking_garbage_is_malformed(#[case] line: &str, #[case] expected_reason: &str) {
        match decode_line(line) {
            Decoded::Malformed {
                line: offending,
                reason,
            } => {
                assert_eq!(offending, line);
                assert!(
                    reason.contains(expected_reason),
                    "reason {:?} should mention {:?}",
                    reason,
                    expected_reason
                );
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn request_with_budget_is_classified() {
        let message = decode_message(
            r#"{"jsonrpc":"2.0","id":"w-3","method":"fs/readFile","params":{"path":"a"},"callId":"01J","timeoutMs":1500}"#,
        );
        let Message::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, Some(MessageId::from("w-3")));
        assert_eq!(request.method, "fs/readFile");
        assert_eq!(request.params, json!({"path": "a"}));
        assert_eq!(request.call_id, Some(CallId::from("01J")));
        assert_eq!(request.timeout_ms, Some(1500));
    }

    #[test]
    fn request_without_id_is_a_notification() {
        let Message::Request(request) = decode_message(r#"{"method":"progress"}"#) else {
            panic!("expected request");
        };
        assert!(request.is_notification());
        assert_eq!(request.params, json!({}));
        assert_eq!(request.call_id, None);
    }

    #[test]
    fn response_with_result() {
        let message = decode_message(r#"{"id":4,"result":{"x":1}}"#);
        assert_eq!(
            message,
            Message::Response(Response::success(MessageId::from(4), json!({"x": 1})))
        );
    }

    #[test]
    fn response_with_null_error_is_success() {
        let message = decode_message(r#"{"id":4,"result":null,"error":null}"#);
        assert_eq!(
            message,
            Message::Response(Response::success(MessageId::from(4), Value::Null))
        );
    }

    #[test]
    fn response_with_error_object() {
        let message =
            decode_message(r#"{"id":9,"error":{"message":"nope","data":{"hint":"retry"}}}"#);
        let Message::Response(response) = message else {
            panic!("expected response");
        };
        let error = response.outcome.unwrap_err();
        assert_eq!(error.message, "nope");
        assert_eq!(error.data, Some(json!({"hint": "retry"})));
    }

    #[test]
    fn response_with_string_error() {
        let Message::Response(response) = decode_message(r#"{"id":9,"error":"plain failure"}"#)
        else {
            panic!("expected response");
        };
        assert_eq!(response.outcome.unwrap_err().message, "plain failure");
    }

    #[test]
    fn encode_request_is_one_tagged_line() {
        let request = Request::new(MessageId::from(1), "echo", json!({"x": 1}))
            .with_budget(CallId::from("abc"), 50);
        let line = encode(&Message::Request(request)).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "echo",
                "params": {"x": 1},
                "callId": "abc",
                "timeoutMs": 50
            })
        );
    }

    #[test]
    fn encode_notification_omits_id() {
        let line = encode(&Message::Request(Request::notification("ping", json!({})))).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "ping");
    }

    #[test]
    fn encode_error_response_omits_absent_data() {
        let response = Response::failure(MessageId::from("w-1"), ErrorObject::new("bad"));
        let line = encode(&Message::Response(response)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": "w-1", "error": {"message": "bad"}})
        );
    }

    #[test]
    fn multiline_payload_stays_on_one_line() {
        let response = Response::success(MessageId::from(2), json!({"text": "a\nb"}));
        let line = encode(&Message::Response(response.clone())).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_message(line.trim_end()), Message::Response(response));
    }
}
