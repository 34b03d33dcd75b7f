//! Injected logger for bridge events.
//!
//! The bridge never reaches for process-wide logging switches. Whoever builds
//! a [`ProcessBridge`](crate::ProcessBridge) hands it a `BridgeLogger`, and all
//! lifecycle events, protocol problems and worker output go through it.

use std::fmt;

/// Which worker stream a diagnostic line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Non-protocol text printed on stdout
    Stdout,
    /// Anything printed on stderr
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Sink for bridge log events and worker diagnostics.
pub trait BridgeLogger: Send + Sync {
    fn info(&self, message: &str);

    fn error(&self, message: &str);

    /// A line of worker output that is not part of the protocol.
    fn worker_output(&self, stream: OutputStream, line: &str) {
        self.info(&format!("[worker {}] {}", stream, line));
    }
}

/// Default logger that forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogForwarder;

impl BridgeLogger for LogForwarder {
    fn info(&self, message: &str) {
        log::info!(target: "tsunagi::bridge", "{}", message);
    }

    fn error(&self, message: &str) {
        log::error!(target: "tsunagi::bridge", "{}", message);
    }

    fn worker_output(&self, stream: OutputStream, line: &str) {
        log::info!(target: "tsunagi::worker", "[{}] {}", stream, line);
    }
}


#[cfg(test)]
mod tests {
    use super::recording::RecordingLogger;
    use super::*;

    struct InfoOnly(std::sync::Mutex<Vec<String>>);

    impl BridgeLogger for InfoOnly {
        fn info(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }

        fn error(&self, _message: &str) {}
    }

    #[test]
    fn default_worker_output_goes_through_info() {
        let logger = InfoOnly(std::sync::Mutex::new(Vec::new()));
        logger.worker_output(OutputStream::Stderr, "warming up");
        assert_eq!(
            logger.0.lock().unwrap().as_slice(),
            ["[worker stderr] warming up".to_string()]
        );
    }

    #[test]
    fn recording_logger_separates_streams() {
        let logger = RecordingLogger::default();
        logger.worker_output(OutputStream::Stdout, "plain text");
        logger.error("broken");
        assert_eq!(
            logger.output_lines(),
            vec![(OutputStream::Stdout, "plain text".to_string())]
        );
        assert_eq!(logger.error_lines(), vec!["broken".to_string()]);
        assert!(logger.info_lines().is_empty());
    }
}
