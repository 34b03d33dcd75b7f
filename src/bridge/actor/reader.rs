//! Reader task for worker output streams.
//!
//! The Reader Task:
//! - Runs in a spawned tokio task, one per stream (stdout, stderr)
//! - Reads raw chunks and frames them into lines with `LineFramer`
//! - Hands each line, in arrival order, to a caller-supplied callback
//! - Shuts down on EOF, read error, or when its handle is dropped

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::framing::LineFramer;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Handle to a running Reader Task.
///
/// Dropping the handle cancels the task.
pub(crate) struct ReaderTaskHandle {
    _join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl Drop for ReaderTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn a reader task that frames `reader` and passes each line to `on_line`.
///
/// `stream` names the stream in log messages.
pub(crate) fn spawn_reader_task<R, F>(stream: &'static str, reader: R, on_line: F) -> ReaderTaskHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(reader_loop(stream, reader, on_line, cancel_token.clone()));

    ReaderTaskHandle {
        _join_handle: join_handle,
        cancel_token,
    }
}

/// The main reader loop - reads chunks and emits lines.
async fn reader_loop<R, F>(
    stream: &'static str,
    mut reader: R,
    mut on_line: F,
    cancel_token: CancellationToken,
) where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut framer = LineFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(
                    target: "tsunagi::bridge::reader",
                    "Reader task for {} cancelled, shutting down",
                    stream
                );
                return;
            }

            result = reader.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        debug!(
                            target: "tsunagi::bridge::reader",
                            "Worker {} reached EOF",
                            stream
                        );
                        break;
                    }
                    Ok(n) => {
                        for line in framer.push(&chunk[..n]) {
                            on_line(line);
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "tsunagi::bridge::reader",
                            "Error reading worker {}: {}",
                            stream,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Some(line) = framer.finish() {
        on_line(line);
    }
}
