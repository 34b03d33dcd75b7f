//! Writer task for the worker's stdin.
//!
//! A single writer consumes the outbound queue, so each line reaches the
//! worker whole and in queue order. A failed write rejects only the request
//! it carried; responses and notifications are dropped with a warning. Flush
//! markers are acknowledged in queue order and never written.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::OutboundMessage;
use crate::bridge::correlation::CorrelationTable;
use crate::error::BridgeError;

/// Queue capacity for outbound messages.
///
/// Bounds memory per worker and provides backpressure to senders.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Handle to a running Writer Task. Dropping it cancels the task.
pub(crate) struct WriterTaskHandle {
    _join_handle: tokio::task::JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl Drop for WriterTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn a writer task that writes queued messages to `writer`.
///
/// `table` is used to reject requests whose line could not be written.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    rx: mpsc::Receiver<OutboundMessage>,
    table: CorrelationTable,
) -> WriterTaskHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(writer_loop(writer, rx, table, cancel_token.clone()));

    WriterTaskHandle {
        _join_handle: join_handle,
        cancel_token,
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<OutboundMessage>,
    table: CorrelationTable,
    cancel_token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!(
                    target: "tsunagi::bridge::writer",
                    "Writer task cancelled, failing queued requests"
                );
                rx.close();
                while let Ok(msg) = rx.try_recv() {
                    if let OutboundMessage::Request { id, .. } = msg {
                        table.reject(&id, BridgeError::transport("worker went away before the request was written"));
                    }
                }
                return;
            }

            msg = rx.recv() => {
                let Some(outbound) = msg else {
                    log::debug!(
                        target: "tsunagi::bridge::writer",
                        "Writer channel closed"
                    );
                    return;
                };
                if let OutboundMessage::Flush(ack) = outbound {
                    let _ = ack.send(());
                    continue;
                }
                let Some(line) = outbound.line() else {
                    continue;
                };
                if let Err(e) = write_line(&mut writer, line).await {
                    log::warn!(
                        target: "tsunagi::bridge::writer",
                        "Write to worker failed: {}",
                        e
                    );
                    if let OutboundMessage::Request { id, .. } = &outbound {
                        table.reject(id, BridgeError::transport(format!("failed to write request: {}", e)));
                    }
                }
            }
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
