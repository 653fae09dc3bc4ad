//! Raw MPEG-TS streaming handler (C11, §4.11). Registers a buffer client
//! and writes chunks to a caller-supplied sink until disconnect, buffer
//! close, or cancellation.

use crate::buffer::{BufferClient, SharedBuffer};
use crate::error::RelayError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Abstraction over the outbound HTTP response body. The core doesn't own
/// an HTTP stack (§1); callers inject a sink that writes and flushes.
#[async_trait::async_trait]
pub trait StreamSink: Send {
    async fn write_and_flush(&mut self, bytes: bytes::Bytes) -> anyhow::Result<()>;
}

pub struct MpegtsHandler;

impl MpegtsHandler {
    /// Registers a client on `buffer` and streams until the sink errors
    /// (client disconnected), the buffer closes, a lag event occurs (the
    /// stream ends cleanly so the client can reconnect), or `cancel`
    /// fires. Removes the client on every exit path.
    pub async fn serve_stream(
        buffer: &SharedBuffer,
        user_agent: Option<String>,
        remote_addr: Option<String>,
        sink: &mut dyn StreamSink,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let client: Arc<BufferClient> = buffer.add_client(user_agent, remote_addr);
        let result = Self::stream_loop(buffer, &client, sink, cancel).await;
        buffer.remove_client(client.id);
        result
    }

    async fn stream_loop(
        buffer: &SharedBuffer,
        client: &BufferClient,
        sink: &mut dyn StreamSink,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        loop {
            let chunks = match buffer.read_with_wait(client, cancel).await {
                Ok(chunks) => chunks,
                Err(RelayError::BufferLag { resynced_to }) => {
                    debug!(resynced_to, "mpegts client lagged, ending stream for clean reconnect");
                    return Ok(());
                }
                Err(RelayError::BufferClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            for chunk in chunks {
                if sink.write_and_flush(chunk.bytes).await.is_err() {
                    return Ok(()); // client disconnected
                }
            }
        }
    }
}
