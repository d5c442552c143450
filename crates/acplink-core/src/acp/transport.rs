//! JSON-RPC transport over a pair of byte streams
//!
//! The transport owns both halves of the agent's stdio. A writer task
//! drains an outbound channel into a [`FramedWrite`]; a reader task feeds
//! decoded messages from a [`FramedRead`] into an inbound channel. When the
//! reader hits EOF or an I/O error the inbound channel closes, which is the
//! connection's disconnect signal.

use crate::acp::codec::AcpCodec;
use crate::error::{AcpError, Error, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Capacity of the outbound and inbound message channels
const CHANNEL_CAPACITY: usize = 256;

/// Transport layer for ACP communication
/// Uses channels to avoid lock contention between send and receive
pub struct Transport {
    /// Channel to the writer task
    outbound_tx: mpsc::Sender<Value>,
    shutdown: CancellationToken,
    _writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl Transport {
    /// Wrap a reader/writer pair. Returns the transport and the receiver
    /// of inbound messages.
    pub fn new<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Value>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let writer_task = tokio::spawn(Self::write_task(writer, outbound_rx));
        let reader_task = tokio::spawn(Self::read_task(reader, inbound_tx, shutdown.clone()));

        (
            Self {
                outbound_tx,
                shutdown,
                _writer_task: writer_task,
                reader_task,
            },
            inbound_rx,
        )
    }

    async fn write_task<W>(writer: W, mut rx: mpsc::Receiver<Value>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = FramedWrite::new(writer, AcpCodec::new());
        while let Some(message) = rx.recv().await {
            if let Err(e) = framed.send(message).await {
                error!("Failed to write to agent stdin: {}", e);
                break;
            }
        }
        debug!("Stdin writer task ended");
    }

    async fn read_task<R>(reader: R, tx: mpsc::Sender<Value>, shutdown: CancellationToken)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut framed = FramedRead::new(reader, AcpCodec::new());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Stdout reader task cancelled");
                    break;
                }

                item = framed.next() => match item {
                    Some(Ok(message)) => {
                        if tx.send(message).await.is_err() {
                            warn!("Inbound channel closed, stopping reader");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error reading agent stdout: {}", e);
                        break;
                    }
                    None => {
                        debug!("Agent stdout closed");
                        break;
                    }
                },
            }
        }
    }

    /// Queue one message for the writer task
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.outbound_tx
            .send(value)
            .await
            .map_err(|_| Error::Acp(AcpError::Disconnected))
    }

    /// Stop the reader. Pending outbound messages are still flushed.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // Writer exits on its own once the outbound sender is dropped
        self.reader_task.abort();
    }
}
