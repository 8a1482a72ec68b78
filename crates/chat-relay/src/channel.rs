//! The outbound half of a long-lived HTTP response.
//!
//! A handler opens a bounded channel, returns the receiving [`ResponseBody`]
//! to actix as the streaming body, and hands the single [`ResponseChannel`]
//! writer to a relay task. Writes wait for capacity, so a slow client slows
//! the relay down instead of growing a buffer. When the client goes away the
//! body is dropped and the next write fails.
//!
//! Closing consumes the writer; dropping it on an early return closes the
//! body as well, so every exit path closes the response exactly once.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("response channel closed by client")]
pub struct ChannelClosed;

#[derive(Debug)]
pub struct ResponseChannel {
    tx: mpsc::Sender<Bytes>,
    bytes_written: usize,
}

/// Receiving end, used as the HTTP response body.
#[derive(Debug)]
pub struct ResponseBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ResponseChannel {
    pub fn open(capacity: usize) -> (ResponseChannel, ResponseBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ResponseChannel {
                tx,
                bytes_written: 0,
            },
            ResponseBody { rx },
        )
    }

    pub async fn write(&mut self, bytes: impl Into<Bytes>) -> Result<(), ChannelClosed> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len();
        self.tx.send(bytes).await.map_err(|_| ChannelClosed)?;
        self.bytes_written += len;
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Resolves once the client side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}
