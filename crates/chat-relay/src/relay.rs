//! Server-Sent-Events passthrough.
//!
//! The upstream already speaks SSE, so the relay does not parse events. It
//! forwards each chunk as received and only looks at the decoded text for the
//! `data: [DONE]` sentinel, after which it adds one newline. Seeing the
//! sentinel never ends the relay; the end of the upstream body does.
//!
//! ```text
//! Open --chunk--> Data --chunk--> Data ... --eof--> End
//!                   \--error/idle timeout--> Error
//! ```

use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelClosed, ResponseChannel};
use crate::error::GatewayError;
use crate::upstream::ByteStream;

/// Marker the provider sends once a completion has finished.
pub const TERMINATION_SENTINEL: &str = "data: [DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Data,
    End,
    Error,
}

#[derive(Debug)]
pub enum RelayOutcome {
    Completed { chunks: usize, bytes: usize },
    UpstreamFailed(GatewayError),
    ClientDisconnected,
}

impl RelayOutcome {
    pub(crate) fn log(&self, path: &str) {
        match self {
            Self::Completed { chunks, bytes } => {
                info!(path, chunks, bytes, "relay completed")
            }
            Self::UpstreamFailed(e) => warn!(path, error = %e, "relay ended by upstream failure"),
            Self::ClientDisconnected => info!(path, "client disconnected during relay"),
        }
    }
}

/// Bytes to write for one upstream chunk.
pub fn frame_chunk(chunk: Bytes) -> Bytes {
    if !String::from_utf8_lossy(&chunk).contains(TERMINATION_SENTINEL) {
        return chunk;
    }
    let mut framed = Vec::with_capacity(chunk.len() + 1);
    framed.extend_from_slice(&chunk);
    framed.push(b'\n');
    Bytes::from(framed)
}

/// SSE record written when the upstream fails after headers went out.
/// `at_boundary` is false when the bytes written so far stop inside an
/// event; the record then first terminates that event.
pub fn terminal_error_record(err: &GatewayError, at_boundary: bool) -> String {
    let lead = if at_boundary { "" } else { "\n\n" };
    format!("{}data: {}\n\n", lead, err.to_json())
}

/// Pipe `upstream` into `channel` until the upstream ends, fails, stalls for
/// longer than `idle_timeout`, or the client goes away. The channel is closed
/// on return and the upstream stream is released.
pub async fn relay_sse(
    mut upstream: ByteStream,
    mut channel: ResponseChannel,
    idle_timeout: Duration,
) -> RelayOutcome {
    let mut state = RelayState::Open;
    let mut chunks = 0usize;
    let mut at_boundary = true;
    trace!(?state, "sse relay started");

    let outcome = loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, upstream.next()) => match next {
                Ok(next) => next,
                Err(_) => Some(Err(GatewayError::StreamFailure(format!(
                    "no upstream data for {}s",
                    idle_timeout.as_secs_f32()
                )))),
            },
            _ = channel.closed() => break RelayOutcome::ClientDisconnected,
        };

        match next {
            Some(Ok(chunk)) => {
                state = RelayState::Data;
                chunks += 1;
                let framed = frame_chunk(chunk);
                if !framed.is_empty() {
                    at_boundary = framed.ends_with(b"\n\n");
                }
                if let Err(ChannelClosed) = channel.write(framed).await {
                    break RelayOutcome::ClientDisconnected;
                }
            }
            Some(Err(err)) => {
                state = RelayState::Error;
                let record = terminal_error_record(&err, at_boundary);
                if channel.write(record).await.is_err() {
                    break RelayOutcome::ClientDisconnected;
                }
                break RelayOutcome::UpstreamFailed(err);
            }
            None => {
                state = RelayState::End;
                break RelayOutcome::Completed {
                    chunks,
                    bytes: channel.bytes_written(),
                };
            }
        }
    };

    debug!(?state, "sse relay finished");
    drop(upstream);
    channel.close();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ResponseBody;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const IDLE: Duration = Duration::from_secs(5);

    fn upstream_of(chunks: Vec<Result<&'static str, GatewayError>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        ))
    }

    async fn read_all(body: ResponseBody) -> String {
        let parts: Vec<Bytes> = body.map(|r| r.unwrap()).collect().await;
        String::from_utf8(parts.concat()).unwrap()
    }

    #[tokio::test]
    async fn forwards_chunks_unmodified_and_in_order() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![Ok("data: {\"a\":1}\n\n"), Ok("data: {\"b\":2}\n\n")]);

        let outcome = relay_sse(upstream, channel, IDLE).await;

        assert!(matches!(outcome, RelayOutcome::Completed { chunks: 2, .. }));
        assert_eq!(read_all(body).await, "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
    }

    #[tokio::test]
    async fn sentinel_chunk_gets_one_trailing_newline() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![Ok("data: {\"a\":1}\n\n"), Ok("data: [DONE]")]);

        relay_sse(upstream, channel, IDLE).await;

        assert_eq!(read_all(body).await, "data: {\"a\":1}\n\ndata: [DONE]\n");
    }

    #[tokio::test]
    async fn sentinel_split_across_chunks_passes_through() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![Ok("data: [DO"), Ok("NE]\n\n")]);

        relay_sse(upstream, channel, IDLE).await;

        assert_eq!(read_all(body).await, "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn sentinel_does_not_end_relay_early() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![Ok("data: [DONE]\n\n"), Ok(": trailing\n\n")]);

        let outcome = relay_sse(upstream, channel, IDLE).await;

        assert!(matches!(outcome, RelayOutcome::Completed { chunks: 2, .. }));
        assert_eq!(read_all(body).await, "data: [DONE]\n\n\n: trailing\n\n");
    }

    #[tokio::test]
    async fn upstream_error_writes_terminal_record_and_closes() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![
            Ok("data: {\"a\":1}\n\n"),
            Err(GatewayError::StreamFailure("connection reset".into())),
            Ok("data: never\n\n"),
        ]);

        let outcome = relay_sse(upstream, channel, IDLE).await;

        assert!(matches!(
            outcome,
            RelayOutcome::UpstreamFailed(GatewayError::StreamFailure(_))
        ));
        let text = read_all(body).await;
        assert!(text.starts_with("data: {\"a\":1}\n\ndata: {"));
        assert!(text.contains("\"kind\":\"stream_failure\""));
        assert!(text.contains("connection reset"));
        assert!(!text.contains("never"));
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn error_after_partial_event_starts_a_fresh_event() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream = upstream_of(vec![
            Ok("data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"Hel"),
            Err(GatewayError::StreamFailure("connection reset".into())),
        ]);

        relay_sse(upstream, channel, IDLE).await;

        let text = read_all(body).await;
        let events: Vec<&str> = text
            .split("\n\n")
            .filter(|e| !e.trim().is_empty())
            .collect();
        assert_eq!(events.len(), 2);
        let data = events[1].strip_prefix("data: ").unwrap();
        let record: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(record["kind"], "stream_failure");
        assert_eq!(record["message"], "connection reset");
    }

    #[test]
    fn error_record_after_complete_event_has_no_lead() {
        let err = GatewayError::StreamFailure("x".into());
        assert!(terminal_error_record(&err, true).starts_with("data: {"));
        assert!(terminal_error_record(&err, false).starts_with("\n\ndata: {"));
    }

    #[tokio::test]
    async fn stalled_upstream_hits_idle_timeout() {
        let (channel, body) = ResponseChannel::open(16);
        let upstream: ByteStream = Box::pin(stream::pending::<Result<Bytes, GatewayError>>());

        let outcome = relay_sse(upstream, channel, Duration::from_millis(20)).await;

        assert!(matches!(outcome, RelayOutcome::UpstreamFailed(_)));
        assert!(read_all(body).await.contains("no upstream data"));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn client_disconnect_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let upstream: ByteStream = Box::pin(stream::repeat(()).map(move |_| {
            let _held = &flag;
            Ok::<_, GatewayError>(Bytes::from_static(b"data: {}\n\n"))
        }));

        let (channel, body) = ResponseChannel::open(1);
        drop(body);

        let outcome = relay_sse(upstream, channel, IDLE).await;

        assert!(matches!(outcome, RelayOutcome::ClientDisconnected));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn client_disconnect_during_stall_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let upstream: ByteStream = Box::pin(
            stream::pending::<Result<Bytes, GatewayError>>().map(move |item| {
                let _held = &flag;
                item
            }),
        );

        let (channel, body) = ResponseChannel::open(1);
        let relay = tokio::spawn(relay_sse(upstream, channel, Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(body);

        let outcome = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay kept waiting on a stalled upstream")
            .unwrap();

        assert!(matches!(outcome, RelayOutcome::ClientDisconnected));
        assert!(released.load(Ordering::SeqCst));
    }
}
