//! Newline-delimited JSON relay for `/chat-process`.
//!
//! A [`CompletionSource`] produces a finite stream of [`ChatFragment`]s. Each
//! fragment is written as one JSON record: the first bare, every later one
//! prefixed with `\n`. Fragments carry the accumulated reply, so clients only
//! need to parse the last complete line.
//!
//! Errors cannot change the status once the first byte is out. The error's
//! JSON is written as the final record and the response is closed.

use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::channel::ResponseChannel;
use crate::error::GatewayError;
use crate::relay::RelayOutcome;
use crate::types::ChatFragment;
use crate::upstream::{ByteStream, CompletionRequest, UpstreamClient};

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<ChatFragment, GatewayError>> + Send>>;

/// Produces the fragments of one assistant reply.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<FragmentStream, GatewayError>;
}

/// [`CompletionSource`] backed by the upstream chat completions API.
pub struct UpstreamCompletion {
    client: UpstreamClient,
}

impl UpstreamCompletion {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CompletionSource for UpstreamCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<FragmentStream, GatewayError> {
        let response = self.client.complete_stream_with(&request).await?;
        if !response.is_success() {
            let status = response.status;
            let body = response.into_text().await;
            return Err(GatewayError::UpstreamNonSuccess { status, body });
        }
        Ok(Box::pin(fragments_from_sse(response.body, request)))
    }
}

fn stream_error(err: EventStreamError<GatewayError>) -> GatewayError {
    match err {
        EventStreamError::Transport(e) => e,
        other => GatewayError::StreamFailure(other.to_string()),
    }
}

/// Turn a chat-completions SSE body into accumulating reply fragments.
///
/// Events without a content delta (role announcements, content-filter
/// results) are skipped; `[DONE]` ends the stream.
pub fn fragments_from_sse(
    body: ByteStream,
    request: CompletionRequest,
) -> impl Stream<Item = Result<ChatFragment, GatewayError>> + Send {
    try_stream! {
        let mut events = Box::pin(body.eventsource());
        let mut text = String::new();
        let mut message_id: Option<String> = None;

        while let Some(event) = events.next().await {
            let event = event.map_err(stream_error)?;
            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: Value = serde_json::from_str(data).map_err(|e| {
                GatewayError::StreamFailure(format!("invalid upstream event: {}", e))
            })?;

            if message_id.is_none() {
                message_id = chunk
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }

            let delta = match chunk.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
                Some(delta) => delta.to_string(),
                None => continue,
            };
            text.push_str(&delta);

            let id = message_id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();

            yield ChatFragment {
                id,
                role: "assistant".to_string(),
                text: text.clone(),
                delta: Some(delta),
                conversation_id: request.conversation_id.clone(),
                parent_message_id: request.parent_message_id.clone(),
                detail: Some(chunk),
            };
        }
    }
}

/// One newline-delimited record.
pub fn encode_record(fragment: &ChatFragment, first: bool) -> Result<String, GatewayError> {
    let json = serde_json::to_string(fragment)
        .map_err(|e| GatewayError::StreamFailure(format!("failed to encode fragment: {}", e)))?;
    Ok(if first { json } else { format!("\n{}", json) })
}

fn error_record(err: &GatewayError, first: bool) -> String {
    if first {
        err.to_json().to_string()
    } else {
        format!("\n{}", err.to_json())
    }
}

/// Drive `source` for `request` and write its fragments to `channel`. The
/// channel is closed when this returns, whatever the outcome.
pub async fn relay_fragments(
    source: Arc<dyn CompletionSource>,
    request: CompletionRequest,
    mut channel: ResponseChannel,
    idle_timeout: Duration,
) -> RelayOutcome {
    let mut records = 0usize;

    let mut fragments = match source.complete(request).await {
        Ok(fragments) => fragments,
        Err(err) => {
            let outcome = match channel.write(error_record(&err, true)).await {
                Ok(()) => RelayOutcome::UpstreamFailed(err),
                Err(_) => RelayOutcome::ClientDisconnected,
            };
            channel.close();
            return outcome;
        }
    };

    let outcome = loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, fragments.next()) => match next {
                Ok(next) => next,
                Err(_) => Some(Err(GatewayError::StreamFailure(format!(
                    "no completion data for {}s",
                    idle_timeout.as_secs_f32()
                )))),
            },
            _ = channel.closed() => break RelayOutcome::ClientDisconnected,
        };

        let err = match next {
            Some(Ok(fragment)) => match encode_record(&fragment, records == 0) {
                Ok(record) => {
                    if channel.write(record).await.is_err() {
                        break RelayOutcome::ClientDisconnected;
                    }
                    records += 1;
                    continue;
                }
                Err(err) => err,
            },
            Some(Err(err)) => err,
            None => {
                break RelayOutcome::Completed {
                    chunks: records,
                    bytes: channel.bytes_written(),
                }
            }
        };

        if channel.write(error_record(&err, records == 0)).await.is_err() {
            break RelayOutcome::ClientDisconnected;
        }
        break RelayOutcome::UpstreamFailed(err);
    };

    drop(fragments);
    channel.close();
    outcome
}
