//! Outbound client for the Azure OpenAI chat completions API.
//!
//! Requests are always made with `stream: true` and the response body is
//! handed back as an unbuffered byte stream together with the status code.
//! A non-2xx status is not an error here: callers forward it verbatim. Only a
//! failure to get a response at all becomes [`GatewayError::UpstreamUnavailable`].
//! There are no retries at this layer.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::GatewayConfig;
use crate::conversation::ConversationId;
use crate::error::GatewayError;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.95;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw upstream body, chunk boundaries as received from the network.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

pub struct UpstreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body, e.g. to forward an error response verbatim. A body
    /// that breaks off halfway is returned as far as it was received.
    pub async fn into_text(self) -> String {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(e) => {
                    error!(error = %e, "upstream error body truncated");
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Everything one completion call needs. Unset sampling fields fall back to
/// the fixed defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct PayloadMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionPayload<'a> {
    messages: Vec<PayloadMessage<'a>>,
    temperature: f64,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
    max_tokens: u32,
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl UpstreamClient {
    pub fn new(config: Arc<GatewayConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, config })
    }

    /// Fixed-parameter completion used by the SSE relay.
    pub async fn complete_stream(
        &self,
        prompt: &str,
        conversation_id: &ConversationId,
    ) -> Result<UpstreamResponse, GatewayError> {
        let request = CompletionRequest {
            conversation_id: Some(conversation_id.to_string()),
            ..CompletionRequest::new(prompt)
        };
        self.complete_stream_with(&request).await
    }

    pub async fn complete_stream_with(
        &self,
        request: &CompletionRequest,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = self.config.completions_url();
        let payload = self.build_payload(request);

        debug!(
            url = %url,
            conversation_id = ?request.conversation_id,
            "sending upstream completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "upstream request failed");
                GatewayError::UpstreamUnavailable(e.to_string())
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(|e| GatewayError::StreamFailure(e.to_string()));

        Ok(UpstreamResponse {
            status,
            body: Box::pin(body),
        })
    }

    fn build_payload<'a>(&'a self, request: &'a CompletionRequest) -> ChatCompletionPayload<'a> {
        let system = request
            .system_message
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.config.system_message);

        ChatCompletionPayload {
            messages: vec![
                PayloadMessage {
                    role: "system",
                    content: system,
                },
                PayloadMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: request.top_p.unwrap_or(DEFAULT_TOP_P),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: self.config.max_tokens,
            stop: None,
            stream: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(endpoint: &str) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            endpoint: endpoint.to_string(),
            api_key: "test-key".to_string(),
            system_message: "sys".to_string(),
            ..GatewayConfig::default()
        })
    }

    #[test]
    fn payload_uses_fixed_sampling_defaults() {
        let client = UpstreamClient::new(config_for("http://localhost")).unwrap();
        let request = CompletionRequest::new("hello");
        let payload = serde_json::to_value(client.build_payload(&request)).unwrap();

        assert_eq!(
            payload,
            json!({
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hello"}
                ],
                "temperature": 0.7,
                "top_p": 0.95,
                "frequency_penalty": 0.0,
                "presence_penalty": 0.0,
                "max_tokens": 800,
                "stop": null,
                "stream": true
            })
        );
    }

    #[test]
    fn payload_honours_request_overrides() {
        let client = UpstreamClient::new(config_for("http://localhost")).unwrap();
        let request = CompletionRequest {
            system_message: Some("be terse".to_string()),
            temperature: Some(0.2),
            top_p: Some(1.0),
            ..CompletionRequest::new("hi")
        };
        let payload = serde_json::to_value(client.build_payload(&request)).unwrap();

        assert_eq!(payload["messages"][0]["content"], "be terse");
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["top_p"], 1.0);
    }

    #[tokio::test]
    async fn streams_body_from_deployment_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-35-turbo/chat/completions"))
            .and(query_param("api-version", "2023-05-15"))
            .and(header("api-key", "test-key"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {}\n\ndata: [DONE]\n\n", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(config_for(&server.uri())).unwrap();
        let id = conversation::resolve(Some("c1")).id;
        let response = client.complete_stream("hello", &id).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.into_text().await, "data: {}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn non_success_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"bad key\"}"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(config_for(&server.uri())).unwrap();
        let response = client
            .complete_stream_with(&CompletionRequest::new("hello"))
            .await
            .unwrap();

        assert_eq!(response.status, 401);
        assert!(!response.is_success());
        assert_eq!(response.into_text().await, "{\"error\":\"bad key\"}");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_unavailable() {
        let client = UpstreamClient::new(config_for("http://127.0.0.1:1")).unwrap();
        let err = client
            .complete_stream_with(&CompletionRequest::new("hello"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }
}
