//! Wire types for the gateway's HTTP surface.
//!
//! Field names follow the web client that talks to this gateway: request and
//! response bodies are camelCase, except `top_p` and `csid` which the client
//! sends verbatim.

use serde::{Deserialize, Serialize};

/// Prior-context fields the client echoes back on follow-up turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

/// Request body shared by `/chat-sse` and `/chat-process`.
///
/// `prompt` is optional at the serde level so that a missing prompt surfaces
/// as a JSON `Fail` envelope instead of an extractor rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, alias = "conversationId", skip_serializing_if = "Option::is_none")]
    pub csid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub options: ChatOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, rename = "top_p", alias = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl ChatRequest {
    /// The prompt, if present and not blank.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// One incremental unit of an assistant reply on the `/chat-process` path.
///
/// `text` carries the reply accumulated so far, so a later fragment
/// supersedes every earlier one for the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFragment {
    pub id: String,
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiStatus {
    Success,
    Fail,
    Unauthorized,
}

/// The `{status, message, data}` envelope every JSON endpoint answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ApiStatus,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: ApiStatus::Success,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Fail,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub auth: bool,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

/// Provider configuration exposed by `/config`. Never includes credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub api_model: String,
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub timeout_ms: u64,
}
