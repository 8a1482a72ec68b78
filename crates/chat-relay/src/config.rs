//! Configuration from environment variables and an optional YAML file.
//!
//! Configuration is read once at startup and handed to every component as an
//! `Arc<GatewayConfig>`; handlers never consult the environment themselves.
//!
//! **Environment variables:**
//! - `PORT`: server port (default: 3002)
//! - `HOST`: bind address (default: 0.0.0.0)
//! - `API_PREFIX`: prefix the routes are also served under (default: /api)
//! - `AZURE_OPENAI_ENDPOINT`: resource endpoint, e.g. `https://example.openai.azure.com`
//! - `AZURE_OPENAI_API_KEY`: key sent in the `api-key` header
//! - `AZURE_OPENAI_API_VERSION`: `api-version` query value (default: 2023-05-15)
//! - `AZURE_OPENAI_MODEL`: model name reported to clients (default: gpt-35-turbo)
//! - `AUTH_SECRET_KEY`: when set, protected routes require `Authorization: Bearer <key>`
//! - `SYSTEM_MESSAGE`: system prompt for `/chat-sse` and the `/chat-process` default
//! - `MAX_TOKENS`: upstream `max_tokens` bound (default: 800)
//! - `REQUEST_TIMEOUT_SECS`: total upstream request timeout (default: 120)
//! - `STREAM_IDLE_TIMEOUT_SECS`: longest wait for the next upstream chunk (default: 60)
//!
//! The YAML file may override any of these and extend the model-to-deployment
//! mapping:
//!
//! ```yaml
//! model: gpt-4
//! deployments:
//!   gpt-4: prod-gpt4
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::ConfigSnapshot;

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are an AI assistant that helps people find information.";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub model: String,
    pub deployments: HashMap<String, String>,
    pub auth_secret: Option<String>,
    pub system_message: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    api_prefix: Option<String>,
    endpoint: Option<String>,
    api_version: Option<String>,
    model: Option<String>,
    #[serde(default)]
    deployments: HashMap<String, String>,
    system_message: Option<String>,
    max_tokens: Option<u32>,
    request_timeout_secs: Option<u64>,
    stream_idle_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let deployments = [("gpt-35-turbo", "gpt-35-turbo"), ("gpt-4", "gpt-4")]
            .into_iter()
            .map(|(m, d)| (m.to_string(), d.to_string()))
            .collect();

        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            api_prefix: "/api".to_string(),
            endpoint: String::new(),
            api_key: String::new(),
            api_version: "2023-05-15".to_string(),
            model: "gpt-35-turbo".to_string(),
            deployments,
            auth_secret: None,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            max_tokens: 800,
            request_timeout_secs: 120,
            stream_idle_timeout_secs: 60,
            channel_capacity: 32,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset or unparsable
    /// values fall back to the defaults; empty strings count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            api_prefix: lookup("API_PREFIX").unwrap_or(defaults.api_prefix),
            endpoint: lookup("AZURE_OPENAI_ENDPOINT").unwrap_or(defaults.endpoint),
            api_key: lookup("AZURE_OPENAI_API_KEY").unwrap_or(defaults.api_key),
            api_version: lookup("AZURE_OPENAI_API_VERSION").unwrap_or(defaults.api_version),
            model: lookup("AZURE_OPENAI_MODEL").unwrap_or(defaults.model),
            deployments: defaults.deployments,
            auth_secret: lookup("AUTH_SECRET_KEY"),
            system_message: lookup("SYSTEM_MESSAGE").unwrap_or(defaults.system_message),
            max_tokens: parsed(&lookup, "MAX_TOKENS").unwrap_or(defaults.max_tokens),
            request_timeout_secs: parsed(&lookup, "REQUEST_TIMEOUT_SECS")
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(defaults.request_timeout_secs),
            stream_idle_timeout_secs: parsed(&lookup, "STREAM_IDLE_TIMEOUT_SECS")
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(defaults.stream_idle_timeout_secs),
            channel_capacity: defaults.channel_capacity,
        }
    }

    /// Overlay values from a YAML file. Secrets are only taken from the
    /// environment.
    pub fn with_yaml_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let yaml: YamlConfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;

        if let Some(v) = yaml.host {
            self.host = v;
        }
        if let Some(v) = yaml.port {
            self.port = v;
        }
        if let Some(v) = yaml.api_prefix {
            self.api_prefix = v;
        }
        if let Some(v) = yaml.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = yaml.api_version {
            self.api_version = v;
        }
        if let Some(v) = yaml.model {
            self.model = v;
        }
        if let Some(v) = yaml.system_message {
            self.system_message = v;
        }
        if let Some(v) = yaml.max_tokens {
            self.max_tokens = v;
        }
        // A zero timeout would fail every request; keep the current value.
        if let Some(v) = yaml.request_timeout_secs.filter(|v| *v > 0) {
            self.request_timeout_secs = v;
        }
        if let Some(v) = yaml.stream_idle_timeout_secs.filter(|v| *v > 0) {
            self.stream_idle_timeout_secs = v;
        }
        if let Some(v) = yaml.channel_capacity {
            self.channel_capacity = v.max(1);
        }
        self.deployments.extend(yaml.deployments);

        Ok(self)
    }

    pub fn has_auth(&self) -> bool {
        self.auth_secret.is_some()
    }

    /// Deployment serving the configured model. Unmapped models are assumed
    /// to be deployed under their own name.
    pub fn deployment(&self) -> &str {
        self.deployments
            .get(&self.model)
            .map(|s| s.as_str())
            .unwrap_or(&self.model)
    }

    pub fn endpoint_trimmed(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    pub fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint_trimmed(),
            self.deployment(),
            self.api_version
        )
    }

    /// Normalised route prefix: leading slash, no trailing slash, empty when
    /// routes are only served unprefixed.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.api_prefix.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            api_model: self.model.clone(),
            endpoint: self.endpoint_trimmed().to_string(),
            deployment: self.deployment().to_string(),
            api_version: self.api_version.clone(),
            timeout_ms: self.request_timeout_secs * 1000,
        }
    }
}
