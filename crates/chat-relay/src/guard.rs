//! Access checks in front of the protected routes.
//!
//! Authentication is a shared secret compared against the bearer token.
//! Rate limiting is delegated to a [`RateLimiter`]; the gateway only acts on
//! its verdict.

use actix_web::http::header::AUTHORIZATION;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use tracing::warn;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, AUTH_FAILURE_MESSAGE};
use crate::types::ApiResponse;

pub const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

/// Pass/fail verdict for one request from `client_key`.
pub trait RateLimiter: Send + Sync {
    fn check(&self, client_key: &str) -> bool;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _client_key: &str) -> bool {
        true
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Succeeds when no secret is configured or the bearer token matches it.
pub fn authorize(config: &GatewayConfig, req: &HttpRequest) -> Result<(), GatewayError> {
    let Some(secret) = config.auth_secret.as_deref() else {
        return Ok(());
    };
    match bearer_token(req) {
        Some(token) if token == secret => Ok(()),
        _ => {
            warn!(path = req.path(), "rejected unauthenticated request");
            Err(GatewayError::AuthFailure(AUTH_FAILURE_MESSAGE.to_string()))
        }
    }
}

pub fn client_key(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

pub fn rate_limit(limiter: &dyn RateLimiter, req: &HttpRequest) -> Result<(), HttpResponse> {
    let key = client_key(req);
    if limiter.check(&key) {
        return Ok(());
    }
    warn!(client = %key, path = req.path(), "rate limited");
    Err(HttpResponse::build(StatusCode::TOO_MANY_REQUESTS)
        .json(ApiResponse::<()>::fail(RATE_LIMITED_MESSAGE)))
}
