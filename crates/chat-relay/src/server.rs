//! Actix Web HTTP server.
//!
//! Every route is served both unprefixed and under the configured prefix:
//! - `POST /chat-sse`
//! - `POST /chat-process`
//! - `POST /config`
//! - `POST /session`
//! - `POST /verify`
//!
//! plus `GET /health`.

use crate::{
    channel::ResponseChannel,
    chunked::{self, CompletionSource, UpstreamCompletion},
    config::GatewayConfig,
    conversation::{self, ResolvedConversation},
    error::GatewayError,
    guard::{self, RateLimiter, Unlimited},
    relay,
    types::{ApiResponse, ChatRequest, SessionInfo, VerifyRequest},
    upstream::{CompletionRequest, UpstreamClient},
};
use actix_cors::Cors;
use actix_web::{
    http::header::{HeaderName, HeaderValue, CACHE_CONTROL},
    web, App, HttpRequest, HttpResponse, HttpServer, ResponseError,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const PROMPT_REQUIRED_MESSAGE: &str = "Prompt is required";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub upstream: UpstreamClient,
    pub completion: Arc<dyn CompletionSource>,
    pub limiter: Arc<dyn RateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>) -> Result<Self> {
        let upstream = UpstreamClient::new(config.clone())?;
        let completion = Arc::new(UpstreamCompletion::new(upstream.clone()));
        Ok(Self {
            config,
            upstream,
            completion,
            limiter: Arc::new(Unlimited),
        })
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionSource>) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let prefix = config.route_prefix();
    info!(addr = %addr, prefix = %prefix, deployment = %config.deployment(), "chat-relay listening");

    let state = web::Data::new(AppState::new(Arc::new(config))?);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(app_config(&prefix))
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

/// Register the gateway's routes under `prefix` and at the root.
pub fn app_config(prefix: &str) -> impl FnOnce(&mut web::ServiceConfig) {
    let prefix = prefix.to_string();
    move |cfg| {
        cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
            GatewayError::ClientInput(format!("Invalid request body: {}", err)).into()
        }));
        if !prefix.is_empty() {
            cfg.service(web::scope(&prefix).configure(routes));
        }
        routes(cfg);
        cfg.route("/health", web::get().to(health_check));
    }
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/chat-sse", web::post().to(handle_chat_sse))
        .route("/chat-process", web::post().to(handle_chat_process))
        .route("/config", web::post().to(handle_config))
        .route("/session", web::post().to(handle_session))
        .route("/verify", web::post().to(handle_verify));
}

async fn health_check() -> &'static str {
    "OK"
}

fn admit(state: &AppState, req: &HttpRequest, limited: bool) -> Result<(), HttpResponse> {
    guard::authorize(&state.config, req).map_err(|e| e.error_response())?;
    if limited {
        guard::rate_limit(state.limiter.as_ref(), req)?;
    }
    Ok(())
}

fn with_conversation_header(
    mut response: HttpResponse,
    conversation: &ResolvedConversation,
) -> HttpResponse {
    if let Some((name, value)) = conversation.header() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn handle_chat_sse(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ChatRequest>,
) -> HttpResponse {
    if let Err(rejection) = admit(&state, &req, true) {
        return rejection;
    }

    let chat = body.into_inner();
    let Some(prompt) = chat.prompt() else {
        return GatewayError::ClientInput(PROMPT_REQUIRED_MESSAGE.to_string()).error_response();
    };

    let conversation = conversation::resolve(chat.csid.as_deref());
    debug!(
        conversation_id = %conversation.id,
        is_new = conversation.is_new,
        "chat-sse request"
    );

    let upstream = match state.upstream.complete_stream(prompt, &conversation.id).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(error = %e, conversation_id = %conversation.id, "upstream unavailable");
            return with_conversation_header(e.error_response(), &conversation);
        }
    };

    if !upstream.is_success() {
        let status = upstream.status;
        let body = upstream.into_text().await;
        warn!(%status, body = %body, "upstream returned non-success status");
        let err = GatewayError::UpstreamNonSuccess { status, body };
        return with_conversation_header(err.error_response(), &conversation);
    }

    let (channel, response_body) = ResponseChannel::open(state.config.channel_capacity);
    let idle_timeout = state.config.stream_idle_timeout();
    actix_rt::spawn(async move {
        relay::relay_sse(upstream.body, channel, idle_timeout)
            .await
            .log("/chat-sse");
    });

    let response = HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(response_body);
    with_conversation_header(response, &conversation)
}

async fn handle_chat_process(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ChatRequest>,
) -> HttpResponse {
    if let Err(rejection) = admit(&state, &req, true) {
        return rejection;
    }

    let chat = body.into_inner();
    let Some(prompt) = chat.prompt() else {
        return GatewayError::ClientInput(PROMPT_REQUIRED_MESSAGE.to_string()).error_response();
    };

    let request = CompletionRequest {
        prompt: prompt.to_string(),
        system_message: chat.system_message.clone(),
        temperature: chat.temperature,
        top_p: chat.top_p,
        conversation_id: chat.options.conversation_id.clone().or(chat.csid.clone()),
        parent_message_id: chat.options.parent_message_id.clone(),
    };

    let (channel, response_body) = ResponseChannel::open(state.config.channel_capacity);
    let idle_timeout = state.config.stream_idle_timeout();
    let completion = state.completion.clone();
    actix_rt::spawn(async move {
        chunked::relay_fragments(completion, request, channel, idle_timeout)
            .await
            .log("/chat-process");
    });

    HttpResponse::Ok()
        .content_type("application/octet-stream")
        .streaming(response_body)
}

async fn handle_config(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(rejection) = admit(&state, &req, false) {
        return rejection;
    }
    HttpResponse::Ok().json(ApiResponse::success("", Some(state.config.snapshot())))
}

async fn handle_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(
        "",
        Some(SessionInfo {
            auth: state.config.has_auth(),
            model: state.config.model.clone(),
        }),
    ))
}

async fn handle_verify(
    state: web::Data<AppState>,
    body: Option<web::Json<VerifyRequest>>,
) -> HttpResponse {
    let token = body
        .as_ref()
        .and_then(|b| b.token.as_deref())
        .map(str::trim)
        .unwrap_or_default();

    let response = if token.is_empty() {
        ApiResponse::<()>::fail("Secret key is empty")
    } else if state.config.auth_secret.as_deref() != Some(token) {
        ApiResponse::fail("Secret key is invalid")
    } else {
        ApiResponse::success("Verify successfully", None)
    };
    HttpResponse::Ok().json(response)
}
