//! Axum HTTP server.
//!
//! Public surface:
//! - `POST /v1/chat/completions` — OpenAI dialect
//! - `POST /v1/messages` (+ `/count_tokens`) — Anthropic dialect
//! - `POST /v1beta/models/{model}:generateContent` /
//!   `:streamGenerateContent` — Google-native dialect
//! - `GET /v1/models`, `GET /health`, `GET /account-limits`
//! - `GET|POST /api/gateway/config` — system instruction
//!
//! Every chat route normalises to the Anthropic-format internal
//! representation (OpenAI via the compat layer, Google taken as-is),
//! translates to the upstream dialect, and renders the response back in
//! the caller's dialect, streaming or merged.

use crate::accounts::AccountPool;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{fallback_model, ModelFamily, KNOWN_MODELS};
use crate::openai::{anthropic_to_openai_response, openai_to_anthropic};
use crate::session::{derive_session_id, derive_session_id_google};
use crate::signature::SignatureCache;
use crate::streaming;
use crate::translation::{
    anthropic_to_google, ensure_system_instruction, google_response_to_anthropic, scrub_request,
    ConvertContext,
};
use crate::types::{MessagesRequest, TokenCountRequest, TokenCountResponse};
use crate::upstream::{FrameStream, UpstreamClient};
use anyhow::{Context, Result};
use async_stream::stream;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    config: GatewayConfig,
    pool: Arc<AccountPool>,
    cache: Arc<SignatureCache>,
    upstream: Arc<UpstreamClient>,
}

/// Which error envelope a failed request gets.
#[derive(Clone, Copy)]
enum Dialect {
    OpenAi,
    Anthropic,
    Google,
}

impl Dialect {
    fn error_body(self, err: &GatewayError) -> Value {
        match self {
            Dialect::OpenAi => err.to_openai_body(),
            Dialect::Anthropic => err.to_anthropic_body(),
            Dialect::Google => err.to_google_body(),
        }
    }

    fn error_event(self, err: &GatewayError) -> String {
        match self {
            Dialect::Anthropic => streaming::sse_event("error", &self.error_body(err)),
            Dialect::OpenAi | Dialect::Google => streaming::sse_data(&self.error_body(err)),
        }
    }
}

fn error_response(dialect: Dialect, err: GatewayError) -> Response<Body> {
    let status = err.status_code();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        error!(error = %err, "request failed");
    }
    let body = dialect.error_body(&err);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Create the gateway router.
pub fn create_app(config: GatewayConfig) -> Router {
    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(15))
        .build()
        .expect("failed to build reqwest client");

    let pool = Arc::new(AccountPool::load(&config, http.clone()));
    let cache = Arc::new(SignatureCache::default());
    let upstream = Arc::new(UpstreamClient::new(http, pool.clone()));

    let state = AppState {
        config,
        pool,
        cache,
        upstream,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(handle_openai))
        .route("/v1/messages", post(handle_anthropic))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/v1beta/models/:model_action", post(handle_google_native))
        .route("/account-limits", get(handle_account_limits))
        .route(
            "/api/gateway/config",
            get(read_gateway_config).post(write_gateway_config),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the gateway.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = create_app(config);
    info!(%addr, "antigravity-gateway listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_models() -> impl IntoResponse {
    let data: Vec<Value> = KNOWN_MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "antigravity",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn handle_account_limits(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.limits_snapshot().await)
}

async fn read_gateway_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"systemInstruction": state.config.system_instruction()}))
}

async fn write_gateway_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response<Body> {
    if let Some(expected) = &state.config.webui_password {
        let supplied = headers
            .get("x-webui-password")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if supplied != expected {
            return error_response(
                Dialect::Google,
                GatewayError::Auth("invalid gateway password".to_string()),
            );
        }
    }

    let instruction = body
        .get("systemInstruction")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match state.config.store_system_instruction(instruction) {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => error_response(Dialect::Google, err),
    }
}

/// Dispatch with one optional fallback hop when the pool is exhausted for
/// the primary model. The rebuild closure re-derives the Google request
/// for the alternate model (thinking config differs per family).
async fn dispatch_with_fallback<F>(
    state: &AppState,
    model: &str,
    request: Value,
    session_id: &str,
    rebuild: F,
) -> Result<(String, FrameStream), GatewayError>
where
    F: FnOnce(&str) -> Result<Value, GatewayError>,
{
    match state.upstream.dispatch(model, request, session_id).await {
        Ok(frames) => Ok((model.to_string(), frames)),
        Err(GatewayError::NoAccounts { .. }) if state.config.fallback_enabled => {
            let Some(alternate) = fallback_model(model) else {
                return Err(GatewayError::NoAccounts {
                    model: model.to_string(),
                });
            };
            info!(model, alternate, "pool exhausted, falling back");
            let rebuilt = rebuild(alternate)?;
            // Fallback is a single hop: the retry here never recurses.
            let frames = state
                .upstream
                .dispatch(alternate, rebuilt, session_id)
                .await?;
            Ok((alternate.to_string(), frames))
        }
        Err(err) => Err(err),
    }
}

/// Stream SSE to the caller, converting a mid-stream failure into one
/// trailing error event instead of an aborted connection.
fn sse_response(
    translated: impl Stream<Item = Result<String, GatewayError>> + Send + 'static,
    dialect: Dialect,
) -> Response<Body> {
    let body_stream = stream! {
        futures::pin_mut!(translated);
        while let Some(item) = translated.next().await {
            match item {
                Ok(frame) => yield Ok::<Bytes, Infallible>(Bytes::from(frame)),
                Err(err) => {
                    error!(error = %err, "stream failed mid-flight");
                    yield Ok(Bytes::from(dialect.error_event(&err)));
                    break;
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn handle_anthropic(
    State(state): State<AppState>,
    Json(req): Json<MessagesRequest>,
) -> Response<Body> {
    run_messages(state, req, Dialect::Anthropic).await
}

async fn handle_openai(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response<Body> {
    let req = match openai_to_anthropic(&body) {
        Ok(req) => req,
        Err(err) => return error_response(Dialect::OpenAi, err),
    };
    run_messages(state, req, Dialect::OpenAi).await
}

/// Shared core for both public chat dialects.
async fn run_messages(state: AppState, req: MessagesRequest, dialect: Dialect) -> Response<Body> {
    let session_id = derive_session_id(&req);
    let system_instruction = state.config.system_instruction();
    let ctx = ConvertContext {
        session_id: &session_id,
        system_instruction: &system_instruction,
        cache: &state.cache,
    };

    let google_request = match anthropic_to_google(&req, &ctx) {
        Ok(request) => request,
        Err(err) => return error_response(dialect, err),
    };

    let rebuild = |alternate: &str| {
        let mut alt_req = req.clone();
        alt_req.model = alternate.to_string();
        anthropic_to_google(&alt_req, &ctx)
    };

    let (served_model, frames) = match dispatch_with_fallback(
        &state,
        &req.model,
        google_request,
        &session_id,
        rebuild,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(dialect, err),
    };

    if req.wants_stream() {
        return match dialect {
            Dialect::OpenAi => sse_response(
                streaming::openai_sse(frames, served_model, session_id, state.cache.clone()),
                dialect,
            ),
            _ => sse_response(
                streaming::anthropic_sse(frames, served_model, session_id, state.cache.clone()),
                dialect,
            ),
        };
    }

    let merged = match collect_frames(frames).await {
        Ok(frame) => frame,
        Err(err) => return error_response(dialect, err),
    };

    let response = match google_response_to_anthropic(&merged, &served_model, &ctx) {
        Ok(response) => response,
        Err(err) => return error_response(dialect, err),
    };

    match dialect {
        Dialect::OpenAi => Json(anthropic_to_openai_response(&response)).into_response(),
        _ => Json(response).into_response(),
    }
}

async fn collect_frames(mut frames: FrameStream) -> Result<Value, GatewayError> {
    let mut collected = Vec::new();
    while let Some(frame) = frames.next().await {
        collected.push(frame?);
    }
    crate::upstream::merge_frames(collected)
}

async fn handle_google_native(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(mut request): Json<Value>,
) -> Response<Body> {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            Dialect::Google,
            GatewayError::Translation(format!("malformed model path: {}", model_action)),
        );
    };
    // On the stream route, `alt=sse` toggles SSE framing; without it the
    // chunks are merged into a single frame just like generateContent.
    let wants_sse = match action {
        "generateContent" => false,
        "streamGenerateContent" => params.get("alt").map(String::as_str) == Some("sse"),
        other => {
            return error_response(
                Dialect::Google,
                GatewayError::Translation(format!("unsupported action: {}", other)),
            );
        }
    };

    let session_id = derive_session_id_google(&request);
    ensure_system_instruction(&mut request, &state.config.system_instruction());
    scrub_request(&mut request);

    let model = model.to_string();
    let (_served_model, frames) = match dispatch_with_fallback(
        &state,
        &model,
        request.clone(),
        &session_id,
        |alternate| {
            let mut rebuilt = request.clone();
            adapt_thinking_config(&mut rebuilt, alternate);
            Ok(rebuilt)
        },
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(Dialect::Google, err),
    };

    if wants_sse {
        return sse_response(streaming::google_sse(frames), Dialect::Google);
    }

    match collect_frames(frames).await {
        Ok(frame) => Json(frame).into_response(),
        Err(err) => error_response(Dialect::Google, err),
    }
}

/// Claude models take `thinkingBudget`, Gemini 3 takes `thinkingLevel`;
/// crossing families during fallback must not carry the wrong knob.
fn adapt_thinking_config(request: &mut Value, model: &str) {
    let Some(thinking) = request
        .get_mut("generationConfig")
        .and_then(|c| c.get_mut("thinkingConfig"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    match ModelFamily::from_model(model) {
        ModelFamily::Claude => {
            if thinking.remove("thinkingLevel").is_some() {
                thinking.entry("thinkingBudget").or_insert(json!(8192));
            }
        }
        ModelFamily::Gemini => {
            if thinking.remove("thinkingBudget").is_some() {
                thinking.entry("thinkingLevel").or_insert(json!("high"));
            }
        }
    }
}

async fn handle_count_tokens(
    State(_state): State<AppState>,
    Json(req): Json<TokenCountRequest>,
) -> impl IntoResponse {
    // The upstream has no counting endpoint; estimate locally at the
    // conventional four characters per token.
    let mut chars = req
        .system
        .as_ref()
        .map(|s| s.to_plaintext().len())
        .unwrap_or(0);
    for message in &req.messages {
        chars += message.content.to_plaintext().len();
    }
    if let Some(tools) = &req.tools {
        for tool in tools {
            chars += tool.name.len();
            chars += tool.description.as_ref().map(String::len).unwrap_or(0);
            chars += tool.input_schema.to_string().len();
        }
    }
    Json(TokenCountResponse {
        input_tokens: (chars / 4).max(1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_config_adapts_across_families() {
        let mut request = json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 4096, "includeThoughts": true}}
        });
        adapt_thinking_config(&mut request, "gemini-3-pro");
        let thinking = &request["generationConfig"]["thinkingConfig"];
        assert!(thinking.get("thinkingBudget").is_none());
        assert_eq!(thinking["thinkingLevel"], "high");
        assert_eq!(thinking["includeThoughts"], true);

        adapt_thinking_config(&mut request, "claude-opus-4-5-thinking");
        let thinking = &request["generationConfig"]["thinkingConfig"];
        assert!(thinking.get("thinkingLevel").is_none());
        assert_eq!(thinking["thinkingBudget"], 8192);
    }
}
