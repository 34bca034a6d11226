//! Gateway error taxonomy.
//!
//! Errors fall into the classes the retry matrix cares about: rate limits
//! rotate accounts, transport and silent-stream failures rotate endpoints
//! and accounts, auth failures disable the account, translation failures
//! abort locally. Anything else from the upstream is propagated with its
//! original status where possible.

use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited upstream{}", retry_suffix(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid request: {0}")]
    Translation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream produced an empty stream")]
    EmptyStream,

    #[error("no account available for model {model}")]
    NoAccounts { model: String },

    #[error("configuration error: {0}")]
    Config(String),
}

fn retry_suffix(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(", retry after {}s", secs),
        None => String::new(),
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl GatewayError {
    /// Whether the retry matrix (another endpoint, another account) may
    /// still resolve this request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transport(_) | Self::EmptyStream
        )
    }

    /// The status surfaced to the caller once retries are exhausted.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } | Self::NoAccounts { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Translation(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) | Self::EmptyStream => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } | Self::NoAccounts { .. } => "rate_limit_error",
            Self::Auth(_) => "authentication_error",
            Self::Translation(_) => "invalid_request_error",
            Self::Upstream { .. } => "api_error",
            Self::Transport(_) | Self::EmptyStream => "overloaded_error",
            Self::Config(_) => "api_error",
        }
    }

    /// A parseable upstream JSON error body is propagated verbatim.
    fn upstream_json(&self) -> Option<Value> {
        if let Self::Upstream { body, .. } = self {
            serde_json::from_str::<Value>(body)
                .ok()
                .filter(|v| v.get("error").is_some())
        } else {
            None
        }
    }

    /// Anthropic-dialect error envelope.
    pub fn to_anthropic_body(&self) -> Value {
        if let Some(upstream) = self.upstream_json() {
            return upstream;
        }
        json!({
            "type": "error",
            "error": {"type": self.kind(), "message": self.to_string()}
        })
    }

    /// OpenAI-dialect error envelope.
    pub fn to_openai_body(&self) -> Value {
        if let Some(upstream) = self.upstream_json() {
            return upstream;
        }
        json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "code": self.status_code().as_u16()
            }
        })
    }

    /// Google-dialect error envelope.
    pub fn to_google_body(&self) -> Value {
        if let Some(upstream) = self.upstream_json() {
            return upstream;
        }
        json!({
            "error": {
                "code": self.status_code().as_u16(),
                "message": self.to_string(),
                "status": match self.status_code() {
                    StatusCode::TOO_MANY_REQUESTS => "RESOURCE_EXHAUSTED",
                    StatusCode::UNAUTHORIZED => "UNAUTHENTICATED",
                    StatusCode::BAD_REQUEST => "INVALID_ARGUMENT",
                    _ => "UNAVAILABLE",
                }
            }
        })
    }
}
