//! Upstream Cloud Code client.
//!
//! Every call goes to `streamGenerateContent?alt=sse`, even for callers
//! that wanted a single response: the non-streaming upstream path has
//! tighter quotas, so non-streaming callers get their chunks merged
//! locally instead.
//!
//! The dispatch loop walks the retry matrix: accounts rotate on rate
//! limits, auth failures, and silent streams (up to three attempts);
//! endpoints rotate on network errors, 404s, and per-endpoint congestion.
//! A stream is only committed to the caller after its first chunk proves
//! non-empty (peek-and-retry); after that, chunks are forwarded as-is.

use crate::accounts::AccountPool;
use crate::error::GatewayError;
use crate::models::{is_image_gen_model, needs_interleaved_thinking_header};
use crate::ratelimit::{parse_rate_limit, QuotaScope};
use crate::streaming::{extract_data_line, split_sse_frame};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upstream hosts, in dispatch order. The primary is always tried first.
pub const UPSTREAM_ENDPOINTS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
];

const STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";
const USER_AGENT: &str = "antigravity/1.18.3";
const API_CLIENT_HEADER: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;
const CLAUDE_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const DEFAULT_PROJECT_ID: &str = "rising-fact-p41fc";

/// How long the first chunk may take before the stream counts as silent.
const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle bound between subsequent chunks of a committed stream.
const CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Account rotation budget per request.
const MAX_ATTEMPTS: usize = 3;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Value, GatewayError>> + Send>>;

/// Build the wrapper envelope the upstream expects around every request.
pub fn wrap_request(project_id: &str, model: &str, request: Value) -> Value {
    let request_type = if is_image_gen_model(model) {
        "image_gen"
    } else {
        "agent"
    };
    json!({
        "project": project_id,
        "model": model,
        "request": request,
        "userAgent": "antigravity",
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "requestType": request_type,
    })
}

/// A first chunk with no candidates is the upstream's zero-token silent
/// failure.
fn frame_is_empty(frame: &Value) -> bool {
    frame
        .get("candidates")
        .and_then(Value::as_array)
        .map(|c| c.is_empty())
        .unwrap_or(true)
}

/// Merge streamed chunks into one response frame for non-streaming
/// callers: the first chunk is the base, `candidates[0].content.parts`
/// concatenate, and the last `usageMetadata` / `finishReason` win.
pub fn merge_frames(frames: Vec<Value>) -> Result<Value, GatewayError> {
    let mut iter = frames.into_iter();
    let mut base = iter.next().ok_or(GatewayError::EmptyStream)?;

    for frame in iter {
        if let Some(parts) = frame
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            let slot = &mut base["candidates"][0]["content"]["parts"];
            match slot.as_array_mut() {
                Some(existing) => existing.extend(parts.iter().cloned()),
                None => *slot = Value::Array(parts.clone()),
            }
        }
        if let Some(reason) = frame
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
        {
            base["candidates"][0]["finishReason"] = reason.clone();
        }
        if let Some(usage) = frame.get("usageMetadata") {
            base["usageMetadata"] = usage.clone();
        }
    }

    Ok(base)
}

pub struct UpstreamClient {
    http: reqwest::Client,
    pool: Arc<AccountPool>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, pool: Arc<AccountPool>) -> Self {
        Self { http, pool }
    }

    /// Dispatch a Google-format `request` for `model`, returning a stream
    /// of unwrapped response frames whose first chunk has been validated.
    pub async fn dispatch(
        &self,
        model: &str,
        mut request: Value,
        session_id: &str,
    ) -> Result<FrameStream, GatewayError> {
        if request.get("sessionId").is_none() {
            request["sessionId"] = json!(session_id);
        }

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let Some(account) = self.pool.pick_next(model, session_id, &tried).await else {
                break;
            };
            tried.push(account.email.clone());

            let token = match self.pool.get_token(&account.email).await {
                Ok(token) => token,
                Err(err) => {
                    warn!(email = %account.email, error = %err, "token unavailable");
                    last_error = Some(err);
                    continue;
                }
            };

            let project = account
                .project_id
                .clone()
                .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
            let envelope = wrap_request(&project, model, request.clone());

            match self
                .try_endpoints(model, &envelope, &token, &account.email, session_id)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(attempt, email = %account.email, error = %err, "attempt failed");
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoAccounts {
            model: model.to_string(),
        }))
    }

    /// Try each upstream host in order for one account.
    async fn try_endpoints(
        &self,
        model: &str,
        envelope: &Value,
        token: &str,
        email: &str,
        session_id: &str,
    ) -> Result<FrameStream, GatewayError> {
        let mut last_error: Option<GatewayError> = None;

        for endpoint in UPSTREAM_ENDPOINTS {
            let url = format!("{}{}", endpoint, STREAM_PATH);

            let mut builder = self
                .http
                .post(&url)
                .header("authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .header("user-agent", USER_AGENT)
                .header("x-goog-api-client", API_CLIENT_HEADER)
                .header("client-metadata", CLIENT_METADATA);
            if needs_interleaved_thinking_header(model) {
                builder = builder.header("anthropic-beta", CLAUDE_THINKING_BETA);
            }

            let response = match builder.json(envelope).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(endpoint, error = %err, "upstream unreachable");
                    last_error = Some(GatewayError::Transport(err.to_string()));
                    continue;
                }
            };

            let status = response.status();

            if status == reqwest::StatusCode::NOT_FOUND {
                debug!(endpoint, model, "model unknown at endpoint");
                last_error = Some(GatewayError::Upstream {
                    status: 404,
                    body: format!("model {} not found at {}", model, endpoint),
                });
                continue;
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                let info = parse_rate_limit(Some(&headers), &body);
                match info.scope {
                    QuotaScope::Endpoint => {
                        warn!(endpoint, "endpoint congested, hopping");
                        last_error = Some(GatewayError::RateLimited {
                            retry_after_secs: info.retry_after.map(|d| d.as_secs()),
                        });
                        continue;
                    }
                    QuotaScope::Account => {
                        self.pool
                            .on_rate_limited(email, model, info.retry_after)
                            .await;
                        return Err(GatewayError::RateLimited {
                            retry_after_secs: info.retry_after.map(|d| d.as_secs()),
                        });
                    }
                }
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Auth(format!(
                    "upstream rejected credentials: {}",
                    body
                )));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }

            // Peek-and-retry: the first chunk must arrive within the
            // window and carry candidates, else the stream is silent.
            let mut frames = Box::pin(frames_from_response(response));
            match timeout(FIRST_CHUNK_TIMEOUT, frames.next()).await {
                Ok(Some(Ok(first))) if !frame_is_empty(&first) => {
                    self.pool.on_success(email, model, session_id).await;
                    let chained = futures::stream::once(async move { Ok(first) }).chain(frames);
                    return Ok(Box::pin(chained));
                }
                Ok(Some(Ok(_))) | Ok(None) => {
                    warn!(endpoint, "silent upstream stream, discarding");
                    return Err(GatewayError::EmptyStream);
                }
                Ok(Some(Err(err))) => {
                    warn!(endpoint, error = %err, "stream failed on first chunk");
                    return Err(err);
                }
                Err(_) => {
                    warn!(endpoint, "first chunk timed out");
                    return Err(GatewayError::EmptyStream);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Transport(
            "no upstream endpoint reachable".to_string(),
        )))
    }

}

/// Decode an upstream SSE body into unwrapped response frames: split on
/// blank lines, take each `data:` payload, JSON-decode, and strip the
/// upstream's `response` envelope.
fn frames_from_response(
    response: reqwest::Response,
) -> impl Stream<Item = Result<Value, GatewayError>> + Send {
    try_stream! {
        let mut buffer = String::new();
        let mut bytes = response.bytes_stream();

        loop {
            let chunk = match timeout(CHUNK_IDLE_TIMEOUT, bytes.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => Err(GatewayError::Transport(e.to_string()))?,
                Ok(None) => break,
                Err(_) => Err(GatewayError::Transport(
                    "upstream stream stalled mid-response".to_string(),
                ))?,
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some((frame, rest)) = split_sse_frame(&buffer) {
                buffer = rest;
                let Some(data) = extract_data_line(&frame) else {
                    continue;
                };
                if data.trim().is_empty() || data.trim() == "[DONE]" {
                    continue;
                }
                let value: Value = serde_json::from_str(data).map_err(|e| {
                    GatewayError::Transport(format!("bad upstream SSE payload: {}", e))
                })?;
                yield unwrap_envelope(value);
            }
        }
    }
}

/// The upstream wraps each payload as `{"response": {...}}`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => obj.remove("response").unwrap_or(Value::Object(obj)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_exactly_the_wrapper_fields() {
        let envelope = wrap_request("proj-1", "gemini-3-pro", json!({"contents": []}));
        let obj = envelope.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["model", "project", "request", "requestId", "requestType", "userAgent"]
        );
        assert_eq!(envelope["userAgent"], "antigravity");
        assert_eq!(envelope["requestType"], "agent");
        assert!(envelope["requestId"]
            .as_str()
            .unwrap()
            .starts_with("agent-"));
    }

    #[test]
    fn image_models_get_image_gen_request_type() {
        let envelope = wrap_request("proj-1", "gemini-3-pro-image", json!({}));
        assert_eq!(envelope["requestType"], "image_gen");
    }

    #[test]
    fn merge_concatenates_parts_and_takes_last_usage() {
        let frames = vec![
            json!({
                "candidates": [{"content": {"parts": [{"text": "po"}], "role": "model"}}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1}
            }),
            json!({
                "candidates": [{"content": {"parts": [{"text": "ng"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
            }),
        ];
        let merged = merge_frames(frames).unwrap();
        let parts = merged["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "po");
        assert_eq!(parts[1]["text"], "ng");
        assert_eq!(merged["candidates"][0]["finishReason"], "STOP");
        assert_eq!(merged["usageMetadata"]["candidatesTokenCount"], 2);
    }

    #[test]
    fn merge_of_nothing_is_an_empty_stream() {
        assert!(matches!(
            merge_frames(Vec::new()),
            Err(GatewayError::EmptyStream)
        ));
    }

    #[test]
    fn empty_first_frames_are_detected() {
        assert!(frame_is_empty(&json!({})));
        assert!(frame_is_empty(&json!({"candidates": []})));
        assert!(!frame_is_empty(
            &json!({"candidates": [{"content": {"parts": [{"text": "x"}]}}]})
        ));
    }

    #[test]
    fn envelope_unwrapping() {
        let wrapped = json!({"response": {"candidates": [{"x": 1}]}});
        assert_eq!(
            unwrap_envelope(wrapped),
            json!({"candidates": [{"x": 1}]})
        );
        let bare = json!({"candidates": []});
        assert_eq!(unwrap_envelope(bare.clone()), bare);
    }
}
