//! Streaming conversion (SSE).
//!
//! The upstream always speaks SSE (`data: {json}` frames, each enveloping a
//! Google response chunk). This module turns a stream of unwrapped Google
//! frames into the caller's dialect:
//!
//! - Anthropic callers get `message_start` / `content_block_*` /
//!   `message_delta` / `message_stop` events.
//! - OpenAI callers get `chat.completion.chunk` deltas and a terminal
//!   `data: [DONE]` marker.
//! - Google-native callers get the frames re-serialized as-is.
//!
//! Each upstream chunk produces bounded output; nothing is buffered across
//! chunks beyond the per-block state machine.

use crate::error::GatewayError;
use crate::models::ModelFamily;
use crate::signature::{SignatureCache, SKIP_SIGNATURE_SENTINEL};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;

/// Format one SSE frame with an explicit event name (Anthropic style).
pub fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Format one bare SSE data frame (OpenAI / Google style).
pub fn sse_data(data: &Value) -> String {
    format!("data: {}\n\n", data)
}

/// Split the buffer into the first complete SSE frame and the rest.
/// Frames are separated by a blank line.
pub fn split_sse_frame(buffer: &str) -> Option<(String, String)> {
    let idx = buffer.find("\n\n")?;
    let (frame, rest) = buffer.split_at(idx + 2);
    Some((frame.to_string(), rest.to_string()))
}

/// The payload of a frame's `data:` line, if any.
pub fn extract_data_line(frame: &str) -> Option<&str> {
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim_start());
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Per-stream translation state shared by both dialect translators.
struct PartReader {
    family: ModelFamily,
    session_id: String,
    cache: Arc<SignatureCache>,
    finish_reason: Option<String>,
    saw_tool_use: bool,
    input_tokens: u32,
    output_tokens: u32,
    cached_tokens: u32,
}

impl PartReader {
    fn new(family: ModelFamily, session_id: String, cache: Arc<SignatureCache>) -> Self {
        Self {
            family,
            session_id,
            cache,
            finish_reason: None,
            saw_tool_use: false,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
        }
    }

    fn absorb_frame_metadata(&mut self, frame: &Value) {
        if let Some(reason) = frame
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
        {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(meta) = frame.get("usageMetadata").and_then(Value::as_object) {
            let get = |key: &str| meta.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
            self.cached_tokens = get("cachedContentTokenCount");
            self.input_tokens = get("promptTokenCount").saturating_sub(self.cached_tokens);
            self.output_tokens = get("candidatesTokenCount") + get("thoughtsTokenCount");
        }
    }

    fn remember(&self, signature: &str) {
        self.cache
            .remember(&self.session_id, signature, self.family);
    }

    fn anthropic_stop_reason(&self) -> &'static str {
        if self.saw_tool_use {
            "tool_use"
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        }
    }

    fn openai_finish_reason(&self) -> &'static str {
        if self.saw_tool_use {
            "tool_calls"
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            "length"
        } else {
            "stop"
        }
    }
}

fn frame_parts(frame: &Value) -> Vec<Value> {
    frame
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn part_signature(part: &Value) -> Option<&str> {
    part.get("thoughtSignature")
        .and_then(Value::as_str)
        .or_else(|| {
            part.get("functionCall")
                .and_then(|c| c.get("thoughtSignature"))
                .and_then(Value::as_str)
        })
        .filter(|s| !s.is_empty() && *s != SKIP_SIGNATURE_SENTINEL)
}

/// Translate unwrapped Google frames into Anthropic SSE events.
pub fn anthropic_sse(
    frames: impl Stream<Item = Result<Value, GatewayError>> + Send + 'static,
    model: String,
    session_id: String,
    cache: Arc<SignatureCache>,
) -> impl Stream<Item = Result<String, GatewayError>> + Send {
    let family = ModelFamily::from_model(&model);

    try_stream! {
        let mut reader = PartReader::new(family, session_id, cache);
        let mut block_index: usize = 0;
        let mut open_block: Option<BlockKind> = None;

        let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        yield sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        );

        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            reader.absorb_frame_metadata(&frame);

            for part in frame_parts(&frame) {
                let signature = part_signature(&part).map(str::to_string);

                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    let is_thought =
                        part.get("thought").and_then(Value::as_bool).unwrap_or(false);
                    let wanted = if is_thought { BlockKind::Thinking } else { BlockKind::Text };

                    if open_block != Some(wanted) {
                        if open_block.is_some() {
                            yield sse_event(
                                "content_block_stop",
                                &json!({"type": "content_block_stop", "index": block_index}),
                            );
                            block_index += 1;
                        }
                        open_block = Some(wanted);
                        let content_block = if is_thought {
                            json!({"type": "thinking", "thinking": ""})
                        } else {
                            json!({"type": "text", "text": ""})
                        };
                        yield sse_event(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": content_block
                            }),
                        );
                    }

                    if !text.is_empty() {
                        let delta = if is_thought {
                            json!({"type": "thinking_delta", "thinking": text})
                        } else {
                            json!({"type": "text_delta", "text": text})
                        };
                        yield sse_event(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": delta
                            }),
                        );
                    }

                    if is_thought {
                        if let Some(sig) = &signature {
                            reader.remember(sig);
                            yield sse_event(
                                "content_block_delta",
                                &json!({
                                    "type": "content_block_delta",
                                    "index": block_index,
                                    "delta": {"type": "signature_delta", "signature": sig}
                                }),
                            );
                        }
                    }
                    continue;
                }

                if let Some(call) = part.get("functionCall").and_then(Value::as_object) {
                    let Some(name) = call.get("name").and_then(Value::as_str) else {
                        continue;
                    };

                    // A signature arriving on the call itself becomes a
                    // minimal thinking block so the client can round-trip it.
                    if let Some(sig) = &signature {
                        reader.remember(sig);
                        if open_block != Some(BlockKind::Thinking) {
                            if open_block.is_some() {
                                yield sse_event(
                                    "content_block_stop",
                                    &json!({"type": "content_block_stop", "index": block_index}),
                                );
                                block_index += 1;
                            }
                            yield sse_event(
                                "content_block_start",
                                &json!({
                                    "type": "content_block_start",
                                    "index": block_index,
                                    "content_block": {"type": "thinking", "thinking": ""}
                                }),
                            );
                            open_block = Some(BlockKind::Thinking);
                        }
                        yield sse_event(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": {"type": "signature_delta", "signature": sig}
                            }),
                        );
                    }

                    if open_block.is_some() {
                        yield sse_event(
                            "content_block_stop",
                            &json!({"type": "content_block_stop", "index": block_index}),
                        );
                        block_index += 1;
                        open_block = None;
                    }

                    reader.saw_tool_use = true;
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));

                    yield sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                        }),
                    );
                    let partial = serde_json::to_string(&args)
                        .unwrap_or_else(|_| "{}".to_string());
                    yield sse_event(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "input_json_delta", "partial_json": partial}
                        }),
                    );
                    yield sse_event(
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": block_index}),
                    );
                    block_index += 1;
                }
            }
        }

        if open_block.is_some() {
            yield sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": block_index}),
            );
        }

        yield sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": reader.anthropic_stop_reason(), "stop_sequence": null},
                "usage": {
                    "input_tokens": reader.input_tokens,
                    "output_tokens": reader.output_tokens,
                    "cache_read_input_tokens": reader.cached_tokens
                }
            }),
        );
        yield sse_event("message_stop", &json!({"type": "message_stop"}));
    }
}

/// Translate unwrapped Google frames into OpenAI `chat.completion.chunk`
/// SSE frames ending with `[DONE]`.
pub fn openai_sse(
    frames: impl Stream<Item = Result<Value, GatewayError>> + Send + 'static,
    model: String,
    session_id: String,
    cache: Arc<SignatureCache>,
) -> impl Stream<Item = Result<String, GatewayError>> + Send {
    let family = ModelFamily::from_model(&model);

    try_stream! {
        let mut reader = PartReader::new(family, session_id, cache);
        let completion_id = format!("chatcmpl_{}", uuid::Uuid::new_v4().simple());
        let created = chrono::Utc::now().timestamp();
        let mut sent_role = false;
        let mut tool_call_index: i64 = -1;

        let chunk = |delta: Value, finish: Option<&str>, usage: Option<Value>| {
            let mut out = json!({
                "id": completion_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish,
                }]
            });
            if let Some(usage) = usage {
                out["usage"] = usage;
            }
            out
        };

        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            reader.absorb_frame_metadata(&frame);

            for part in frame_parts(&frame) {
                if let Some(sig) = part_signature(&part) {
                    reader.remember(sig);
                }

                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if text.is_empty() {
                        continue;
                    }
                    let mut delta = serde_json::Map::new();
                    if !sent_role {
                        sent_role = true;
                        delta.insert("role".to_string(), json!("assistant"));
                    }
                    let is_thought =
                        part.get("thought").and_then(Value::as_bool).unwrap_or(false);
                    let key = if is_thought { "reasoning_content" } else { "content" };
                    delta.insert(key.to_string(), json!(text));
                    yield sse_data(&chunk(Value::Object(delta), None, None));
                    continue;
                }

                if let Some(call) = part.get("functionCall").and_then(Value::as_object) {
                    let Some(name) = call.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let mut delta = serde_json::Map::new();
                    if !sent_role {
                        sent_role = true;
                        delta.insert("role".to_string(), json!("assistant"));
                    }
                    reader.saw_tool_use = true;
                    tool_call_index += 1;
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    delta.insert(
                        "tool_calls".to_string(),
                        json!([{
                            "index": tool_call_index,
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": serde_json::to_string(&args)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            }
                        }]),
                    );
                    yield sse_data(&chunk(Value::Object(delta), None, None));
                }
            }
        }

        let usage = json!({
            "prompt_tokens": reader.input_tokens,
            "completion_tokens": reader.output_tokens,
            "total_tokens": reader.input_tokens + reader.output_tokens,
            "prompt_tokens_details": {"cached_tokens": reader.cached_tokens}
        });
        let finish = reader.openai_finish_reason();
        yield sse_data(&chunk(json!({}), Some(finish), Some(usage)));
        yield "data: [DONE]\n\n".to_string();
    }
}

/// Re-serialize unwrapped Google frames for native-dialect callers.
pub fn google_sse(
    frames: impl Stream<Item = Result<Value, GatewayError>> + Send + 'static,
) -> impl Stream<Item = Result<String, GatewayError>> + Send {
    try_stream! {
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            yield sse_data(&frame);
        }
    }
}
