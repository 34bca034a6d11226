//! Anthropic <-> Google translation.
//!
//! This module implements the core format conversions:
//! - Anthropic `/v1/messages` request -> Google generative-content JSON
//!   (the upstream's native dialect)
//! - Google response frame -> Anthropic `/v1/messages` response
//!
//! The forward direction also enforces the signature policy: a reasoning
//! signature minted by one model family is never dispatched to the other
//! (see [`crate::signature`]), and a conversation that crossed from Gemini
//! to Claude mid-tool-loop gets its transcript repaired so the upstream
//! sees matched tool_use/tool_result pairs.

use crate::error::GatewayError;
use crate::models::{is_thinking_model, ModelFamily};
use crate::schema::sanitize_schema;
use crate::signature::{SignatureCache, SKIP_SIGNATURE_SENTINEL};
use crate::types::{
    ContentBlock, ImageSourceType, Message, MessagesRequest, MessagesResponse, Role, ThinkingType,
    ToolChoice, Usage,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Placeholder text for a tool call whose result never arrived.
const INTERRUPTED_TOOL_RESULT: &str = "Tool execution interrupted.";

/// Context shared by the converters for one request.
pub struct ConvertContext<'a> {
    pub session_id: &'a str,
    /// Gateway system instruction, prepended when not already present.
    pub system_instruction: &'a str,
    pub cache: &'a SignatureCache,
}

/// Convert an Anthropic Messages request into the Google-format `request`
/// object dispatched to the upstream (pre-envelope).
pub fn anthropic_to_google(
    req: &MessagesRequest,
    ctx: &ConvertContext<'_>,
) -> Result<Value, GatewayError> {
    let target = ModelFamily::from_model(&req.model);
    let thinking_enabled = match &req.thinking {
        Some(cfg) => cfg.kind == ThinkingType::Enabled,
        None => is_thinking_model(&req.model),
    };

    let messages = repair_transcript(&req.messages, target, ctx);
    let contents = build_contents(&messages, target, thinking_enabled, ctx)?;

    let mut request = json!({
        "contents": contents,
        "safetySettings": build_safety_settings(),
        "sessionId": ctx.session_id,
    });

    request["systemInstruction"] =
        build_system_instruction(req.system.as_ref(), ctx.system_instruction);

    let generation_config = build_generation_config(req, target, thinking_enabled);
    if !generation_config
        .as_object()
        .map(Map::is_empty)
        .unwrap_or(true)
    {
        request["generationConfig"] = generation_config;
    }

    if let Some(tools) = &req.tools {
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.input_schema),
                    })
                })
                .collect();
            request["tools"] = json!([{"functionDeclarations": declarations}]);
            request["toolConfig"] = build_tool_config(req.tool_choice.as_ref());
        }
    }

    scrub_request(&mut request);
    Ok(request)
}

/// Strip fields the upstream rejects and purge client-injected garbage.
///
/// Applied to every outgoing `request` object, including Google-native
/// passthrough bodies: removes `generationConfig.candidateCount`, and
/// deletes `null` members and the literal string `"[undefined]"` at any
/// depth.
pub fn scrub_request(request: &mut Value) {
    if let Some(config) = request
        .get_mut("generationConfig")
        .and_then(Value::as_object_mut)
    {
        config.remove("candidateCount");
    }
    deep_clean(request);
}

/// Prepend the gateway system instruction to a Google-format request
/// unless it is already present textually. Used by the native passthrough
/// endpoints, where the client builds its own `systemInstruction`.
pub fn ensure_system_instruction(request: &mut Value, instruction: &str) {
    let existing = request
        .get("systemInstruction")
        .and_then(|s| s.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if existing.contains(instruction) {
        return;
    }

    match request
        .get_mut("systemInstruction")
        .and_then(|s| s.get_mut("parts"))
        .and_then(Value::as_array_mut)
    {
        Some(parts) => parts.insert(0, json!({"text": instruction})),
        None => {
            request["systemInstruction"] = json!({
                "role": "user",
                "parts": [{"text": instruction}]
            });
        }
    }
}

fn deep_clean(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            obj.retain(|_, v| !is_undefined(v));
            for v in obj.values_mut() {
                deep_clean(v);
            }
        }
        Value::Array(arr) => {
            arr.retain(|v| !is_undefined(v));
            for v in arr {
                deep_clean(v);
            }
        }
        _ => {}
    }
}

fn is_undefined(value: &Value) -> bool {
    value.is_null() || value.as_str() == Some("[undefined]")
}

fn build_safety_settings() -> Value {
    const CATEGORIES: &[&str] = &[
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_CIVIC_INTEGRITY",
    ];
    Value::Array(
        CATEGORIES
            .iter()
            .map(|c| json!({"category": c, "threshold": "OFF"}))
            .collect(),
    )
}

/// The gateway instruction always leads; the client's system prompt
/// follows, unless it already contains the gateway instruction textually.
fn build_system_instruction(
    client_system: Option<&crate::types::SystemContent>,
    gateway_instruction: &str,
) -> Value {
    let client_text = client_system.map(|s| s.to_plaintext()).unwrap_or_default();

    let mut parts: Vec<Value> = Vec::new();
    if !client_text.contains(gateway_instruction) {
        parts.push(json!({"text": gateway_instruction}));
    }
    if !client_text.is_empty() {
        parts.push(json!({"text": client_text}));
    }

    json!({"role": "user", "parts": parts})
}

fn build_generation_config(
    req: &MessagesRequest,
    target: ModelFamily,
    thinking_enabled: bool,
) -> Value {
    let mut config = Map::new();
    if let Some(max_tokens) = req.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = req.top_k {
        config.insert("topK".to_string(), json!(top_k));
    }
    if let Some(stop) = &req.stop_sequences {
        if !stop.is_empty() {
            config.insert("stopSequences".to_string(), json!(stop));
        }
    }

    if thinking_enabled {
        let thinking = match target {
            // Claude models take a token budget; Gemini 3 takes a level.
            ModelFamily::Claude => {
                let budget = req
                    .thinking
                    .as_ref()
                    .and_then(|t| t.budget_tokens)
                    .unwrap_or(8192);
                json!({"thinkingBudget": budget, "includeThoughts": true})
            }
            ModelFamily::Gemini => json!({"thinkingLevel": "high", "includeThoughts": true}),
        };
        config.insert("thinkingConfig".to_string(), thinking);
    }

    Value::Object(config)
}

fn build_tool_config(choice: Option<&ToolChoice>) -> Value {
    match choice {
        // VALIDATED is what the upstream's own IDE client sends when the
        // caller expressed no preference.
        None => json!({"functionCallingConfig": {"mode": "VALIDATED"}}),
        Some(ToolChoice::Auto) => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        Some(ToolChoice::Any) => json!({"functionCallingConfig": {"mode": "ANY"}}),
        Some(ToolChoice::Tool { name }) => json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
        }),
        Some(ToolChoice::None) => json!({"functionCallingConfig": {"mode": "NONE"}}),
    }
}

/// Repair tool_use/tool_result pairing.
///
/// Two cases:
/// - Mid-transcript: an assistant turn's tool calls must be answered in the
///   immediately following user turn, in call order, before any further
///   assistant turn. Missing results get placeholders; present ones are
///   reordered to call order.
/// - Trailing: when the conversation crossed from Gemini to Claude and the
///   last assistant turn ends on unanswered tool calls, a minimal user turn
///   of placeholders is appended so the Claude upstream sees a well-formed
///   transcript.
fn repair_transcript(
    messages: &[Message],
    target: ModelFamily,
    ctx: &ConvertContext<'_>,
) -> Vec<Message> {
    let crossed_from_gemini = target == ModelFamily::Claude
        && (ctx.cache.has_family(ctx.session_id, ModelFamily::Gemini)
            || transcript_has_gemini_signature(messages, ctx));

    let mut repaired: Vec<Message> = Vec::with_capacity(messages.len() + 1);
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];
        repaired.push(msg.clone());
        i += 1;

        let open_calls = open_tool_calls(msg);
        if open_calls.is_empty() {
            continue;
        }

        match messages.get(i) {
            Some(next) if next.role == Role::User => {
                repaired.push(answer_tool_calls(&open_calls, next));
                i += 1;
            }
            Some(_) => {
                // Another assistant turn follows directly; close the loop
                // with placeholders.
                repaired.push(placeholder_user_turn(&open_calls));
            }
            None => {
                if crossed_from_gemini {
                    debug!(
                        open = open_calls.len(),
                        "closing interrupted tool loop for cross-model switch"
                    );
                    repaired.push(placeholder_user_turn(&open_calls));
                }
            }
        }
    }

    repaired
}

/// Tool calls in an assistant message, in order.
fn open_tool_calls(msg: &Message) -> Vec<(String, String)> {
    if msg.role != Role::Assistant {
        return Vec::new();
    }
    msg.content
        .as_blocks()
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, .. } => Some((id, name)),
            _ => None,
        })
        .collect()
}

/// Rebuild a user turn so its tool_results cover `calls` in call order,
/// with placeholders for any missing result. Non-result blocks keep their
/// relative order after the results.
fn answer_tool_calls(calls: &[(String, String)], user_turn: &Message) -> Message {
    let mut results: HashMap<String, ContentBlock> = HashMap::new();
    let mut rest: Vec<ContentBlock> = Vec::new();

    for block in user_turn.content.as_blocks() {
        match &block {
            ContentBlock::ToolResult { tool_use_id, .. } => {
                results.insert(tool_use_id.clone(), block);
            }
            _ => rest.push(block),
        }
    }

    let mut blocks: Vec<ContentBlock> = Vec::with_capacity(calls.len() + rest.len());
    for (id, _name) in calls {
        match results.remove(id) {
            Some(result) => blocks.push(result),
            None => {
                warn!(tool_use_id = %id, "tool call missing its result, inserting placeholder");
                blocks.push(placeholder_result(id));
            }
        }
    }
    // Results answering calls we did not see stay where the client put
    // them, after the matched set.
    blocks.extend(results.into_values());
    blocks.extend(rest);

    Message {
        role: Role::User,
        content: crate::types::Content::Blocks(blocks),
    }
}

fn placeholder_result(tool_use_id: &str) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content: crate::types::ToolResultContent::String(INTERRUPTED_TOOL_RESULT.to_string()),
        is_error: Some(true),
    }
}

fn placeholder_user_turn(calls: &[(String, String)]) -> Message {
    Message {
        role: Role::User,
        content: crate::types::Content::Blocks(
            calls.iter().map(|(id, _)| placeholder_result(id)).collect(),
        ),
    }
}

fn transcript_has_gemini_signature(messages: &[Message], ctx: &ConvertContext<'_>) -> bool {
    messages.iter().any(|m| {
        m.content.as_blocks().iter().any(|b| match b {
            ContentBlock::Thinking {
                signature: Some(sig),
                ..
            } => ctx.cache.lookup(ctx.session_id, sig) == Some(ModelFamily::Gemini),
            _ => false,
        })
    })
}

/// Signature dispatch policy (spec: cross-model rules).
///
/// Gemini targets only accept Gemini-minted signatures; anything else is
/// replaced with the upstream's skip-validation sentinel. Claude targets
/// accept unknown signatures (the upstream validates) but never a known
/// Gemini one.
fn admit_signature(
    signature: &str,
    target: ModelFamily,
    ctx: &ConvertContext<'_>,
) -> Option<String> {
    if signature.is_empty() || signature == SKIP_SIGNATURE_SENTINEL {
        return match target {
            ModelFamily::Gemini => Some(SKIP_SIGNATURE_SENTINEL.to_string()),
            ModelFamily::Claude => None,
        };
    }

    let family = ctx.cache.lookup(ctx.session_id, signature);
    match target {
        ModelFamily::Gemini => match family {
            Some(ModelFamily::Gemini) => Some(signature.to_string()),
            _ => {
                debug!("replacing non-Gemini signature with skip sentinel");
                Some(SKIP_SIGNATURE_SENTINEL.to_string())
            }
        },
        ModelFamily::Claude => match family {
            Some(ModelFamily::Gemini) => {
                debug!("dropping Gemini signature for Claude target");
                None
            }
            _ => Some(signature.to_string()),
        },
    }
}

fn build_contents(
    messages: &[Message],
    target: ModelFamily,
    thinking_enabled: bool,
    ctx: &ConvertContext<'_>,
) -> Result<Vec<Value>, GatewayError> {
    let mut contents: Vec<Value> = Vec::new();
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    for msg in messages {
        match msg.role {
            Role::User => {
                convert_user_message(msg, &tool_id_to_name, &mut contents)?;
            }
            Role::Assistant => {
                convert_assistant_message(
                    msg,
                    target,
                    thinking_enabled,
                    ctx,
                    &mut tool_id_to_name,
                    &mut contents,
                )?;
            }
        }
    }

    Ok(contents)
}

fn push_content(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if !parts.is_empty() {
        contents.push(json!({"role": role, "parts": parts}));
    }
}

fn convert_user_message(
    msg: &Message,
    tool_id_to_name: &HashMap<String, String>,
    contents: &mut Vec<Value>,
) -> Result<(), GatewayError> {
    // tool_result blocks become their own user content of functionResponse
    // parts; runs of other blocks become ordinary user contents. Block
    // order is preserved across the split.
    let mut plain_parts: Vec<Value> = Vec::new();
    let mut response_parts: Vec<Value> = Vec::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                push_content(contents, "user", std::mem::take(&mut plain_parts));
                let name = tool_id_to_name
                    .get(&tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| "tool".to_string());
                let mut output = json!({"output": content.to_plaintext()});
                if is_error == Some(true) {
                    output["isError"] = json!(true);
                }
                response_parts.push(json!({
                    "functionResponse": {
                        "id": tool_use_id,
                        "name": name,
                        "response": output,
                    }
                }));
            }
            other => {
                push_content(contents, "user", std::mem::take(&mut response_parts));
                if let Some(part) = convert_basic_block(&other)? {
                    plain_parts.push(part);
                }
            }
        }
    }

    push_content(contents, "user", response_parts);
    push_content(contents, "user", plain_parts);
    Ok(())
}

fn convert_assistant_message(
    msg: &Message,
    target: ModelFamily,
    thinking_enabled: bool,
    ctx: &ConvertContext<'_>,
    tool_id_to_name: &mut HashMap<String, String>,
    contents: &mut Vec<Value>,
) -> Result<(), GatewayError> {
    let mut parts: Vec<Value> = Vec::new();
    // Signature of the most recent thinking block, waiting for the tool
    // call it justifies.
    let mut pending_signature: Option<String> = None;

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Thinking { signature, .. } => {
                if let Some(sig) = signature {
                    pending_signature = Some(sig);
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                if id.is_empty() {
                    return Err(GatewayError::Translation(
                        "tool_use block is missing its id".to_string(),
                    ));
                }
                tool_id_to_name.insert(id.clone(), name.clone());
                let mut part = json!({
                    "functionCall": {"id": id, "name": name, "args": input}
                });

                let admitted = match pending_signature.take() {
                    Some(sig) => admit_signature(&sig, target, ctx),
                    None if thinking_enabled && target == ModelFamily::Gemini => {
                        Some(SKIP_SIGNATURE_SENTINEL.to_string())
                    }
                    None => None,
                };
                if let Some(sig) = admitted {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            other => {
                if let Some(part) = convert_basic_block(&other)? {
                    parts.push(part);
                }
            }
        }
    }

    push_content(contents, "model", parts);
    Ok(())
}

/// Text and image blocks, shared by both roles.
fn convert_basic_block(block: &ContentBlock) -> Result<Option<Value>, GatewayError> {
    match block {
        ContentBlock::Text { text } => {
            if text.is_empty() {
                Ok(None)
            } else {
                Ok(Some(json!({"text": text})))
            }
        }
        ContentBlock::Image { source } => match source.kind {
            ImageSourceType::Base64 => {
                let data = source.data.as_deref().ok_or_else(|| {
                    GatewayError::Translation("image source is missing data".to_string())
                })?;
                let mime = source.media_type.as_deref().unwrap_or("image/jpeg");
                Ok(Some(json!({
                    "inlineData": {"mimeType": mime, "data": data}
                })))
            }
            ImageSourceType::Url => {
                let url = source.url.as_deref().ok_or_else(|| {
                    GatewayError::Translation("image source is missing url".to_string())
                })?;
                Ok(Some(json!({"text": format!("Image URL: {}", url)})))
            }
        },
        // thinking / tool blocks are handled by the per-role converters.
        _ => Ok(None),
    }
}

/// Convert an (unwrapped) Google response frame into an Anthropic Messages
/// response. Used for non-streaming callers after chunk merging.
pub fn google_response_to_anthropic(
    frame: &Value,
    model: &str,
    ctx: &ConvertContext<'_>,
) -> Result<MessagesResponse, GatewayError> {
    let family = ModelFamily::from_model(model);
    let candidate = frame
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| GatewayError::Translation("response has no candidates".to_string()))?;

    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_use = false;

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            convert_response_part(part, family, ctx, &mut blocks, &mut saw_tool_use);
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str);
    let stop_reason = map_finish_reason(finish_reason, saw_tool_use);

    Ok(MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        kind: "message".to_string(),
        role: Role::Assistant,
        content: blocks,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage: usage_from_metadata(frame.get("usageMetadata")),
    })
}

fn convert_response_part(
    part: &Value,
    family: ModelFamily,
    ctx: &ConvertContext<'_>,
    blocks: &mut Vec<ContentBlock>,
    saw_tool_use: &mut bool,
) {
    let part_signature = part
        .get("thoughtSignature")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != SKIP_SIGNATURE_SENTINEL);

    if let Some(text) = part.get("text").and_then(Value::as_str) {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            if let Some(sig) = part_signature {
                ctx.cache.remember(ctx.session_id, sig, family);
            }
            blocks.push(ContentBlock::Thinking {
                thinking: text.to_string(),
                signature: part_signature.map(str::to_string),
            });
        } else if !text.is_empty() {
            // Consecutive text parts merge into one block.
            if let Some(ContentBlock::Text { text: prev }) = blocks.last_mut() {
                prev.push_str(text);
            } else {
                blocks.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            }
        }
        return;
    }

    if let Some(call) = part.get("functionCall").and_then(Value::as_object) {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            return;
        }
        let id = call
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
        let input = call.get("args").cloned().unwrap_or_else(|| json!({}));

        // The signature may ride on the part or inside the call object; a
        // real one becomes a preceding thinking block so the next turn can
        // round-trip it.
        let signature = part_signature.or_else(|| {
            call.get("thoughtSignature")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty() && *s != SKIP_SIGNATURE_SENTINEL)
        });
        if let Some(sig) = signature {
            ctx.cache.remember(ctx.session_id, sig, family);
            let attach_to_prior_thinking = matches!(
                blocks.last(),
                Some(ContentBlock::Thinking {
                    signature: None,
                    ..
                })
            );
            if attach_to_prior_thinking {
                if let Some(ContentBlock::Thinking { signature, .. }) = blocks.last_mut() {
                    *signature = Some(sig.to_string());
                }
            } else {
                blocks.push(ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: Some(sig.to_string()),
                });
            }
        }

        *saw_tool_use = true;
        blocks.push(ContentBlock::ToolUse { id, name, input });
    }
}

fn map_finish_reason(reason: Option<&str>, saw_tool_use: bool) -> &'static str {
    if saw_tool_use {
        return "tool_use";
    }
    match reason {
        Some("MAX_TOKENS") => "max_tokens",
        Some("STOP") | None => "end_turn",
        Some(_) => "end_turn",
    }
}

/// Map upstream `usageMetadata` into Anthropic usage accounting.
pub fn usage_from_metadata(metadata: Option<&Value>) -> Usage {
    let Some(meta) = metadata.and_then(Value::as_object) else {
        return Usage::default();
    };
    let get = |key: &str| meta.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;

    let prompt = get("promptTokenCount");
    let cached = get("cachedContentTokenCount");
    let output = get("candidatesTokenCount") + get("thoughtsTokenCount");

    Usage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: output,
        cache_read_input_tokens: (cached > 0).then_some(cached),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, SystemContent, Tool};

    const GATEWAY_INSTRUCTION: &str = "You are Antigravity, serving as a coding assistant.";

    fn ctx<'a>(cache: &'a SignatureCache) -> ConvertContext<'a> {
        ConvertContext {
            session_id: "sess-test",
            system_instruction: GATEWAY_INSTRUCTION,
            cache,
        }
    }

    fn user_text(text: &str) -> Message {
        Message {
            role: Role::User,
            content: Content::String(text.to_string()),
        }
    }

    fn basic_request(model: &str, messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages,
            system: None,
            max_tokens: Some(1024),
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
        }
    }

    #[test]
    fn text_request_converts_to_single_user_content() {
        let cache = SignatureCache::default();
        let req = basic_request("claude-sonnet-4-5", vec![user_text("ping")]);
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();

        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "ping");
        assert_eq!(out["sessionId"], "sess-test");
    }

    #[test]
    fn gateway_instruction_is_prepended_once() {
        let cache = SignatureCache::default();
        let mut req = basic_request("gemini-3-flash", vec![user_text("hi")]);
        req.system = Some(SystemContent::String("Be terse.".to_string()));
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let parts = out["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], GATEWAY_INSTRUCTION);
        assert_eq!(parts[1]["text"], "Be terse.");

        // Already present: not doubled.
        req.system = Some(SystemContent::String(format!(
            "{} And be terse.",
            GATEWAY_INSTRUCTION
        )));
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let parts = out["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn known_gemini_signature_is_kept_for_gemini_target() {
        let cache = SignatureCache::default();
        cache.remember("sess-test", "sig-1", ModelFamily::Gemini);

        let req = basic_request(
            "gemini-3-pro",
            vec![
                user_text("what time is it"),
                Message {
                    role: Role::Assistant,
                    content: Content::Blocks(vec![
                        ContentBlock::Thinking {
                            thinking: "need the clock".to_string(),
                            signature: Some("sig-1".to_string()),
                        },
                        ContentBlock::ToolUse {
                            id: "toolu_1".to_string(),
                            name: "get_time".to_string(),
                            input: json!({}),
                        },
                    ]),
                },
                Message {
                    role: Role::User,
                    content: Content::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".to_string(),
                        content: crate::types::ToolResultContent::String("noon".to_string()),
                        is_error: None,
                    }]),
                },
            ],
        );
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let contents = out["contents"].as_array().unwrap();
        let model_parts = contents[1]["parts"].as_array().unwrap();
        assert_eq!(model_parts[0]["thoughtSignature"], "sig-1");
        assert_eq!(model_parts[0]["functionCall"]["name"], "get_time");
    }

    #[test]
    fn unknown_signature_becomes_sentinel_for_gemini_target() {
        let cache = SignatureCache::default();
        let req = basic_request(
            "gemini-3-pro",
            vec![
                user_text("q"),
                Message {
                    role: Role::Assistant,
                    content: Content::Blocks(vec![
                        ContentBlock::Thinking {
                            thinking: "hm".to_string(),
                            signature: Some("claude-made-this".to_string()),
                        },
                        ContentBlock::ToolUse {
                            id: "toolu_1".to_string(),
                            name: "f".to_string(),
                            input: json!({}),
                        },
                    ]),
                },
                Message {
                    role: Role::User,
                    content: Content::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".to_string(),
                        content: Default::default(),
                        is_error: None,
                    }]),
                },
            ],
        );
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let model_parts = out["contents"][1]["parts"].as_array().unwrap();
        assert_eq!(model_parts[0]["thoughtSignature"], SKIP_SIGNATURE_SENTINEL);
    }

    #[test]
    fn gemini_signatures_are_dropped_for_claude_target_with_loop_closed() {
        let cache = SignatureCache::default();
        cache.remember("sess-test", "gem-sig", ModelFamily::Gemini);

        // Interrupted tool loop: assistant ends on an unanswered call.
        let req = basic_request(
            "claude-sonnet-4-5-thinking",
            vec![
                user_text("q"),
                Message {
                    role: Role::Assistant,
                    content: Content::Blocks(vec![
                        ContentBlock::Thinking {
                            thinking: "checking".to_string(),
                            signature: Some("gem-sig".to_string()),
                        },
                        ContentBlock::ToolUse {
                            id: "toolu_open".to_string(),
                            name: "probe".to_string(),
                            input: json!({}),
                        },
                    ]),
                },
            ],
        );
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let contents = out["contents"].as_array().unwrap();

        // No Gemini signature survives anywhere in the dispatch.
        let rendered = serde_json::to_string(&out).unwrap();
        assert!(!rendered.contains("gem-sig"));

        // A synthesised user turn answers the open call.
        let last = contents.last().unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(
            last["parts"][0]["functionResponse"]["id"],
            "toolu_open"
        );
    }

    #[test]
    fn mid_transcript_missing_tool_result_gets_placeholder() {
        let cache = SignatureCache::default();
        let req = basic_request(
            "gemini-3-pro",
            vec![
                user_text("q"),
                Message {
                    role: Role::Assistant,
                    content: Content::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".to_string(),
                        name: "probe".to_string(),
                        input: json!({}),
                    }]),
                },
                user_text("never mind, new question"),
            ],
        );
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let contents = out["contents"].as_array().unwrap();
        // user, model, synthesized functionResponse user, plain user text
        let responses = &contents[2]["parts"];
        assert_eq!(responses[0]["functionResponse"]["id"], "toolu_1");
        assert_eq!(
            responses[0]["functionResponse"]["response"]["output"],
            INTERRUPTED_TOOL_RESULT
        );
    }

    #[test]
    fn tool_schemas_are_sanitized() {
        let cache = SignatureCache::default();
        let mut req = basic_request("gemini-3-pro", vec![user_text("q")]);
        req.tools = Some(vec![Tool {
            name: "lookup".to_string(),
            description: Some("find things".to_string()),
            input_schema: json!({
                "$schema": "x",
                "type": "object",
                "properties": {"q": {"type": "string"}}
            }),
        }]);
        req.tool_choice = Some(ToolChoice::Any);
        let out = anthropic_to_google(&req, &ctx(&cache)).unwrap();
        let decl = &out["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "lookup");
        assert!(decl["parameters"].get("$schema").is_none());
        assert_eq!(out["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
    }

    #[test]
    fn scrub_removes_nulls_undefined_and_candidate_count() {
        let mut request = json!({
            "generationConfig": {"candidateCount": 3, "temperature": 0.5},
            "contents": [
                {"role": "user", "parts": [{"text": "[undefined]"}, {"text": "ok", "extra": null}]}
            ]
        });
        scrub_request(&mut request);
        assert!(request["generationConfig"].get("candidateCount").is_none());
        assert_eq!(request["generationConfig"]["temperature"], 0.5);
        let parts = request["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].get("text").is_none());
        assert!(parts[1].get("extra").is_none());
    }

    #[test]
    fn response_converts_thought_and_function_call() {
        let cache = SignatureCache::default();
        let frame = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "let me check", "thought": true},
                    {"functionCall": {"id": "call_1", "name": "get_time", "args": {}},
                     "thoughtSignature": "sig-new"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5,
                               "thoughtsTokenCount": 2, "cachedContentTokenCount": 4}
        });
        let context = ctx(&cache);
        let resp = google_response_to_anthropic(&frame, "gemini-3-pro", &context).unwrap();

        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert!(matches!(&resp.content[0], ContentBlock::Thinking { .. }));
        match &resp.content[1] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some("sig-new"))
            }
            ContentBlock::ToolUse { .. } => {}
            other => panic!("unexpected block {:?}", other),
        }
        assert!(resp
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { name, .. } if name == "get_time")));

        assert_eq!(resp.usage.input_tokens, 6);
        assert_eq!(resp.usage.output_tokens, 7);
        assert_eq!(resp.usage.cache_read_input_tokens, Some(4));

        // The response signature is now cached under this session/family.
        assert_eq!(
            cache.lookup("sess-test", "sig-new"),
            Some(ModelFamily::Gemini)
        );
    }

    #[test]
    fn consecutive_text_parts_merge() {
        let cache = SignatureCache::default();
        let frame = json!({
            "candidates": [{
                "content": {"parts": [{"text": "po"}, {"text": "ng"}]},
                "finishReason": "STOP"
            }]
        });
        let context = ctx(&cache);
        let resp = google_response_to_anthropic(&frame, "claude-sonnet-4-5", &context).unwrap();
        assert_eq!(resp.content.len(), 1);
        assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "pong"));
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn round_trip_preserves_tool_use_identity() {
        let cache = SignatureCache::default();
        let context = ctx(&cache);
        let frame = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"id": "call_9", "name": "probe", "args": {"x": 1}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let resp = google_response_to_anthropic(&frame, "gemini-3-pro", &context).unwrap();
        let (id, input) = match resp
            .content
            .iter()
            .find_map(|b| match b {
                ContentBlock::ToolUse { id, input, .. } => Some((id.clone(), input.clone())),
                _ => None,
            }) {
            Some(pair) => pair,
            None => panic!("no tool use"),
        };
        assert_eq!(id, "call_9");
        assert_eq!(input, json!({"x": 1}));

        // Feed it back through the request converter.
        let req = basic_request(
            "gemini-3-pro",
            vec![
                user_text("q"),
                Message {
                    role: Role::Assistant,
                    content: Content::Blocks(resp.content.clone()),
                },
                Message {
                    role: Role::User,
                    content: Content::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "call_9".to_string(),
                        content: crate::types::ToolResultContent::String("done".to_string()),
                        is_error: None,
                    }]),
                },
            ],
        );
        let out = anthropic_to_google(&req, &context).unwrap();
        let call = &out["contents"][1]["parts"][0]["functionCall"];
        assert_eq!(call["id"], "call_9");
        assert_eq!(call["args"], json!({"x": 1}));
        let response = &out["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(response["id"], "call_9");
        assert_eq!(response["name"], "probe");
    }
}
