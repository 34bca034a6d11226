//! OpenAI Chat Completions compatibility layer.
//!
//! Sits above the Anthropic-format internal representation: an OpenAI
//! request is normalised into a [`MessagesRequest`], and an Anthropic
//! response is rendered back out as a `chat.completion`. The Google leg is
//! shared with the native Anthropic endpoint.
//!
//! OpenAI request shapes vary wildly between SDK generations (string vs
//! part-list content, `functions` vs `tools`), so the inbound side parses
//! loose JSON rather than a strict struct.

use crate::error::GatewayError;
use crate::types::{
    Content, ContentBlock, ImageSource, ImageSourceType, Message, MessagesRequest,
    MessagesResponse, Role, SystemContent, Tool, ToolChoice, ToolResultContent,
};
use serde_json::{json, Map, Value};

/// Convert an OpenAI `chat.completions` request into the internal
/// Anthropic-format request.
pub fn openai_to_anthropic(body: &Value) -> Result<MessagesRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Translation("request is missing model".to_string()))?
        .to_string();

    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Translation("request is missing messages".to_string()))?;

    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for raw in raw_messages {
        let role = raw
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Translation("message is missing role".to_string()))?;

        match role {
            "system" | "developer" => {
                let text = content_to_text(raw.get("content"));
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            "user" => {
                let blocks = user_content_blocks(raw.get("content"))?;
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: Role::User,
                        content: Content::Blocks(blocks),
                    });
                }
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let text = content_to_text(raw.get("content"));
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                if let Some(calls) = raw.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        blocks.push(tool_call_to_block(call)?);
                    }
                }
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: Content::Blocks(blocks),
                    });
                }
            }
            "tool" => {
                let tool_call_id = raw
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::Translation(
                            "tool message is missing tool_call_id".to_string(),
                        )
                    })?;
                let result = ContentBlock::ToolResult {
                    tool_use_id: tool_call_id.to_string(),
                    content: ToolResultContent::String(content_to_text(raw.get("content"))),
                    is_error: None,
                };
                // Consecutive tool messages fold into one user turn, which
                // is how the Anthropic dialect pairs results with calls.
                match messages.last_mut() {
                    Some(Message {
                        role: Role::User,
                        content: Content::Blocks(blocks),
                    }) if blocks
                        .iter()
                        .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        blocks.push(result);
                    }
                    _ => messages.push(Message {
                        role: Role::User,
                        content: Content::Blocks(vec![result]),
                    }),
                }
            }
            other => {
                return Err(GatewayError::Translation(format!(
                    "unknown message role: {}",
                    other
                )));
            }
        }
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(SystemContent::String(system_texts.join("\n\n")))
    };

    Ok(MessagesRequest {
        model,
        messages,
        system,
        max_tokens: body
            .get("max_completion_tokens")
            .or_else(|| body.get("max_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        stream: body.get("stream").and_then(Value::as_bool),
        temperature: body
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|v| v as f32),
        top_p: body.get("top_p").and_then(Value::as_f64).map(|v| v as f32),
        top_k: None,
        stop_sequences: stop_sequences(body.get("stop")),
        tools: convert_tools(body)?,
        tool_choice: convert_tool_choice(body.get("tool_choice")),
        thinking: None,
        metadata: None,
    })
}

/// Render an Anthropic response as an OpenAI `chat.completion`.
pub fn anthropic_to_openai_response(resp: &MessagesResponse) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    }
                }));
            }
            _ => {}
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert(
        "content".to_string(),
        if text.is_empty() {
            Value::Null
        } else {
            json!(text)
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls.clone()));
    }
    if !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }

    json!({
        "id": resp.id.replace("msg_", "chatcmpl_"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": map_stop_reason(resp.stop_reason.as_deref(), !tool_calls.is_empty()),
        }],
        "usage": {
            "prompt_tokens": resp.usage.input_tokens,
            "completion_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.input_tokens + resp.usage.output_tokens,
            "prompt_tokens_details": {
                "cached_tokens": resp.usage.cache_read_input_tokens.unwrap_or(0),
            }
        }
    })
}

/// Anthropic stop reason -> OpenAI finish reason.
pub fn map_stop_reason(reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_calls";
    }
    match reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

fn content_to_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| {
                p.get("text")
                    .and_then(Value::as_str)
                    .filter(|_| p.get("type").and_then(Value::as_str) != Some("image_url"))
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn user_content_blocks(content: Option<&Value>) -> Result<Vec<ContentBlock>, GatewayError> {
    match content {
        Some(Value::String(s)) => Ok(vec![ContentBlock::Text { text: s.clone() }]),
        Some(Value::Array(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            blocks.push(ContentBlock::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                GatewayError::Translation(
                                    "image_url part is missing url".to_string(),
                                )
                            })?;
                        blocks.push(image_block_from_url(url));
                    }
                    _ => {}
                }
            }
            Ok(blocks)
        }
        None => Ok(Vec::new()),
        Some(_) => Err(GatewayError::Translation(
            "message content must be a string or an array of parts".to_string(),
        )),
    }
}

/// `data:` URLs carry inline base64; anything else stays a URL reference.
fn image_block_from_url(url: &str) -> ContentBlock {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return ContentBlock::Image {
                source: ImageSource {
                    kind: ImageSourceType::Base64,
                    media_type: Some(mime.to_string()),
                    data: Some(data.to_string()),
                    url: None,
                },
            };
        }
    }
    ContentBlock::Image {
        source: ImageSource {
            kind: ImageSourceType::Url,
            media_type: None,
            data: None,
            url: Some(url.to_string()),
        },
    }
}

fn tool_call_to_block(call: &Value) -> Result<ContentBlock, GatewayError> {
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Translation("tool_call is missing id".to_string()))?;
    let function = call
        .get("function")
        .ok_or_else(|| GatewayError::Translation("tool_call is missing function".to_string()))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Translation("tool_call function is missing name".to_string()))?;
    let arguments = function
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    let input: Value =
        serde_json::from_str(arguments).unwrap_or_else(|_| json!({"raw": arguments}));

    Ok(ContentBlock::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}

fn stop_sequences(stop: Option<&Value>) -> Option<Vec<String>> {
    match stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(arr)) => Some(
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// `tools` (current) or `functions` (legacy) -> Anthropic tool specs.
fn convert_tools(body: &Value) -> Result<Option<Vec<Tool>>, GatewayError> {
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let converted = tools
            .iter()
            .filter_map(|t| t.get("function"))
            .map(function_to_tool)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(converted));
    }
    if let Some(functions) = body.get("functions").and_then(Value::as_array) {
        let converted = functions
            .iter()
            .map(function_to_tool)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(converted));
    }
    Ok(None)
}

fn function_to_tool(function: &Value) -> Result<Tool, GatewayError> {
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Translation("tool function is missing name".to_string()))?;
    Ok(Tool {
        name: name.to_string(),
        description: function
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        input_schema: function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    })
}

fn convert_tool_choice(choice: Option<&Value>) -> Option<ToolChoice> {
    match choice {
        Some(Value::String(s)) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Any),
            "none" => Some(ToolChoice::None),
            _ => None,
        },
        Some(Value::Object(_)) => choice
            .and_then(|c| c.get("function"))
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;

    #[test]
    fn system_messages_concatenate_into_system_prompt() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "one"},
                {"role": "system", "content": "two"},
                {"role": "user", "content": "hi"}
            ]
        });
        let req = openai_to_anthropic(&body).unwrap();
        match req.system {
            Some(SystemContent::String(s)) => assert_eq!(s, "one\n\ntwo"),
            other => panic!("unexpected system: {:?}", other),
        }
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn tool_messages_fold_into_tool_results() {
        let body = json!({
            "model": "gemini-3-pro",
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "a", "arguments": "{\"x\":1}"}},
                    {"id": "call_2", "type": "function",
                     "function": {"name": "b", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "ra"},
                {"role": "tool", "tool_call_id": "call_2", "content": "rb"}
            ]
        });
        let req = openai_to_anthropic(&body).unwrap();
        assert_eq!(req.messages.len(), 3);

        let assistant = req.messages[1].content.as_blocks();
        assert!(
            matches!(&assistant[0], ContentBlock::ToolUse { id, input, .. }
                if id == "call_1" && input == &json!({"x": 1}))
        );

        let results = req.messages[2].content.as_blocks();
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], ContentBlock::ToolResult { tool_use_id, .. }
            if tool_use_id == "call_1"));
    }

    #[test]
    fn tool_message_without_id_is_a_translation_error() {
        let body = json!({
            "model": "gemini-3-pro",
            "messages": [{"role": "tool", "content": "orphan"}]
        });
        let err = openai_to_anthropic(&body).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(msg) if msg.contains("tool_call_id")));
    }

    #[test]
    fn unknown_role_is_rejected_by_name() {
        let body = json!({
            "model": "gemini-3-pro",
            "messages": [{"role": "narrator", "content": "?"}]
        });
        let err = openai_to_anthropic(&body).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(msg) if msg.contains("narrator")));
    }

    #[test]
    fn legacy_functions_become_tools() {
        let body = json!({
            "model": "gemini-3-pro",
            "messages": [{"role": "user", "content": "q"}],
            "functions": [{"name": "probe", "parameters": {"type": "object"}}]
        });
        let req = openai_to_anthropic(&body).unwrap();
        let tools = req.tools.unwrap();
        assert_eq!(tools[0].name, "probe");
    }

    #[test]
    fn data_url_images_become_base64_blocks() {
        let body = json!({
            "model": "gemini-3-pro",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
            ]}]
        });
        let req = openai_to_anthropic(&body).unwrap();
        let blocks = req.messages[0].content.as_blocks();
        match &blocks[1] {
            ContentBlock::Image { source } => {
                assert_eq!(source.media_type.as_deref(), Some("image/png"));
                assert_eq!(source.data.as_deref(), Some("aGk="));
            }
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn response_renders_text_tools_and_reasoning() {
        let resp = MessagesResponse {
            id: "msg_abc".to_string(),
            kind: "message".to_string(),
            role: Role::Assistant,
            content: vec![
                ContentBlock::Thinking {
                    thinking: "pondering".to_string(),
                    signature: Some("sig".to_string()),
                },
                ContentBlock::Text {
                    text: "pong".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "probe".to_string(),
                    input: json!({"x": 1}),
                },
            ],
            model: "gemini-3-pro".to_string(),
            stop_reason: Some("tool_use".to_string()),
            stop_sequence: None,
            usage: Usage {
                input_tokens: 3,
                output_tokens: 2,
                cache_read_input_tokens: None,
            },
        };
        let out = anthropic_to_openai_response(&resp);
        let message = &out["choices"][0]["message"];
        assert_eq!(message["content"], "pong");
        assert_eq!(message["reasoning_content"], "pondering");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "probe");
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn"), false), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens"), false), "length");
        assert_eq!(map_stop_reason(Some("tool_use"), false), "tool_calls");
        assert_eq!(map_stop_reason(Some("end_turn"), true), "tool_calls");
    }
}
