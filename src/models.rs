//! Model identifiers served by the upstream.
//!
//! The upstream exposes Claude- and Gemini-family models behind one API.
//! Family membership decides the thinking-block protocol (Claude carries
//! `thinking` content blocks, Gemini attaches `thoughtSignature` to function
//! calls), so most call sites start here.

use serde::{Deserialize, Serialize};

/// The two model families the upstream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn from_model(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("claude") {
            ModelFamily::Claude
        } else {
            ModelFamily::Gemini
        }
    }
}

/// Model identifiers known to the gateway, as listed by `GET /v1/models`.
pub const KNOWN_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5-thinking",
    "gemini-3-pro",
    "gemini-3-flash",
    "gemini-3-pro-image",
];

/// Whether the model emits thinking/reasoning blocks.
///
/// Gemini 3 models think by default; Claude models only in their `-thinking`
/// variants.
pub fn is_thinking_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    match ModelFamily::from_model(model) {
        ModelFamily::Claude => lower.contains("-thinking"),
        ModelFamily::Gemini => !lower.contains("-image"),
    }
}

/// Claude thinking models need an extra beta header on the upstream call.
pub fn needs_interleaved_thinking_header(model: &str) -> bool {
    ModelFamily::from_model(model) == ModelFamily::Claude && is_thinking_model(model)
}

/// Image-generating Gemini models are dispatched with a distinct
/// `requestType` in the upstream envelope.
pub fn is_image_gen_model(model: &str) -> bool {
    ModelFamily::from_model(model) == ModelFamily::Gemini
        && model.to_ascii_lowercase().contains("-image")
}

/// Alternate model used when every account is exhausted for the primary.
///
/// The mapping crosses families but preserves thinking capability: a
/// thinking model never falls back to a model that cannot emit reasoning
/// blocks. Returns `None` for models with no sensible alternate.
pub fn fallback_model(model: &str) -> Option<&'static str> {
    match model {
        "claude-sonnet-4-5" => Some("gemini-3-pro"),
        "claude-sonnet-4-5-thinking" => Some("gemini-3-pro"),
        "claude-opus-4-5-thinking" => Some("gemini-3-pro"),
        "gemini-3-pro" => Some("claude-sonnet-4-5-thinking"),
        "gemini-3-flash" => Some("claude-sonnet-4-5-thinking"),
        _ => None,
    }
}
