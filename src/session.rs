//! Session-id derivation.
//!
//! The session id is a stable digest of the first user message. It does
//! double duty: the account pool uses it for sticky selection, and the
//! upstream receives it as `request.sessionId`, so repeated turns of one
//! conversation land on the same prompt cache.

use crate::types::{ContentBlock, MessagesRequest, Role};
use sha2::{Digest, Sha256};

/// Derive the session id for a request.
///
/// The digest covers only the text parts of the first user message, in
/// order, so it is stable across turns even as later messages accumulate.
/// A conversation with no user text hashes the empty string, which still
/// yields a usable (if shared) affinity key.
pub fn derive_session_id(request: &MessagesRequest) -> String {
    let mut hasher = Sha256::new();

    if let Some(first_user) = request.messages.iter().find(|m| m.role == Role::User) {
        for block in first_user.content.as_blocks() {
            if let ContentBlock::Text { text } = block {
                hasher.update(text.as_bytes());
            }
        }
    }

    hex::encode(hasher.finalize())
}

/// Session id for a Google-native request: the same digest rule applied to
/// the first `user` entry of `contents`.
pub fn derive_session_id_google(request: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();

    let first_user = request
        .get("contents")
        .and_then(serde_json::Value::as_array)
        .and_then(|contents| {
            contents
                .iter()
                .find(|c| c.get("role").and_then(serde_json::Value::as_str) == Some("user"))
        });

    if let Some(parts) = first_user
        .and_then(|c| c.get("parts"))
        .and_then(serde_json::Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(serde_json::Value::as_str) {
                hasher.update(text.as_bytes());
            }
        }
    }

    hex::encode(hasher.finalize())
}
