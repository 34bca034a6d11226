//! Thinking-signature cache.
//!
//! Reasoning signatures are opaque bytes minted by one model family and
//! rejected by the other. When a conversation crosses model boundaries the
//! history still carries the old family's signatures, so before dispatch we
//! need to know where each one came from. This cache binds signatures to
//! their originating family for the lifetime of the process.
//!
//! Keys include the derived session id, so a signature seen in one
//! conversation can never resurrect validity in another.

use crate::models::ModelFamily;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// Upstream-documented marker that tells the Gemini validator to skip a
/// signature it would otherwise reject. Attached as `thoughtSignature` on
/// the enclosing function call; never cached.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

const DEFAULT_CAPACITY: usize = 4096;

struct Entry {
    family: ModelFamily,
    #[allow(dead_code)]
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    // Recency queue; may hold stale duplicates that are skipped on eviction.
    order: VecDeque<String>,
    capacity: usize,
}

/// Process-wide LRU of signature → model family bindings.
pub struct SignatureCache {
    inner: Mutex<Inner>,
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SignatureCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Record that `signature` was produced by `family` within the given
    /// session. Refreshes recency if already present.
    pub fn remember(&self, session_id: &str, signature: &str, family: ModelFamily) {
        if signature.is_empty() || signature == SKIP_SIGNATURE_SENTINEL {
            return;
        }
        let key = cache_key(session_id, signature);
        let mut inner = self.inner.lock().expect("signature cache poisoned");

        inner.entries.insert(
            key.clone(),
            Entry {
                family,
                inserted_at: Instant::now(),
            },
        );
        inner.order.push_back(key);
        evict_over_capacity(&mut inner);
        compact_order(&mut inner);
    }

    /// The family that minted `signature` in this session, if known.
    pub fn lookup(&self, session_id: &str, signature: &str) -> Option<ModelFamily> {
        let key = cache_key(session_id, signature);
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        let family = inner.entries.get(&key).map(|e| e.family)?;
        inner.order.push_back(key);
        compact_order(&mut inner);
        Some(family)
    }

    /// Whether any live entry of this session belongs to `family`. Used to
    /// detect that a conversation's history crossed a model boundary.
    pub fn has_family(&self, session_id: &str, family: ModelFamily) -> bool {
        let prefix = session_prefix(session_id);
        let inner = self.inner.lock().expect("signature cache poisoned");
        inner
            .entries
            .iter()
            .any(|(key, entry)| entry.family == family && key.starts_with(&prefix))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

fn evict_over_capacity(inner: &mut Inner) {
    while inner.entries.len() > inner.capacity {
        let Some(candidate) = inner.order.pop_front() else {
            break;
        };
        // A key re-pushed on later use is stale at its older queue
        // positions; only the front occurrence of a still-live key that has
        // no later occurrence may be evicted.
        if inner.order.contains(&candidate) {
            continue;
        }
        inner.entries.remove(&candidate);
    }
}

/// Drop stale duplicates once the queue is far larger than the live set,
/// keeping only each key's most recent position.
fn compact_order(inner: &mut Inner) {
    if inner.order.len() <= inner.entries.len().saturating_mul(4).max(64) {
        return;
    }
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut compacted: VecDeque<String> = VecDeque::with_capacity(inner.entries.len());
    for key in inner.order.iter().rev() {
        if inner.entries.contains_key(key) && seen.insert(key.clone()) {
            compacted.push_front(key.clone());
        }
    }
    inner.order = compacted;
}

fn cache_key(session_id: &str, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    format!("{}:{}", session_id, hex::encode(hasher.finalize()))
}

fn session_prefix(session_id: &str) -> String {
    format!("{}:", session_id)
}
