//! Bridge message decisions
//! Coding-agent hosts send tool definitions the backend's default prompt
//! does not describe. When tools are present we prepend a developer message
//! explaining them, and memoize the add/skip decision per input shape.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::metrics::{CacheMetrics, BRIDGE_BUCKET};
use crate::cache::ttl::TtlCache;
use crate::session::input::{item_text, InputItem};
use crate::session::request::ResponsesRequest;
use crate::session::state::{SessionContext, SessionState};

pub const BRIDGE_MESSAGE: &str = "You are running inside a coding-agent host that provides its own tools. \
Use only the tools listed in this request, with exactly the names and parameters given. \
Tools mentioned elsewhere in your instructions that are not in this list are unavailable. \
Prefer the host's file editing tools over shell commands for changing files.";

/// Characters of text content folded into an item's fingerprint
const CONTENT_PREFIX_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeDecision {
    Add,
    Skip,
}

impl BridgeDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeCacheEntry {
    pub decision: BridgeDecision,
    pub tool_count: usize,
}

/// Structural hash over role, type and a bounded content prefix per item
pub fn input_fingerprint(input: &[InputItem], tool_count: usize) -> String {
    let mut hasher = Sha256::new();
    for item in input {
        let role = item.get("role").and_then(Value::as_str).unwrap_or("");
        let kind = item.get("type").and_then(Value::as_str).unwrap_or("");
        let prefix: String = item_text(item).chars().take(CONTENT_PREFIX_CHARS).collect();
        hasher.update(role.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(kind.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(prefix.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.update(format!("tools:{}", tool_count).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn contains_bridge_message(input: &[InputItem]) -> bool {
    input.iter().any(|item| item_text(item).contains(BRIDGE_MESSAGE))
}

pub fn bridge_message() -> InputItem {
    json!({
        "type": "message",
        "role": "developer",
        "content": [{"type": "input_text", "text": BRIDGE_MESSAGE}]
    })
}

#[derive(Debug)]
pub struct BridgeDecisionCache {
    cache: TtlCache<BridgeCacheEntry>,
}

impl BridgeDecisionCache {
    pub fn new(ttl: Duration, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            cache: TtlCache::with_metrics(ttl, metrics, BRIDGE_BUCKET),
        }
    }

    /// Decide whether the bridge message belongs in this request.
    /// A session that already carries the bridge keeps it.
    pub fn decide(&self, input: &[InputItem], tool_count: usize, session: Option<&SessionState>) -> BridgeDecision {
        if session.is_some_and(|s| s.bridge_injected) {
            return BridgeDecision::Add;
        }

        let key = input_fingerprint(input, tool_count);
        if let Some(entry) = self.cache.get(&key) {
            if entry.data.tool_count == tool_count {
                return entry.data.decision;
            }
            self.cache.remove(&key);
        }

        let decision = if tool_count > 0 && !contains_bridge_message(input) {
            BridgeDecision::Add
        } else {
            BridgeDecision::Skip
        };
        self.cache.set_tagged(key, BridgeCacheEntry { decision, tool_count }, decision.as_str());
        decision
    }

    pub fn clean(&self) -> usize {
        self.cache.clean()
    }

    pub fn len(&self) -> usize {
        self.cache.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prepend the bridge message when warranted and mark the session
pub fn apply_bridge(
    request: &mut ResponsesRequest,
    context: &SessionContext,
    cache: &BridgeDecisionCache,
) -> BridgeDecision {
    let tool_count = request.tool_count();
    context.with_state(|state| {
        let session = context.enabled.then_some(&*state);
        let decision = cache.decide(&request.input, tool_count, session);
        if decision == BridgeDecision::Add {
            if !contains_bridge_message(&request.input) {
                request.input.insert(0, bridge_message());
            }
            state.bridge_injected = true;
        }
        decision
    })
}
