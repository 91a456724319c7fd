//! Prompt cache key derivation
//! Pure: turns request metadata into a deterministic key without touching
//! session state.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::session::input::{sha256_hex, stable_json};
use crate::session::request::ResponsesRequest;

/// Explicit cache key spellings accepted from the host
pub const PROMPT_CACHE_KEY_FIELDS: [&str; 2] = ["prompt_cache_key", "promptCacheKey"];

/// Fields that identify a conversation, highest priority first
pub const CONVERSATION_ID_FIELDS: [&str; 8] = [
    "conversation_id",
    "conversationId",
    "thread_id",
    "threadId",
    "session_id",
    "sessionId",
    "chat_id",
    "chatId",
];

/// Fields that tag a fork of a conversation, highest priority first
pub const FORK_ID_FIELDS: [&str; 6] = [
    "fork_id",
    "forkId",
    "branch_id",
    "branchId",
    "parent_conversation_id",
    "parentConversationId",
];

/// Number of leading input items folded into the generated key
const FALLBACK_INPUT_ITEMS: usize = 3;
const FALLBACK_HASH_LEN: usize = 32;

static FORK_ID_SANITIZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_.:-]+").expect("fork id pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeySource {
    /// Supplied by the host verbatim
    Existing,
    /// Derived from conversation metadata
    Metadata,
    /// Hashed from the request shape
    Generated,
}

/// Derivation output. Everything except `key` and `source` is diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheKeyResult {
    pub key: String,
    pub source: CacheKeySource,
    pub source_key: Option<String>,
    pub fork_source_key: Option<String>,
    pub hint_keys: Vec<String>,
    pub unusable_keys: Vec<String>,
    pub fallback_hash: Option<String>,
}

impl CacheKeyResult {
    fn new(key: String, source: CacheKeySource) -> Self {
        Self {
            key,
            source,
            source_key: None,
            fork_source_key: None,
            hint_keys: Vec::new(),
            unusable_keys: Vec::new(),
            fallback_hash: None,
        }
    }
}

#[derive(Debug, Default)]
struct MetadataScan {
    base: Option<(&'static str, String)>,
    fork: Option<(&'static str, String)>,
    hint_keys: Vec<String>,
    unusable_keys: Vec<String>,
}

impl MetadataScan {
    fn run(request: &ResponsesRequest) -> Self {
        let mut scan = Self::default();
        for field in CONVERSATION_ID_FIELDS {
            if let Some(value) = scan.observe(request, field) {
                scan.base.get_or_insert((field, value));
            }
        }
        for field in FORK_ID_FIELDS {
            if let Some(value) = scan.observe(request, field).and_then(|v| normalize_fork_id(&v)) {
                scan.fork.get_or_insert((field, value));
            }
        }
        scan
    }

    /// Record a present field and return its trimmed value when usable
    fn observe(&mut self, request: &ResponsesRequest, field: &str) -> Option<String> {
        let value = request.hint(field)?;
        self.hint_keys.push(field.to_string());
        match usable_string(value) {
            Some(s) => Some(s.to_string()),
            None => {
                self.unusable_keys.push(field.to_string());
                None
            }
        }
    }

    fn conversation_key(&self) -> Option<String> {
        let (_, base) = self.base.as_ref()?;
        Some(match &self.fork {
            Some((_, fork)) => format!("{}-fork-{}", base, fork),
            None => base.clone(),
        })
    }
}

fn usable_string(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Lowercase, collapse anything outside `[a-z0-9_.:-]` to `-`, trim dashes
pub fn normalize_fork_id(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let normalized = FORK_ID_SANITIZER.replace_all(&lowered, "-");
    let normalized = normalized.trim_matches('-');
    (!normalized.is_empty()).then(|| normalized.to_string())
}

/// Host-supplied cache key, if any, with the field it came from
pub fn explicit_cache_key(request: &ResponsesRequest) -> Option<(&'static str, String)> {
    let [snake, camel] = PROMPT_CACHE_KEY_FIELDS;
    if let Some(key) = request.prompt_cache_key.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some((snake, key.to_string()));
    }
    request
        .extra
        .get(camel)
        .and_then(usable_string)
        .map(|key| (camel, key.to_string()))
}

/// Conversation identity from metadata alone (base id plus fork suffix)
pub fn conversation_key(request: &ResponsesRequest) -> Option<String> {
    MetadataScan::run(request).conversation_key()
}

/// Resolve the prompt cache key for a request: host key, then metadata,
/// then a deterministic hash of the request shape. Never fails.
pub fn ensure_prompt_cache_key(request: &ResponsesRequest) -> CacheKeyResult {
    if let Some((field, key)) = explicit_cache_key(request) {
        let mut result = CacheKeyResult::new(key, CacheKeySource::Existing);
        result.source_key = Some(field.to_string());
        return result;
    }

    let scan = MetadataScan::run(request);
    if let Some(key) = scan.conversation_key() {
        let mut result = CacheKeyResult::new(key, CacheKeySource::Metadata);
        result.source_key = scan.base.as_ref().map(|(field, _)| field.to_string());
        result.fork_source_key = scan.fork.as_ref().map(|(field, _)| field.to_string());
        result.hint_keys = scan.hint_keys;
        result.unusable_keys = scan.unusable_keys;
        return result;
    }

    let hash = fallback_hash(request);
    let mut result = CacheKeyResult::new(format!("cache_{}", hash), CacheKeySource::Generated);
    result.hint_keys = scan.hint_keys;
    result.unusable_keys = scan.unusable_keys;
    result.fallback_hash = Some(hash);
    result
}

fn fallback_seed(request: &ResponsesRequest) -> String {
    let mut seed = Map::new();
    seed.insert("model".to_string(), Value::String(request.model.clone()));
    seed.insert(
        "metadata".to_string(),
        request.metadata.clone().unwrap_or(Value::Null),
    );
    seed.insert(
        "input".to_string(),
        Value::Array(request.input.iter().take(FALLBACK_INPUT_ITEMS).cloned().collect()),
    );
    stable_json(&Value::Object(seed))
}

fn fallback_hash(request: &ResponsesRequest) -> String {
    sha256_hex(fallback_seed(request).as_bytes())[..FALLBACK_HASH_LEN].to_string()
}
