//! Outgoing Responses API request body as seen by the continuity engine

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::input::InputItem;

/// Request body forwarded upstream. Only the fields the engine reads or
/// writes are typed; everything else round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Vec<InputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsesRequest {
    pub fn new(model: impl Into<String>, input: Vec<InputItem>) -> Self {
        Self {
            model: model.into(),
            input,
            ..Self::default()
        }
    }

    /// Field lookup that prefers `metadata` and falls back to the body root
    pub fn hint(&self, field: &str) -> Option<&Value> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(field))
            .or_else(|| self.extra.get(field))
    }

    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map_or(0, Vec::len)
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Overwrite the outgoing cache key, dropping the camelCase spelling
    pub fn set_prompt_cache_key(&mut self, key: impl Into<String>) {
        self.extra.remove("promptCacheKey");
        self.prompt_cache_key = Some(key.into());
    }
}
