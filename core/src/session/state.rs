//! Per-conversation state and the per-request context handle

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::session::input::InputItem;

/// One logical conversation
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub id: String,
    /// Sent upstream; changes only on divergence
    pub prompt_cache_key: String,
    pub store: bool,
    /// Owned snapshot of the last accepted input sequence
    pub last_input: Vec<InputItem>,
    pub last_prefix_hash: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub last_cached_tokens: Option<u64>,
    pub bridge_injected: bool,
}

impl SessionState {
    pub fn new(id: String, prompt_cache_key: String, store: bool, now: DateTime<Utc>) -> Self {
        Self {
            id,
            prompt_cache_key,
            store,
            last_input: Vec::new(),
            last_prefix_hash: None,
            last_updated: now,
            last_cached_tokens: None,
            bridge_injected: false,
        }
    }

    pub(crate) fn accept_input(&mut self, input: Vec<InputItem>, hash: String, now: DateTime<Utc>) {
        self.last_input = input;
        self.last_prefix_hash = Some(hash);
        self.last_updated = now;
    }
}

/// Registry entry: the state itself plus a lock that serializes the
/// apply/upstream/record sequence of one conversation.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) state: Mutex<SessionState>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl SessionSlot {
    pub(crate) fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Transient handle returned by the registry for one request
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub enabled: bool,
    /// Whether item ids may stay in the outgoing input
    pub preserve_ids: bool,
    pub is_new: bool,
    pub(crate) slot: Arc<SessionSlot>,
}

impl SessionContext {
    pub(crate) fn new(session_id: String, enabled: bool, is_new: bool, slot: Arc<SessionSlot>) -> Self {
        Self {
            session_id,
            enabled,
            preserve_ids: enabled,
            is_new,
            slot,
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.slot.state.lock();
        f(&mut state)
    }

    pub fn prompt_cache_key(&self) -> String {
        self.slot.state.lock().prompt_cache_key.clone()
    }

    /// Wait until no other request of this conversation is in flight
    pub async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.slot.turn).lock_owned().await
    }
}
