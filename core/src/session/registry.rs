//! Session registry: per-conversation continuity and prompt cache keys
//!
//! Every request goes through `get_context` -> `apply_request` ->
//! `record_response`. A request whose input no longer starts with the
//! previously accepted input is a new logical conversation and receives a
//! fresh cache key.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::metrics::{CacheMetrics, SESSIONS_BUCKET};
use crate::config::SessionConfig;
use crate::session::input::{clone_input, hash_input, prefix_mismatch};
use crate::session::key::{conversation_key, ensure_prompt_cache_key, explicit_cache_key};
use crate::session::request::ResponsesRequest;
use crate::session::state::{SessionContext, SessionSlot, SessionState};

/// Diagnostic view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub prompt_cache_key: String,
    pub last_cached_tokens: Option<u64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub total_sessions: usize,
    pub recent_sessions: Vec<SessionSummary>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: DashMap<String, Arc<SessionSlot>>,
    metrics: Arc<CacheMetrics>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn get_context(&self, request: &ResponsesRequest) -> SessionContext {
        self.get_context_at(request, Utc::now())
    }

    /// Find or create the session a request belongs to
    pub fn get_context_at(&self, request: &ResponsesRequest, now: DateTime<Utc>) -> SessionContext {
        if !self.config.enabled {
            let derived = ensure_prompt_cache_key(request);
            let state = SessionState::new(derived.key.clone(), derived.key.clone(), false, now);
            return SessionContext::new(derived.key, false, true, Arc::new(SessionSlot::new(state)));
        }

        let host_key = explicit_cache_key(request).map(|(_, key)| key);
        let session_id = conversation_key(request)
            .or_else(|| host_key.clone())
            .unwrap_or_else(|| ensure_prompt_cache_key(request).key);

        self.sweep_at(now, Some(&session_id));

        let (slot, is_new) = match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let derived = ensure_prompt_cache_key(request);
                tracing::debug!(
                    "New session {} (cache key source {:?}, field {:?})",
                    session_id,
                    derived.source,
                    derived.source_key
                );
                let state = SessionState::new(session_id.clone(), derived.key, self.config.force_store, now);
                let slot = Arc::new(SessionSlot::new(state));
                entry.insert(Arc::clone(&slot));
                (slot, true)
            }
        };

        if is_new {
            self.metrics.record_miss(SESSIONS_BUCKET);
            self.evict_overflow(Some(&session_id));
        } else {
            self.metrics.record_hit(SESSIONS_BUCKET);
            let current = {
                let mut state = slot.state.lock();
                state.last_updated = now;
                state.prompt_cache_key.clone()
            };
            if let Some(host_key) = host_key {
                if host_key != current {
                    tracing::debug!(
                        "Session {} keeps cache key {} despite host key {}",
                        session_id,
                        current,
                        host_key
                    );
                }
            }
        }

        SessionContext::new(session_id, true, is_new, slot)
    }

    pub fn apply_request(&self, request: &mut ResponsesRequest, context: SessionContext) -> SessionContext {
        self.apply_request_at(request, context, Utc::now())
    }

    /// Stamp the outgoing body and validate continuity against the stored
    /// snapshot. Divergence resets the session under a fresh cache key.
    pub fn apply_request_at(
        &self,
        request: &mut ResponsesRequest,
        context: SessionContext,
        now: DateTime<Utc>,
    ) -> SessionContext {
        if !context.enabled {
            return context;
        }

        // Slot may have been evicted while this turn waited on its lock
        if let Entry::Vacant(entry) = self.sessions.entry(context.session_id.clone()) {
            tracing::debug!("Session {} was evicted mid-turn, restoring it", context.session_id);
            entry.insert(Arc::clone(&context.slot));
        }
        self.evict_overflow(Some(&context.session_id));

        let mut state = context.slot.state.lock();
        request.set_prompt_cache_key(state.prompt_cache_key.clone());
        if self.config.force_store || state.store {
            request.store = Some(true);
        }

        let input = clone_input(&request.input);
        let input_hash = hash_input(&input);

        if state.last_input.is_empty() || state.last_prefix_hash.as_deref() == Some(input_hash.as_str()) {
            state.accept_input(input, input_hash, now);
            drop(state);
            return context;
        }

        let Some(mismatch_index) = prefix_mismatch(&state.last_input, &input) else {
            state.accept_input(input, input_hash, now);
            drop(state);
            return context;
        };

        let previous_len = state.last_input.len();
        let incoming_len = input.len();
        let fresh_key = generate_cache_key();
        tracing::warn!(
            session_id = %context.session_id,
            previous_len,
            incoming_len,
            mismatch_index,
            "Prompt prefix diverged, rotating cache key {} -> {}",
            state.prompt_cache_key,
            fresh_key
        );

        let mut fresh = SessionState::new(state.id.clone(), fresh_key.clone(), self.config.force_store, now);
        fresh.bridge_injected = state.bridge_injected;
        fresh.accept_input(input, input_hash, now);
        *state = fresh;
        drop(state);

        request.set_prompt_cache_key(fresh_key);
        SessionContext {
            is_new: true,
            ..context
        }
    }

    pub fn record_response(&self, context: &SessionContext, payload: &Value) {
        self.record_response_at(context, payload, Utc::now());
    }

    /// Store the backend's cached-token count, if the payload carries one
    pub fn record_response_at(&self, context: &SessionContext, payload: &Value, now: DateTime<Utc>) {
        if !context.enabled {
            return;
        }
        let cached_tokens = extract_cached_tokens(payload);
        context.with_state(|state| {
            match cached_tokens {
                Some(tokens) => state.last_cached_tokens = Some(tokens),
                None => tracing::debug!("No cached token usage in response for session {}", state.id),
            }
            state.last_updated = now;
        });
    }

    /// Total session count plus the `limit` most recently updated sessions
    pub fn get_metrics(&self, limit: usize) -> SessionMetrics {
        let mut recent: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let state = entry.value().state.lock();
                SessionSummary {
                    id: state.id.clone(),
                    prompt_cache_key: state.prompt_cache_key.clone(),
                    last_cached_tokens: state.last_cached_tokens,
                    last_updated: state.last_updated,
                }
            })
            .collect();
        recent.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then_with(|| a.id.cmp(&b.id)));
        recent.truncate(limit);

        SessionMetrics {
            total_sessions: self.sessions.len(),
            recent_sessions: recent,
        }
    }

    /// Idle and capacity eviction, returning how many sessions were dropped
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now(), None)
    }

    pub fn sweep_at(&self, now: DateTime<Utc>, protect: Option<&str>) -> usize {
        let idle_ttl = self.config.idle_ttl();
        let mut idle = 0;
        self.sessions.retain(|id, slot| {
            if protect == Some(id.as_str()) {
                return true;
            }
            let last_updated = slot.state.lock().last_updated;
            let expired = now
                .signed_duration_since(last_updated)
                .to_std()
                .map_or(false, |age| age > idle_ttl);
            if expired {
                idle += 1;
            }
            !expired
        });
        if idle > 0 {
            tracing::debug!("Evicted {} idle session(s)", idle);
            self.metrics.record_eviction(SESSIONS_BUCKET, idle);
        }
        idle + self.evict_overflow(protect)
    }

    /// Drop least-recently-updated sessions until back at `max_entries`
    fn evict_overflow(&self, protect: Option<&str>) -> usize {
        let len = self.sessions.len();
        if len <= self.config.max_entries {
            return 0;
        }

        let mut candidates: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|entry| protect != Some(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), entry.value().state.lock().last_updated))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut removed = 0;
        for (id, _) in candidates.into_iter().take(len - self.config.max_entries) {
            if self.sessions.remove(&id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!("Evicted {} session(s) over capacity {}", removed, self.config.max_entries);
            self.metrics.record_eviction(SESSIONS_BUCKET, removed);
        }
        removed
    }
}

fn generate_cache_key() -> String {
    format!("cache_{}", uuid::Uuid::new_v4().simple())
}

/// Cached-token count from a Responses or Chat Completions usage block.
/// Accepts the payload bare or wrapped as `{"response": {...}}`.
pub fn extract_cached_tokens(payload: &Value) -> Option<u64> {
    let body = payload
        .get("response")
        .filter(|r| r.is_object())
        .unwrap_or(payload);
    let usage = body.get("usage")?.as_object()?;

    usage
        .get("cached_tokens")
        .or_else(|| usage.get("input_tokens_details").and_then(|d| d.get("cached_tokens")))
        .or_else(|| usage.get("prompt_tokens_details").and_then(|d| d.get("cached_tokens")))
        .and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn registry(config: SessionConfig) -> SessionRegistry {
        SessionRegistry::new(config, Arc::new(CacheMetrics::new()))
    }

    fn msg(role: &str, text: &str) -> Value {
        json!({"role": role, "content": text})
    }

    fn conversation(id: &str, input: Vec<Value>) -> ResponsesRequest {
        let mut request = ResponsesRequest::new("gpt-5-codex", input);
        request.metadata = Some(json!({"conversation_id": id}));
        request
    }

    fn turn(registry: &SessionRegistry, request: &mut ResponsesRequest, now: DateTime<Utc>) -> SessionContext {
        let context = registry.get_context_at(request, now);
        registry.apply_request_at(request, context, now)
    }

    #[test]
    fn test_prefix_continuation_keeps_key() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();

        let mut first = conversation("S1", vec![msg("system", "sys"), msg("user", "u1")]);
        let ctx = turn(&registry, &mut first, now);
        assert!(ctx.is_new);
        let key = first.prompt_cache_key.clone().unwrap();
        assert_eq!(key, "S1");

        let mut second = conversation(
            "S1",
            vec![msg("system", "sys"), msg("user", "u1"), msg("assistant", "a1"), msg("user", "u2")],
        );
        let ctx = turn(&registry, &mut second, now);
        assert!(!ctx.is_new);
        assert_eq!(second.prompt_cache_key.as_deref(), Some(key.as_str()));
        assert_eq!(ctx.with_state(|s| s.last_input.len()), 4);
    }

    #[test]
    fn test_divergence_rotates_key() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let (a, b, c) = (msg("system", "a"), msg("user", "b"), msg("assistant", "c"));

        let mut first = conversation("S1", vec![a.clone(), b, c]);
        turn(&registry, &mut first, now);
        let old_key = first.prompt_cache_key.clone().unwrap();

        let mut altered = conversation("S1", vec![a, msg("user", "x")]);
        let ctx = turn(&registry, &mut altered, now);
        assert!(ctx.is_new);
        let new_key = altered.prompt_cache_key.clone().unwrap();
        assert_ne!(new_key, old_key);
        assert!(new_key.starts_with("cache_"));
        assert_eq!(ctx.prompt_cache_key(), new_key);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_example_scenario_three_turns() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let history = |first: &str, n: usize| {
            let mut items = vec![
                msg("system", first),
                msg("user", "u1"),
                msg("assistant", "a1"),
                msg("user", "u2"),
                msg("user", "u3"),
            ];
            items.truncate(n);
            let mut request = ResponsesRequest::new("gpt-5", items);
            request.prompt_cache_key = Some("cache_abc".to_string());
            request
        };

        let mut t1 = history("sys", 2);
        assert!(turn(&registry, &mut t1, now).is_new);
        assert_eq!(t1.prompt_cache_key.as_deref(), Some("cache_abc"));

        let mut t2 = history("sys", 4);
        assert!(!turn(&registry, &mut t2, now).is_new);
        assert_eq!(t2.prompt_cache_key.as_deref(), Some("cache_abc"));

        let mut t3 = history("sys_modified", 5);
        let ctx = turn(&registry, &mut t3, now);
        assert!(ctx.is_new);
        assert_ne!(t3.prompt_cache_key.as_deref(), Some("cache_abc"));
        assert_eq!(ctx.session_id, "cache_abc");
        assert_eq!(ctx.with_state(|s| s.last_input.len()), 5);
    }

    #[test]
    fn test_stateless_retries_share_a_session() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let body = || ResponsesRequest::new("gpt-5", vec![msg("system", "sys"), msg("user", "hello")]);

        let mut first = body();
        assert!(turn(&registry, &mut first, now).is_new);
        let mut retry = body();
        assert!(!turn(&registry, &mut retry, now).is_new);
        assert_eq!(first.prompt_cache_key, retry.prompt_cache_key);
    }

    #[test]
    fn test_truncated_history_is_divergence() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut first = conversation("S1", vec![msg("user", "1"), msg("assistant", "2"), msg("user", "3")]);
        turn(&registry, &mut first, now);

        let mut truncated = conversation("S1", vec![msg("user", "1")]);
        assert!(turn(&registry, &mut truncated, now).is_new);
    }

    #[test]
    fn test_identical_replay_continues() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let input = vec![msg("user", "same")];
        let mut first = conversation("S1", input.clone());
        turn(&registry, &mut first, now);
        let mut again = conversation("S1", input);
        assert!(!turn(&registry, &mut again, now).is_new);
        assert_eq!(again.prompt_cache_key, first.prompt_cache_key);
    }

    #[test]
    fn test_stored_snapshot_is_not_aliased() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut request = conversation("S1", vec![msg("user", "original")]);
        let ctx = turn(&registry, &mut request, now);

        request.input[0]["content"] = json!("mutated by caller");
        assert_eq!(ctx.with_state(|s| s.last_input[0]["content"].clone()), json!("original"));
    }

    #[test]
    fn test_force_store_and_disabled_registry() {
        let forced = registry(SessionConfig {
            force_store: true,
            ..SessionConfig::default()
        });
        let mut request = conversation("S1", vec![msg("user", "hi")]);
        turn(&forced, &mut request, Utc::now());
        assert_eq!(request.store, Some(true));

        let disabled = registry(SessionConfig {
            enabled: false,
            ..SessionConfig::default()
        });
        let mut request = conversation("S1", vec![msg("user", "hi")]);
        let ctx = turn(&disabled, &mut request, Utc::now());
        assert!(!ctx.enabled);
        assert!(!ctx.preserve_ids);
        assert_eq!(request.prompt_cache_key, None);
        assert_eq!(request.store, None);
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_host_key_identifies_session_without_conversation_id() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut first = ResponsesRequest::new("m", vec![msg("user", "a")]);
        first.prompt_cache_key = Some("host-key".to_string());
        assert!(registry.get_context_at(&first, now).is_new);

        let mut second = ResponsesRequest::new("m", vec![msg("user", "different")]);
        second.prompt_cache_key = Some("host-key".to_string());
        let ctx = registry.get_context_at(&second, now);
        assert!(!ctx.is_new);
        assert_eq!(ctx.session_id, "host-key");
    }

    #[test]
    fn test_conversation_id_wins_over_later_host_key() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut first = conversation("C1", vec![msg("user", "a")]);
        first.prompt_cache_key = Some("key-one".to_string());
        turn(&registry, &mut first, now);

        let mut second = conversation("C1", vec![msg("user", "a"), msg("user", "b")]);
        second.prompt_cache_key = Some("key-two".to_string());
        let ctx = turn(&registry, &mut second, now);
        assert!(!ctx.is_new);
        assert_eq!(second.prompt_cache_key.as_deref(), Some("key-one"));
    }

    #[test]
    fn test_capacity_eviction_drops_least_recent() {
        let registry = registry(SessionConfig {
            max_entries: 3,
            ..SessionConfig::default()
        });
        let start = Utc::now();
        for i in 0..3 {
            let request = conversation(&format!("s{}", i), vec![]);
            registry.get_context_at(&request, start + Duration::seconds(i));
        }
        // s0 is the oldest until it is touched again
        let touch = conversation("s0", vec![msg("user", "hi")]);
        let ctx = registry.get_context_at(&touch, start + Duration::seconds(10));
        registry.record_response_at(&ctx, &json!({}), start + Duration::seconds(10));

        let newest = conversation("s3", vec![]);
        let ctx = registry.get_context_at(&newest, start + Duration::seconds(11));
        assert!(ctx.is_new);
        assert_eq!(registry.len(), 3);

        let ids: Vec<String> = registry.get_metrics(10).recent_sessions.into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&"s3".to_string()));
        assert!(ids.contains(&"s0".to_string()));
        assert!(!ids.contains(&"s1".to_string()));
    }

    #[test]
    fn test_capacity_never_evicts_the_new_session() {
        let registry = registry(SessionConfig {
            max_entries: 2,
            ..SessionConfig::default()
        });
        // Clock skew: the newcomer carries the oldest timestamp
        let now = Utc::now();
        registry.get_context_at(&conversation("a", vec![]), now);
        registry.get_context_at(&conversation("b", vec![]), now);
        let ctx = registry.get_context_at(&conversation("late", vec![]), now - Duration::hours(1));
        assert!(ctx.is_new);
        assert_eq!(registry.len(), 2);
        assert!(registry.get_metrics(5).recent_sessions.iter().any(|s| s.id == "late"));
    }

    #[test]
    fn test_idle_sessions_are_swept() {
        let metrics = Arc::new(CacheMetrics::new());
        let registry = SessionRegistry::new(SessionConfig::default(), Arc::clone(&metrics));
        let start = Utc::now();
        registry.get_context_at(&conversation("idle", vec![]), start);
        registry.get_context_at(&conversation("busy", vec![]), start + Duration::minutes(20));

        let later = start + Duration::minutes(31);
        let ctx = registry.get_context_at(&conversation("busy", vec![]), later);
        assert!(!ctx.is_new);
        assert_eq!(registry.len(), 1);
        assert_eq!(metrics.bucket(SESSIONS_BUCKET).evictions, 1);

        let ctx = registry.get_context_at(&conversation("idle", vec![]), later);
        assert!(ctx.is_new);
    }

    #[test]
    fn test_served_session_survives_its_own_sweep() {
        let registry = registry(SessionConfig::default());
        let start = Utc::now();
        registry.get_context_at(&conversation("old", vec![]), start);
        let ctx = registry.get_context_at(&conversation("old", vec![]), start + Duration::hours(2));
        assert!(!ctx.is_new);
    }

    #[test]
    fn test_record_response_reads_usage_variants() {
        let registry = registry(SessionConfig::default());
        let ctx = registry.get_context(&conversation("S1", vec![]));

        registry.record_response(&ctx, &json!({"usage": {"input_tokens_details": {"cached_tokens": 1536}}}));
        assert_eq!(ctx.with_state(|s| s.last_cached_tokens), Some(1536));

        registry.record_response(&ctx, &json!({"response": {"usage": {"cached_tokens": 7}}}));
        assert_eq!(ctx.with_state(|s| s.last_cached_tokens), Some(7));

        // Malformed usage leaves the last value alone
        registry.record_response(&ctx, &json!({"usage": "oops"}));
        registry.record_response(&ctx, &json!({"usage": {"cached_tokens": "12"}}));
        assert_eq!(ctx.with_state(|s| s.last_cached_tokens), Some(7));
    }

    #[test]
    fn test_record_response_refreshes_last_updated() {
        let registry = registry(SessionConfig::default());
        let start = Utc::now();
        let ctx = registry.get_context_at(&conversation("S1", vec![]), start);
        let later = start + Duration::minutes(5);
        registry.record_response_at(&ctx, &Value::Null, later);
        assert_eq!(ctx.with_state(|s| s.last_updated), later);
    }

    #[test]
    fn test_metrics_lists_most_recent_first() {
        let registry = registry(SessionConfig::default());
        let start = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            registry.get_context_at(&conversation(id, vec![]), start + Duration::seconds(i as i64));
        }
        let metrics = registry.get_metrics(2);
        assert_eq!(metrics.total_sessions, 3);
        let ids: Vec<&str> = metrics.recent_sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_lookup_metrics() {
        let metrics = Arc::new(CacheMetrics::new());
        let registry = SessionRegistry::new(SessionConfig::default(), Arc::clone(&metrics));
        let request = conversation("S1", vec![]);
        registry.get_context(&request);
        registry.get_context(&request);
        let stats = metrics.bucket(SESSIONS_BUCKET);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_session_in_flight_is_not_evicted_by_another_conversation() {
        let registry = registry(SessionConfig {
            max_entries: 2,
            ..SessionConfig::default()
        });
        let start = Utc::now();
        let mut s = conversation("S", vec![msg("user", "a")]);
        turn(&registry, &mut s, start);
        turn(&registry, &mut conversation("X", vec![msg("user", "x")]), start + Duration::seconds(1));

        // S is looked up, then T arrives before S's turn is applied
        let mut s_next = conversation("S", vec![msg("user", "a"), msg("user", "b")]);
        let ctx = registry.get_context_at(&s_next, start + Duration::seconds(2));
        registry.get_context_at(&conversation("T", vec![]), start + Duration::seconds(3));
        let ctx = registry.apply_request_at(&mut s_next, ctx, start + Duration::seconds(4));
        assert!(!ctx.is_new);

        let ids: Vec<String> = registry.get_metrics(10).recent_sessions.into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&"S".to_string()));
        assert!(ids.contains(&"T".to_string()));
        assert!(!ids.contains(&"X".to_string()));

        let mut s_third = conversation("S", vec![msg("user", "a"), msg("user", "b"), msg("user", "c")]);
        assert!(!turn(&registry, &mut s_third, start + Duration::seconds(5)).is_new);
    }

    #[test]
    fn test_evicted_slot_is_restored_on_apply() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut first = conversation("S1", vec![msg("user", "a")]);
        let ctx = registry.get_context_at(&first, now);
        registry.clear();

        let ctx = registry.apply_request_at(&mut first, ctx, now);
        assert_eq!(registry.len(), 1);

        let mut next = conversation("S1", vec![msg("user", "a"), msg("user", "b")]);
        let again = turn(&registry, &mut next, now);
        assert!(!again.is_new);
        assert!(Arc::ptr_eq(&ctx.slot, &again.slot));
    }

    #[test]
    fn test_divergence_keeps_bridge_flag() {
        let registry = registry(SessionConfig::default());
        let now = Utc::now();
        let mut first = conversation("S1", vec![msg("developer", "bridge"), msg("user", "a")]);
        let ctx = turn(&registry, &mut first, now);
        ctx.with_state(|s| s.bridge_injected = true);

        let mut altered = conversation("S1", vec![msg("developer", "bridge"), msg("user", "edited")]);
        let ctx = turn(&registry, &mut altered, now);
        assert!(ctx.is_new);
        assert!(ctx.with_state(|s| s.bridge_injected));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_divergence_warning_reports_lengths_and_index() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let registry = registry(SessionConfig::default());
            let now = Utc::now();
            let history = |first: &str, n: usize| {
                let mut items = vec![
                    msg("system", first),
                    msg("user", "u1"),
                    msg("assistant", "a1"),
                    msg("user", "u2"),
                    msg("user", "u3"),
                ];
                items.truncate(n);
                let mut request = ResponsesRequest::new("gpt-5", items);
                request.prompt_cache_key = Some("cache_abc".to_string());
                request
            };
            turn(&registry, &mut history("sys", 2), now);
            turn(&registry, &mut history("sys", 4), now);
            turn(&registry, &mut history("sys_modified", 5), now);
        });

        let output = String::from_utf8_lossy(&logs.0.lock()).to_string();
        assert!(output.contains("WARN"), "{}", output);
        assert!(output.contains("Prompt prefix diverged"), "{}", output);
        assert!(output.contains("session_id=cache_abc"), "{}", output);
        assert!(output.contains("previous_len=4"), "{}", output);
        assert!(output.contains("incoming_len=5"), "{}", output);
        assert!(output.contains("mismatch_index=0"), "{}", output);
    }

    #[tokio::test]
    async fn test_turns_of_one_conversation_are_serialized() {
        let registry = registry(SessionConfig::default());
        let ctx = registry.get_context(&conversation("S1", vec![]));
        let other = registry.get_context(&conversation("S1", vec![]));

        let guard = ctx.begin_turn().await;
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(50), other.begin_turn()).await;
        assert!(waiting.is_err());
        drop(guard);
        let _guard = other.begin_turn().await;
    }
}
