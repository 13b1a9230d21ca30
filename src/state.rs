//! Per-page-load memory of what has already fired.
//!
//! Everything here is mutated through short synchronous calls while the
//! engine holds its state lock; no lock is ever held across an await.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerCacheKey {
    pub trigger_id: String,
    pub trigger_type: &'static str,
    pub event_type: &'static str,
}

#[derive(Debug, Default)]
pub struct EngineState {
    executed_nodes: HashSet<String>,
    trigger_cache: HashMap<TriggerCacheKey, Instant>,
    click_cache: HashMap<(String, String), Instant>,
    awaiting_elements: HashSet<(String, String)>,
    closed_by_user: HashSet<String>,
    exit_intent_fired: bool,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_executed(&self, key: &str) -> bool {
        self.executed_nodes.contains(key)
    }

    /// Returns false when the key had already been marked.
    pub fn mark_executed(&mut self, key: &str) -> bool {
        self.executed_nodes.insert(key.to_string())
    }

    pub fn executed_count(&self) -> usize {
        self.executed_nodes.len()
    }

    /// Records a firing unless the same key fired within `window`.
    pub fn try_fire_trigger(&mut self, key: TriggerCacheKey, now: Instant, window: Duration) -> bool {
        if let Some(last) = self.trigger_cache.get(&key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        self.trigger_cache.insert(key, now);
        true
    }

    /// The faster-expiring click layer keyed by `(selector, matched_selector)`.
    pub fn try_register_click(
        &mut self,
        selector: &str,
        matched_selector: &str,
        now: Instant,
        window: Duration,
    ) -> bool {
        let key = (selector.to_string(), matched_selector.to_string());
        if let Some(last) = self.click_cache.get(&key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        self.click_cache.insert(key, now);
        true
    }

    /// Claims a wait on `selector` for one action node; false if that node
    /// already waits on it. Other nodes may wait on the same selector.
    pub fn begin_await(&mut self, selector: &str, execution_key: &str) -> bool {
        self.awaiting_elements
            .insert((selector.to_string(), execution_key.to_string()))
    }

    pub fn end_await(&mut self, selector: &str, execution_key: &str) {
        self.awaiting_elements
            .remove(&(selector.to_string(), execution_key.to_string()));
    }

    pub fn mark_closed_by_user(&mut self, selector: &str) {
        self.closed_by_user.insert(selector.to_string());
    }

    pub fn is_closed_by_user(&self, selector: &str) -> bool {
        self.closed_by_user.contains(selector)
    }

    /// Exit intent fires at most once per page load.
    pub fn claim_exit_intent(&mut self) -> bool {
        !std::mem::replace(&mut self.exit_intent_fired, true)
    }

    /// Drop cache entries older than `max_age`.
    pub fn prune(&mut self, now: Instant, max_age: Duration) {
        self.trigger_cache
            .retain(|_, fired| now.saturating_duration_since(*fired) < max_age);
        self.click_cache
            .retain(|_, fired| now.saturating_duration_since(*fired) < max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> TriggerCacheKey {
        TriggerCacheKey {
            trigger_id: id.to_string(),
            trigger_type: "Scroll Depth",
            event_type: "scroll",
        }
    }

    #[test]
    fn trigger_cache_suppresses_within_window() {
        let mut state = EngineState::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(30);

        assert!(state.try_fire_trigger(key("t1"), t0, window));
        assert!(!state.try_fire_trigger(key("t1"), t0 + Duration::from_secs(29), window));
        assert!(state.try_fire_trigger(key("t2"), t0, window));
        assert!(state.try_fire_trigger(key("t1"), t0 + Duration::from_secs(31), window));
    }

    #[test]
    fn click_cache_expires_faster() {
        let mut state = EngineState::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(5);

        assert!(state.try_register_click("#buy", "#buy", t0, window));
        assert!(!state.try_register_click("#buy", "#buy", t0 + Duration::from_secs(4), window));
        assert!(state.try_register_click("#buy", ".cta", t0, window));
        assert!(state.try_register_click("#buy", "#buy", t0 + Duration::from_secs(6), window));
    }

    #[test]
    fn executed_nodes_are_marked_once() {
        let mut state = EngineState::new();
        assert!(state.mark_executed("a1"));
        assert!(!state.mark_executed("a1"));
        assert!(state.is_executed("a1"));
        assert_eq!(state.executed_count(), 1);
    }

    #[test]
    fn await_and_exit_intent_claims() {
        let mut state = EngineState::new();
        assert!(state.begin_await(".banner", "a1"));
        assert!(!state.begin_await(".banner", "a1"));
        assert!(state.begin_await(".banner", "a2"));
        state.end_await(".banner", "a1");
        assert!(state.begin_await(".banner", "a1"));

        assert!(state.claim_exit_intent());
        assert!(!state.claim_exit_intent());
    }

    #[test]
    fn prune_forgets_old_firings() {
        let mut state = EngineState::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(30);
        state.try_fire_trigger(key("t1"), t0, window);
        state.prune(t0 + Duration::from_secs(60), window);
        assert!(state.try_fire_trigger(key("t1"), t0 + Duration::from_secs(61), window));
    }
}
