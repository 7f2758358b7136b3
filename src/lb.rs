//! Load-balancer state (spec §4.D): per-service, per-config failure
//! counters, exclusion set, last-reset timestamp. Persists to
//! `~/.clp/data/lb_config.json`, reloaded on external edit under the same
//! mutex as every mutation (spec §5, "single mutex per proxy instance").
//! Grounded on `original_source/src/core/base_proxy.py`'s
//! `_select_weighted_config_locked`, `_record_lb_result`,
//! `_reset_lb_service_failures`, `_get_candidate_order`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbFileState {
    #[serde(default)]
    pub current_failures: BTreeMap<String, u32>,
    #[serde(default)]
    pub excluded_configs: BTreeSet<String>,
    #[serde(default)]
    pub last_reset_at: u64,
}

impl Default for LbFileState {
    fn default() -> Self {
        Self {
            current_failures: BTreeMap::new(),
            excluded_configs: BTreeSet::new(),
            last_reset_at: 0,
        }
    }
}

pub struct LbState {
    path: PathBuf,
    threshold: u32,
    reset_cooldown_seconds: u64,
    inner: Mutex<LbFileState>,
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl LbState {
    pub fn new(path: PathBuf, threshold: u32, reset_cooldown_seconds: u64) -> Self {
        let initial = Self::read_file(&path).unwrap_or_default();
        Self {
            path,
            threshold,
            reset_cooldown_seconds,
            inner: Mutex::new(initial),
        }
    }

    fn read_file(path: &PathBuf) -> Option<LbFileState> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn persist_locked(&self, state: &LbFileState) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(text) = serde_json::to_string_pretty(state) {
            let _ = fs::write(&self.path, text);
        }
    }

    /// Reload external edits before reading, dropping any per-config entry
    /// that purged `known_configs` no longer contains (spec §3, "entries for
    /// configs not present in `C` are purged on config write").
    fn sync_with_disk_locked(&self, state: &mut LbFileState, known_configs: &[String]) {
        if let Some(on_disk) = Self::read_file(&self.path) {
            *state = on_disk;
        }
        let known: BTreeSet<&str> = known_configs.iter().map(String::as_str).collect();
        state.current_failures.retain(|name, _| known.contains(name.as_str()));
        state.excluded_configs.retain(|name| known.contains(name.as_str()));
    }

    /// `Candidates(service, configs)`: ordered list of healthy candidate
    /// names. `configs` must already be sorted by `(-weight, name)` by the
    /// caller (the dispatcher has the weight information; this component
    /// only tracks health).
    pub fn candidates(&self, ordered_configs: &[String]) -> Vec<String> {
        let mut state = self.inner.lock().expect("lb state poisoned");
        self.sync_with_disk_locked(&mut state, ordered_configs);
        ordered_configs
            .iter()
            .filter(|name| self.is_healthy_locked(&state, name))
            .cloned()
            .collect()
    }

    fn is_healthy_locked(&self, state: &LbFileState, name: &str) -> bool {
        let failures = state.current_failures.get(name).copied().unwrap_or(0);
        failures < self.threshold && !state.excluded_configs.contains(name)
    }

    pub fn is_healthy(&self, name: &str, known_configs: &[String]) -> bool {
        let mut state = self.inner.lock().expect("lb state poisoned");
        self.sync_with_disk_locked(&mut state, known_configs);
        self.is_healthy_locked(&state, name)
    }

    /// `Record(service, name, status_code)`. `status_code = None` models a
    /// request-level error (no HTTP status ever received).
    pub fn record(&self, name: Option<&str>, status_code: Option<u16>, known_configs: &[String]) {
        let Some(name) = name else { return };
        let success = matches!(status_code, Some(200..=299) | Some(304) | Some(307));

        let mut state = self.inner.lock().expect("lb state poisoned");
        self.sync_with_disk_locked(&mut state, known_configs);

        let before_failures = state.current_failures.get(name).copied().unwrap_or(0);
        let before_excluded = state.excluded_configs.contains(name);

        if success {
            state.current_failures.remove(name);
            state.excluded_configs.remove(name);
        } else {
            let updated = (before_failures + 1).min(self.threshold);
            state.current_failures.insert(name.to_string(), updated);
            if updated >= self.threshold {
                state.excluded_configs.insert(name.to_string());
            }
        }

        let after_failures = state.current_failures.get(name).copied().unwrap_or(0);
        let after_excluded = state.excluded_configs.contains(name);
        if before_failures != after_failures || before_excluded != after_excluded {
            self.persist_locked(&state);
        }
    }

    /// `TryReset(service)`: cooldown-gated. Clears failures/exclusions and
    /// bumps `lastResetAt` only if the cooldown has elapsed; returns whether
    /// a reset actually happened.
    pub fn try_reset(&self) -> bool {
        let mut state = self.inner.lock().expect("lb state poisoned");
        let now = now_epoch_seconds();
        if now.saturating_sub(state.last_reset_at) < self.reset_cooldown_seconds {
            return false;
        }
        state.current_failures.clear();
        state.excluded_configs.clear();
        state.last_reset_at = now;
        self.persist_locked(&state);
        true
    }

    pub fn cooldown_remaining_seconds(&self) -> u64 {
        let state = self.inner.lock().expect("lb state poisoned");
        let now = now_epoch_seconds();
        let elapsed = now.saturating_sub(state.last_reset_at);
        self.reset_cooldown_seconds.saturating_sub(elapsed)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset_cooldown_seconds(&self) -> u64 {
        self.reset_cooldown_seconds
    }

    pub fn snapshot_failures(&self, name: &str) -> u32 {
        self.inner
            .lock()
            .expect("lb state poisoned")
            .current_failures
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn excluded_count(&self) -> usize {
        self.inner.lock().expect("lb state poisoned").excluded_configs.len()
    }
}

/// Sorts config names by `(-weight, name)` — the stable candidate ordering
/// spec.md §4.D and §4.H both require.
pub fn order_by_weight(weights: &BTreeMap<String, f64>) -> Vec<String> {
    let mut entries: Vec<(&String, &f64)> = weights.iter().collect();
    entries.sort_by(|(name_a, weight_a), (name_b, weight_b)| {
        weight_b
            .partial_cmp(weight_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| name_a.cmp(name_b))
    });
    entries.into_iter().map(|(name, _)| name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn failure_counters_never_exceed_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 3, 30);
        for _ in 0..10 {
            lb.record(Some("a"), Some(500), &configs());
        }
        assert_eq!(lb.snapshot_failures("a"), 3);
    }

    #[test]
    fn excluded_iff_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 3, 30);
        lb.record(Some("a"), Some(500), &configs());
        lb.record(Some("a"), Some(500), &configs());
        assert!(lb.is_healthy("a", &configs()));
        lb.record(Some("a"), Some(500), &configs());
        assert!(!lb.is_healthy("a", &configs()));
    }

    #[test]
    fn success_clears_failures_and_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 2, 30);
        lb.record(Some("a"), Some(500), &configs());
        lb.record(Some("a"), Some(500), &configs());
        assert!(!lb.is_healthy("a", &configs()));
        lb.record(Some("a"), Some(200), &configs());
        assert!(lb.is_healthy("a", &configs()));
        assert_eq!(lb.snapshot_failures("a"), 0);
    }

    #[test]
    fn try_reset_respects_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 1, 3600);
        lb.record(Some("a"), Some(500), &configs());
        assert!(!lb.is_healthy("a", &configs()));
        assert!(!lb.try_reset());
        assert!(!lb.is_healthy("a", &configs()));
    }

    #[test]
    fn try_reset_clears_all_state_when_not_cooled_down_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 1, 0);
        lb.record(Some("a"), Some(500), &configs());
        assert!(lb.try_reset());
        assert!(lb.is_healthy("a", &configs()));
    }

    #[test]
    fn candidates_returns_only_healthy_in_given_order() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 1, 30);
        lb.record(Some("a"), Some(500), &configs());
        let cands = lb.candidates(&["a".to_string(), "b".to_string()]);
        assert_eq!(cands, vec!["b".to_string()]);
    }

    #[test]
    fn order_by_weight_is_stable_descending_then_lexical() {
        let mut weights = BTreeMap::new();
        weights.insert("b".to_string(), 5.0);
        weights.insert("a".to_string(), 10.0);
        weights.insert("c".to_string(), 5.0);
        assert_eq!(order_by_weight(&weights), vec!["a", "b", "c"]);
    }

    #[test]
    fn record_with_nil_name_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let lb = LbState::new(dir.path().join("lb_config.json"), 3, 30);
        lb.record(None, Some(500), &configs());
        assert_eq!(lb.snapshot_failures("a"), 0);
    }
}
