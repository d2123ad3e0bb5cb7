//! # BrokerState — per-model LRU queues and liveness bookkeeping
//!
//! ## Responsibility
//! Own every piece of mutable broker state: the per-model LRU queues of
//! available workers and the heartbeat table of registered workers.
//! All operations take the current time as a parameter, so every timing
//! rule is testable without sockets or sleeps.
//!
//! ## Guarantees
//! - A worker identity appears at most once across all queues
//! - LRU order is strict FIFO over "became available" events
//! - A worker is evicted strictly after the staleness window elapses
//! - A model entry disappears once its queue drains to empty
//!
//! ## NOT Responsible For
//! - Socket I/O and envelope handling (see: broker)
//! - Spawning workers (see: autostart)

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Broker-side record of one registered worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerRecord {
    /// Model this worker serves.
    pub model: String,
    /// Timestamp of the last READY or HEARTBEAT.
    pub last_seen: Instant,
}

/// Outcome of a READY registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// First time this worker identity has been seen.
    New,
    /// Known worker returning to the queue after a dispatch.
    Requeued,
    /// Worker was already queued; duplicate READY, no queue mutation.
    AlreadyQueued,
}

/// All mutable routing state, owned exclusively by the broker loop.
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    /// Available (not mid-request) workers per model, LRU order:
    /// front = next to dispatch, back = most recently returned.
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    /// Every registered worker, keyed by identity; includes workers
    /// currently mid-request.
    workers: HashMap<Vec<u8>, WorkerRecord>,
}

impl BrokerState {
    /// Handle a READY message: upsert the worker record, refresh its
    /// heartbeat, and append it to its model's queue unless already
    /// present.
    pub fn register_ready(&mut self, worker_id: &[u8], model: &str, now: Instant) -> Registration {
        let is_new = !self.workers.contains_key(worker_id);

        // A worker switching models is migrated out of its old queue.
        if let Some(record) = self.workers.get(worker_id) {
            if record.model != model {
                let old_model = record.model.clone();
                self.remove_from_queue(worker_id, &old_model);
            }
        }

        self.workers.insert(
            worker_id.to_vec(),
            WorkerRecord {
                model: model.to_string(),
                last_seen: now,
            },
        );

        let queue = self.queues.entry(model.to_string()).or_default();
        if queue.iter().any(|id| id == worker_id) {
            Registration::AlreadyQueued
        } else {
            queue.push_back(worker_id.to_vec());
            if is_new {
                Registration::New
            } else {
                Registration::Requeued
            }
        }
    }

    /// Handle a HEARTBEAT: refresh the timestamp only, no queue
    /// mutation. Heartbeats from unknown identities are ignored.
    pub fn heartbeat(&mut self, worker_id: &[u8], now: Instant) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Pop the least-recently-used available worker for `model`.
    ///
    /// The popped worker is implicitly busy and stays absent from every
    /// queue until its next READY.
    pub fn pop_worker(&mut self, model: &str) -> Option<Vec<u8>> {
        self.queues.get_mut(model).and_then(VecDeque::pop_front)
    }

    /// Whether `model` currently has at least one available worker.
    pub fn has_available(&self, model: &str) -> bool {
        self.queues.get(model).is_some_and(|q| !q.is_empty())
    }

    /// Evict every worker whose heartbeat age exceeds `stale_after`.
    ///
    /// Workers mid-request (absent from the queue) are evicted from the
    /// bookkeeping too; this only affects future availability. Returns
    /// the evicted `(identity, model)` pairs.
    pub fn sweep(&mut self, now: Instant, stale_after: Duration) -> Vec<(Vec<u8>, String)> {
        let stale: Vec<Vec<u8>> = self
            .workers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for worker_id in stale {
            if let Some(record) = self.workers.remove(&worker_id) {
                warn!(
                    worker = %String::from_utf8_lossy(&worker_id),
                    model = %record.model,
                    "worker timed out (no heartbeat)"
                );
                self.remove_from_queue(&worker_id, &record.model);
                evicted.push((worker_id, record.model));
            }
        }
        evicted
    }

    /// Model names with at least one available worker, sorted.
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        models.sort();
        models
    }

    /// Registered worker count per model, including workers mid-request.
    pub fn worker_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.workers.values() {
            *counts.entry(record.model.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Queue length for `model` (available workers only).
    #[cfg(test)]
    pub fn queue_len(&self, model: &str) -> usize {
        self.queues.get(model).map_or(0, VecDeque::len)
    }

    /// Whether `worker_id` is currently registered.
    #[cfg(test)]
    pub fn is_registered(&self, worker_id: &[u8]) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// Remove a worker from a model's queue, dropping the model entry
    /// once the queue is empty.
    fn remove_from_queue(&mut self, worker_id: &[u8], model: &str) {
        let mut drop_model = false;
        if let Some(queue) = self.queues.get_mut(model) {
            if let Some(pos) = queue.iter().position(|id| id == worker_id) {
                queue.remove(pos);
                debug!(
                    worker = %String::from_utf8_lossy(worker_id),
                    model,
                    "removed worker from queue"
                );
            }
            drop_model = queue.is_empty();
        }
        if drop_model {
            self.queues.remove(model);
            info!(model, "no workers left for model, removed from available models");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(15);

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn test_first_ready_is_new_registration() {
        let mut state = BrokerState::default();
        let reg = state.register_ready(b"w1", "lj", Instant::now());
        assert_eq!(reg, Registration::New);
        assert_eq!(state.queue_len("lj"), 1);
    }

    #[test]
    fn test_duplicate_ready_is_idempotent() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        state.register_ready(b"w1", "lj", now);
        let reg = state.register_ready(b"w1", "lj", now);
        assert_eq!(reg, Registration::AlreadyQueued);
        assert_eq!(state.queue_len("lj"), 1, "duplicate READY must not duplicate the queue entry");
    }

    #[test]
    fn test_ready_after_dispatch_requeues_at_back() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        state.register_ready(b"w1", "lj", now);
        state.register_ready(b"w2", "lj", now);

        assert_eq!(state.pop_worker("lj").as_deref(), Some(&b"w1"[..]));
        let reg = state.register_ready(b"w1", "lj", now);
        assert_eq!(reg, Registration::Requeued);
        // w1 completed its request; w2 is now least recently used.
        assert_eq!(state.pop_worker("lj").as_deref(), Some(&b"w2"[..]));
        assert_eq!(state.pop_worker("lj").as_deref(), Some(&b"w1"[..]));
    }

    #[test]
    fn test_lru_round_robin_fairness() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        for id in [&b"w1"[..], b"w2", b"w3"] {
            state.register_ready(id, "lj", now);
        }

        // Six consecutive dispatches with immediate completion cycle
        // w1, w2, w3, w1, w2, w3.
        let mut order = Vec::new();
        for _ in 0..6 {
            let picked = state.pop_worker("lj").unwrap();
            order.push(picked.clone());
            state.register_ready(&picked, "lj", now);
        }
        let expected: Vec<Vec<u8>> = ["w1", "w2", "w3", "w1", "w2", "w3"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_pop_from_unknown_model_is_none() {
        let mut state = BrokerState::default();
        assert_eq!(state.pop_worker("nonesuch"), None);
        assert!(!state.has_available("nonesuch"));
    }

    #[test]
    fn test_heartbeat_refreshes_without_queue_mutation() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"w1", "lj", t0);
        assert_eq!(state.pop_worker("lj").as_deref(), Some(&b"w1"[..]));

        // Heartbeat while busy must not requeue the worker.
        assert!(state.heartbeat(b"w1", at(t0, 5)));
        assert_eq!(state.queue_len("lj"), 0);
        assert!(state.is_registered(b"w1"));
    }

    #[test]
    fn test_heartbeat_from_unknown_worker_is_ignored() {
        let mut state = BrokerState::default();
        assert!(!state.heartbeat(b"ghost", Instant::now()));
        assert!(!state.is_registered(b"ghost"));
    }

    #[test]
    fn test_sweep_keeps_fresh_workers() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"w1", "lj", t0);

        // Strictly within the window: nothing happens.
        let evicted = state.sweep(at(t0, 15), STALE);
        assert!(evicted.is_empty());
        assert!(state.is_registered(b"w1"));
        assert_eq!(state.available_models(), vec!["lj".to_string()]);
    }

    #[test]
    fn test_sweep_evicts_after_staleness_window() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"w1", "lj", t0);

        let evicted = state.sweep(at(t0, 16), STALE);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, "lj");
        assert!(!state.is_registered(b"w1"));
        // Queue drained to empty: the model entry is gone entirely.
        assert!(state.available_models().is_empty());
        assert_eq!(state.worker_counts().len(), 0);
    }

    #[test]
    fn test_heartbeat_defers_eviction() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"w1", "lj", t0);
        state.heartbeat(b"w1", at(t0, 10));

        assert!(state.sweep(at(t0, 20), STALE).is_empty());
        let evicted = state.sweep(at(t0, 26), STALE);
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_busy_worker_from_bookkeeping() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"w1", "lj", t0);
        assert!(state.pop_worker("lj").is_some()); // now mid-request

        let evicted = state.sweep(at(t0, 16), STALE);
        assert_eq!(evicted.len(), 1);
        assert!(!state.is_registered(b"w1"));

        // Its eventual READY after completing re-registers it as new.
        let reg = state.register_ready(b"w1", "lj", at(t0, 17));
        assert_eq!(reg, Registration::New);
    }

    #[test]
    fn test_sweep_only_evicts_stale_workers() {
        let mut state = BrokerState::default();
        let t0 = Instant::now();
        state.register_ready(b"old", "lj", t0);
        state.register_ready(b"fresh", "lj", at(t0, 10));

        let evicted = state.sweep(at(t0, 20), STALE);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, b"old".to_vec());
        assert_eq!(state.queue_len("lj"), 1);
        assert_eq!(state.available_models(), vec!["lj".to_string()]);
    }

    #[test]
    fn test_worker_changing_model_is_migrated() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        state.register_ready(b"w1", "lj", now);
        state.register_ready(b"w1", "constant", now);

        assert!(!state.has_available("lj"));
        assert_eq!(state.queue_len("constant"), 1);
        let counts = state.worker_counts();
        assert_eq!(counts.get("constant"), Some(&1));
        assert_eq!(counts.get("lj"), None);
    }

    #[test]
    fn test_identity_unique_across_queues() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        state.register_ready(b"w1", "lj", now);
        state.register_ready(b"w1", "constant", now);
        state.register_ready(b"w1", "constant", now);

        let total: usize = ["lj", "constant"]
            .iter()
            .map(|m| state.queue_len(m))
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_available_models_sorted_and_nonempty_only() {
        let mut state = BrokerState::default();
        let now = Instant::now();
        state.register_ready(b"w1", "zeta", now);
        state.register_ready(b"w2", "alpha", now);
        state.register_ready(b"w3", "alpha", now);
        assert!(state.pop_worker("zeta").is_some());

        // zeta's only worker is busy; its (empty) queue is not listed.
        assert_eq!(state.available_models(), vec!["alpha".to_string()]);
        // But it is still a registered worker for counting purposes.
        assert_eq!(state.worker_counts().get("zeta"), Some(&1));
    }
}
