//! Load balancer over the mutable target registry.

use crate::target::Target;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Balancing strategy, fixed for the balancer's lifetime.
///
/// Wire tags match the option strings accepted at construction
/// (`POLLING`, `WEIGHTS`, `MINIMUM_CONNECTION`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Classic round-robin.
    #[default]
    Polling,
    /// Smooth weighted round-robin.
    Weights,
    /// Fewest in-flight connections, registry order breaking ties.
    MinimumConnection,
    /// Uniform random.
    Random,
    /// Random, proportional to weight.
    WeightsRandom,
    /// Always the caller-pinned target.
    Specify,
}

/// Registry and per-strategy bookkeeping, guarded by the balancer's lock.
#[derive(Debug, Default)]
struct Inner {
    /// Ordered target set; order is the strategies' reference order.
    targets: Vec<Target>,
    /// Round-robin cursor, always < targets.len() when non-empty.
    cursor: usize,
    /// Smooth weighted round-robin running weights, keyed by target id.
    current: HashMap<u16, i64>,
    /// In-flight connection counts, keyed by target id.
    connections: HashMap<u16, usize>,
    /// Pinned target id for [`Strategy::Specify`].
    pinned: Option<u16>,
}

impl Inner {
    /// Drop per-id state for ids no longer registered and clamp the cursor.
    /// State for surviving ids is preserved; new ids start from zero lazily.
    fn reseat(&mut self) {
        let ids: HashSet<u16> = self.targets.iter().map(|t| t.id).collect();
        self.current.retain(|id, _| ids.contains(id));
        self.connections.retain(|id, _| ids.contains(id));
        if self.targets.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.targets.len();
        }
    }
}

/// Selects one target per request according to the configured strategy.
///
/// The registry and all strategy state sit behind a single mutex: a pick and
/// its bookkeeping are atomic with respect to registry mutation. `pick_one`
/// performs no I/O, so the lock is only ever held for map and vec work.
pub struct Balancer {
    strategy: Strategy,
    inner: Mutex<Inner>,
}

impl Balancer {
    /// Create a balancer over an initial target set.
    pub fn new(strategy: Strategy, targets: Vec<Target>) -> Self {
        Self {
            strategy,
            inner: Mutex::new(Inner {
                targets,
                ..Inner::default()
            }),
        }
    }

    /// The strategy this balancer was built with.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select one target. Returns `None` iff the registry is empty, or for
    /// [`Strategy::Specify`] when the pinned id is absent.
    pub fn pick_one(&self) -> Option<Target> {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        if inner.targets.is_empty() {
            return None;
        }

        match self.strategy {
            Strategy::Polling => Some(Self::pick_polling(&mut inner)),
            Strategy::Weights => Some(Self::pick_weights(&mut inner)),
            Strategy::MinimumConnection => Some(Self::pick_minimum_connection(&inner)),
            Strategy::Random => Some(Self::pick_random(&inner)),
            Strategy::WeightsRandom => Some(Self::pick_weights_random(&inner)),
            Strategy::Specify => Self::pick_specify(&inner),
        }
    }

    fn pick_polling(inner: &mut Inner) -> Target {
        let n = inner.targets.len();
        let target = inner.targets[inner.cursor % n];
        inner.cursor = (inner.cursor + 1) % n;
        target
    }

    /// Smooth weighted round-robin: add each weight to its running value,
    /// take the maximum, subtract the weight total from the winner.
    fn pick_weights(inner: &mut Inner) -> Target {
        let total: i64 = inner.targets.iter().map(|t| i64::from(t.weight)).sum();
        for target in &inner.targets {
            *inner.current.entry(target.id).or_insert(0) += i64::from(target.weight);
        }

        let mut best = 0;
        for i in 1..inner.targets.len() {
            if inner.current[&inner.targets[i].id] > inner.current[&inner.targets[best].id] {
                best = i;
            }
        }

        let selected = inner.targets[best];
        if let Some(current) = inner.current.get_mut(&selected.id) {
            *current -= total;
        }
        selected
    }

    fn pick_minimum_connection(inner: &Inner) -> Target {
        let mut best = 0;
        let mut best_count = inner.connections.get(&inner.targets[0].id).copied().unwrap_or(0);
        for i in 1..inner.targets.len() {
            let count = inner.connections.get(&inner.targets[i].id).copied().unwrap_or(0);
            if count < best_count {
                best = i;
                best_count = count;
            }
        }
        inner.targets[best]
    }

    fn pick_random(inner: &Inner) -> Target {
        let idx = rand::thread_rng().gen_range(0..inner.targets.len());
        inner.targets[idx]
    }

    fn pick_weights_random(inner: &Inner) -> Target {
        let total: u64 = inner.targets.iter().map(|t| u64::from(t.weight)).sum();
        if total == 0 {
            return Self::pick_random(inner);
        }
        let mut remaining = rand::thread_rng().gen_range(0..total);
        for target in &inner.targets {
            let weight = u64::from(target.weight);
            if remaining < weight {
                return *target;
            }
            remaining -= weight;
        }
        // Unreachable for positive weights; keep the last as a safety net.
        inner.targets[inner.targets.len() - 1]
    }

    fn pick_specify(inner: &Inner) -> Option<Target> {
        let pinned = inner.pinned?;
        inner.targets.iter().find(|t| t.id == pinned).copied()
    }

    /// Pin a target id for [`Strategy::Specify`].
    pub fn specify(&self, id: u16) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.pinned = Some(id);
    }

    /// Record a dialed connection against a target.
    pub fn on_open(&self, target: &Target) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        *inner.connections.entry(target.id).or_insert(0) += 1;
    }

    /// Record the end of a session (or a failed dial) against a target.
    pub fn on_close(&self, target: &Target) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        if let Some(count) = inner.connections.get_mut(&target.id) {
            *count = count.saturating_sub(1);
        }
    }

    /// In-flight connection count for a target id.
    pub fn connections(&self, id: u16) -> usize {
        let inner = self.inner.lock().expect("balancer lock poisoned");
        inner.connections.get(&id).copied().unwrap_or(0)
    }

    /// Replace the registry wholesale and reseat strategy state.
    pub fn set_targets(&self, targets: Vec<Target>) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.targets = targets;
        inner.reseat();
    }

    /// Append targets. Duplicates are appended as-is.
    pub fn push_targets(&self, targets: Vec<Target>) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.targets.extend(targets);
    }

    /// Retain only targets satisfying the predicate, preserving order.
    pub fn retain<F>(&self, mut pred: F)
    where
        F: FnMut(&Target) -> bool,
    {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.targets.retain(|t| pred(t));
        inner.reseat();
    }

    /// Owned copy of the registry for lock-free iteration.
    pub fn targets(&self) -> Vec<Target> {
        let inner = self.inner.lock().expect("balancer lock poisoned");
        inner.targets.clone()
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("balancer lock poisoned");
        inner.targets.len()
    }

    /// True when no targets are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(ids: &[u16]) -> Vec<Target> {
        ids.iter().map(|&id| Target::new(id)).collect()
    }

    #[test]
    fn test_empty_registry_returns_none() {
        for strategy in [
            Strategy::Polling,
            Strategy::Weights,
            Strategy::MinimumConnection,
            Strategy::Random,
            Strategy::WeightsRandom,
            Strategy::Specify,
        ] {
            let balancer = Balancer::new(strategy, vec![]);
            assert_eq!(balancer.pick_one(), None, "{strategy:?}");
        }
    }

    #[test]
    fn test_polling_round_robin() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1081, 1082, 1083]));

        let picks: Vec<u16> = (0..5).map(|_| balancer.pick_one().unwrap().id).collect();
        assert_eq!(picks, vec![1081, 1082, 1083, 1081, 1082]);
    }

    #[test]
    fn test_polling_window_is_permutation() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1, 2, 3, 4]));
        // Offset the cursor, then check an arbitrary window of n picks.
        balancer.pick_one();
        let mut window: Vec<u16> = (0..4).map(|_| balancer.pick_one().unwrap().id).collect();
        window.sort_unstable();
        assert_eq!(window, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_polling_cursor_survives_set_targets() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1, 2, 3]));
        balancer.pick_one(); // cursor -> 1
        balancer.set_targets(targets(&[1, 2, 3, 4]));
        assert_eq!(balancer.pick_one().unwrap().id, 2);
    }

    #[test]
    fn test_polling_cursor_wraps_on_shrink() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1, 2, 3]));
        balancer.pick_one();
        balancer.pick_one(); // cursor -> 2
        balancer.set_targets(targets(&[7])); // cursor taken modulo 1
        assert_eq!(balancer.pick_one().unwrap().id, 7);
    }

    #[test]
    fn test_weights_exact_ratio_over_window() {
        let set = vec![
            Target::with_weight(1, 5),
            Target::with_weight(2, 1),
            Target::with_weight(3, 1),
        ];
        let balancer = Balancer::new(Strategy::Weights, set);

        // Two full cycles of the weight total.
        let mut counts: HashMap<u16, u32> = HashMap::new();
        for _ in 0..14 {
            *counts.entry(balancer.pick_one().unwrap().id).or_insert(0) += 1;
        }
        assert_eq!(counts[&1], 10);
        assert_eq!(counts[&2], 2);
        assert_eq!(counts[&3], 2);
    }

    #[test]
    fn test_weights_interleaves_without_bursts() {
        let set = vec![Target::with_weight(1, 2), Target::with_weight(2, 1)];
        let balancer = Balancer::new(Strategy::Weights, set);

        let picks: Vec<u16> = (0..6).map(|_| balancer.pick_one().unwrap().id).collect();
        // Smooth scheme spreads the heavy target instead of front-loading it.
        assert_eq!(picks, vec![1, 2, 1, 1, 2, 1]);
    }

    #[test]
    fn test_minimum_connection_prefers_least_loaded() {
        let set = targets(&[1, 2, 3]);
        let balancer = Balancer::new(Strategy::MinimumConnection, set.clone());

        balancer.on_open(&set[0]);
        balancer.on_open(&set[0]);
        balancer.on_open(&set[1]);

        assert_eq!(balancer.pick_one().unwrap().id, 3);

        balancer.on_open(&set[2]);
        balancer.on_open(&set[2]);
        // Tie between 2 (1 conn) and nothing lower: registry order wins.
        assert_eq!(balancer.pick_one().unwrap().id, 2);
    }

    #[test]
    fn test_minimum_connection_tie_break_is_registry_order() {
        let balancer = Balancer::new(Strategy::MinimumConnection, targets(&[9, 4, 7]));
        assert_eq!(balancer.pick_one().unwrap().id, 9);
    }

    #[test]
    fn test_on_close_decrements_and_saturates() {
        let set = targets(&[1]);
        let balancer = Balancer::new(Strategy::MinimumConnection, set.clone());

        balancer.on_open(&set[0]);
        assert_eq!(balancer.connections(1), 1);
        balancer.on_close(&set[0]);
        assert_eq!(balancer.connections(1), 0);
        // A close after a failed dial must not underflow.
        balancer.on_close(&set[0]);
        assert_eq!(balancer.connections(1), 0);
    }

    #[test]
    fn test_random_returns_registry_member() {
        let balancer = Balancer::new(Strategy::Random, targets(&[5, 6, 7]));
        for _ in 0..100 {
            let picked = balancer.pick_one().unwrap();
            assert!([5, 6, 7].contains(&picked.id));
        }
    }

    #[test]
    fn test_weights_random_respects_weights() {
        let set = vec![Target::with_weight(1, 99), Target::with_weight(2, 1)];
        let balancer = Balancer::new(Strategy::WeightsRandom, set);

        let mut heavy = 0;
        for _ in 0..1000 {
            if balancer.pick_one().unwrap().id == 1 {
                heavy += 1;
            }
        }
        // 99:1 odds; anything under 90% would mean the walk is broken.
        assert!(heavy > 900, "heavy target picked only {heavy}/1000 times");
    }

    #[test]
    fn test_specify_returns_pinned_target() {
        let balancer = Balancer::new(Strategy::Specify, targets(&[1, 2, 3]));
        assert_eq!(balancer.pick_one(), None); // nothing pinned yet

        balancer.specify(2);
        assert_eq!(balancer.pick_one().unwrap().id, 2);
        assert_eq!(balancer.pick_one().unwrap().id, 2);

        balancer.specify(9); // pinned id not registered
        assert_eq!(balancer.pick_one(), None);
    }

    #[test]
    fn test_set_targets_reseats_state() {
        let set = targets(&[1, 2, 3]);
        let balancer = Balancer::new(Strategy::MinimumConnection, set.clone());
        balancer.on_open(&set[0]);
        balancer.on_open(&set[1]);

        balancer.set_targets(targets(&[2, 4]));

        // Id 2 survived with its count, id 1 was dropped, id 4 starts at zero.
        assert_eq!(balancer.connections(2), 1);
        assert_eq!(balancer.connections(1), 0);
        assert_eq!(balancer.pick_one().unwrap().id, 4);
    }

    #[test]
    fn test_push_targets_appends_as_is() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1]));
        balancer.push_targets(targets(&[2, 1]));
        let ids: Vec<u16> = balancer.targets().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 1]);
    }

    #[test]
    fn test_retain_preserves_order() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1, 2, 3, 4]));
        balancer.retain(|t| t.id % 2 == 0);
        let ids: Vec<u16> = balancer.targets().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn test_pick_only_returns_current_members() {
        let balancer = Balancer::new(Strategy::Polling, targets(&[1, 2, 3]));
        balancer.pick_one();
        balancer.set_targets(targets(&[8, 9]));
        for _ in 0..10 {
            assert!([8, 9].contains(&balancer.pick_one().unwrap().id));
        }
    }

    #[test]
    fn test_concurrent_picks_stay_consistent() {
        use std::sync::Arc;
        use std::thread;

        let balancer = Arc::new(Balancer::new(Strategy::Polling, targets(&[1, 2, 3, 4])));

        let mut handles = vec![];
        for _ in 0..8 {
            let balancer = Arc::clone(&balancer);
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    assert!(balancer.pick_one().is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
