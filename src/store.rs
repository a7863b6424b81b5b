use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::StateError;

/// Number of RPM samples kept per vehicle. The rolling features the
/// classifier was fitted on use this window, so it is not configurable.
pub const WINDOW_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingStats {
    pub mean: f64,
    /// Population standard deviation (divide by N).
    pub std: f64,
}

impl RollingStats {
    fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.std.is_finite()
    }
}

/// Sliding window of the most recent RPM samples, oldest first.
#[derive(Debug, Clone)]
pub struct RpmWindow {
    window_size: usize,
    samples: VecDeque<f64>,
}

impl Default for RpmWindow {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

impl RpmWindow {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            samples: VecDeque::with_capacity(window_size),
        }
    }

    /// Push one sample, dropping the oldest once the window is full, and
    /// return the statistics of the resulting contents.
    pub fn push(&mut self, rpm: f64) -> RollingStats {
        if self.samples.len() >= self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(rpm);
        self.stats()
    }

    /// Like [`RpmWindow::push`], but leaves the window untouched and returns
    /// `None` when the sample would make the statistics non-finite.
    pub fn try_push(&mut self, rpm: f64) -> Option<RollingStats> {
        if !rpm.is_finite() {
            return None;
        }
        let evicted = if self.samples.len() >= self.window_size {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(rpm);
        let stats = self.stats();
        if stats.is_finite() {
            return Some(stats);
        }
        self.samples.pop_back();
        if let Some(old) = evicted {
            self.samples.push_front(old);
        }
        None
    }

    pub fn stats(&self) -> RollingStats {
        if self.samples.is_empty() {
            return RollingStats { mean: 0.0, std: 0.0 };
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / n;
        let var = self
            .samples
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            / n;
        RollingStats {
            mean,
            std: var.sqrt(),
        }
    }

    pub fn samples(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct VehicleState {
    window: RpmWindow,
    last_seen: Instant,
}

impl VehicleState {
    fn record(&mut self, vehicle_id: &str, rpm: f64) -> Result<RollingStats, StateError> {
        self.last_seen = Instant::now();
        self.window.try_push(rpm).ok_or_else(|| StateError::NonFinite {
            vehicle_id: vehicle_id.to_string(),
            rpm,
        })
    }
}

/// Per-vehicle rolling RPM state.
///
/// Vehicles live in a sharded map. An append holds the write guard of the
/// vehicle's shard for the whole push-and-compute step, so two readings for
/// the same vehicle never interleave and the returned statistics always
/// describe the window right after that reading. Vehicles on other shards
/// are not blocked.
///
/// The map is bounded. Inserting past `max_vehicles` evicts the least
/// recently seen vehicles down to a low-water mark 10% below the cap. That
/// costs one O(n) scan of the map, paid once per `max_vehicles / 10` new
/// vehicles rather than on every insert. [`StateStore::sweep_idle`] drops
/// vehicles that have gone quiet.
#[derive(Debug)]
pub struct StateStore {
    vehicles: DashMap<String, VehicleState>,
    max_vehicles: usize,
}

impl StateStore {
    pub fn new(max_vehicles: usize) -> Self {
        Self {
            vehicles: DashMap::new(),
            max_vehicles: max_vehicles.max(1),
        }
    }

    /// Record `rpm` for `vehicle_id` and return the rolling mean and
    /// standard deviation including it. Creates the vehicle on first sight.
    ///
    /// A sample whose statistics would overflow is not applied.
    pub fn append(&self, vehicle_id: &str, rpm: f64) -> Result<RollingStats, StateError> {
        if let Some(mut state) = self.vehicles.get_mut(vehicle_id) {
            return state.record(vehicle_id, rpm);
        }

        let (stats, inserted) = match self.vehicles.entry(vehicle_id.to_owned()) {
            // Another writer created it between the lookup and here.
            Entry::Occupied(e) => (e.into_ref().record(vehicle_id, rpm), false),
            Entry::Vacant(e) => {
                let mut state = VehicleState {
                    window: RpmWindow::default(),
                    last_seen: Instant::now(),
                };
                let stats = state.record(vehicle_id, rpm)?;
                e.insert(state);
                (Ok(stats), true)
            }
        };

        if inserted {
            debug!(vehicle_id, "tracking new vehicle");
            if self.vehicles.len() > self.max_vehicles {
                self.evict_lru(vehicle_id);
            }
        }
        stats
    }

    /// Current window contents and statistics, without touching the state.
    pub fn snapshot(&self, vehicle_id: &str) -> Option<(Vec<f64>, RollingStats)> {
        self.vehicles
            .get(vehicle_id)
            .map(|s| (s.window.samples(), s.window.stats()))
    }

    pub fn contains(&self, vehicle_id: &str) -> bool {
        self.vehicles.contains_key(vehicle_id)
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Drop vehicles idle for at least `ttl`. Returns how many were removed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        self.sweep_idle_at(Instant::now(), ttl)
    }

    pub fn sweep_idle_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut removed = 0;
        self.vehicles.retain(|_, s| {
            let keep = now.saturating_duration_since(s.last_seen) < ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn low_water(&self) -> usize {
        self.max_vehicles - self.max_vehicles / 10
    }

    fn evict_lru(&self, keep: &str) {
        let excess = self.vehicles.len().saturating_sub(self.low_water());
        if excess == 0 {
            return;
        }
        // Collect keys first so no shard guard is held during remove.
        let mut oldest: Vec<(Instant, String)> = self
            .vehicles
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.last_seen, e.key().clone()))
            .collect();
        if oldest.len() > excess {
            oldest.select_nth_unstable(excess - 1);
            oldest.truncate(excess);
        }

        let mut evicted = 0;
        for (seen, key) in oldest {
            // Skip vehicles written to after the scan.
            if self
                .vehicles
                .remove_if(&key, |_, s| s.last_seen == seen)
                .is_some()
            {
                evicted += 1;
            }
        }
        debug!(evicted, remaining = self.vehicles.len(), "evicted least recently seen vehicles");
    }
}

/// Periodically drop idle vehicles from `store`.
pub fn spawn_idle_sweeper(
    store: Arc<StateStore>,
    ttl: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let removed = store.sweep_idle(ttl);
            if removed > 0 {
                info!(removed, remaining = store.len(), "swept idle vehicles");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reading_is_its_own_mean() {
        let store = StateStore::new(100);
        let s = store.append("car-1", 1234.5).unwrap();
        assert_eq!(s.mean, 1234.5);
        assert_eq!(s.std, 0.0);
    }

    #[test]
    fn window_evicts_oldest_first() {
        let store = StateStore::new(100);
        let mut last = RollingStats { mean: 0.0, std: 0.0 };
        for rpm in [1000.0, 1100.0, 1200.0, 1300.0, 1400.0, 1500.0, 1600.0] {
            last = store.append("car-1", rpm).unwrap();
        }
        let (window, stats) = store.snapshot("car-1").unwrap();
        assert_eq!(window, vec![1200.0, 1300.0, 1400.0, 1500.0, 1600.0]);
        assert_eq!(stats, last);
        assert!((last.mean - 1400.0).abs() < 1e-9);
        assert!((last.std - 20_000f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn store_window_is_fixed_at_five() {
        let store = StateStore::new(100);
        for i in 0..8 {
            store.append("car-1", 1000.0 + i as f64 * 100.0).unwrap();
        }
        let (window, stats) = store.snapshot("car-1").unwrap();
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(window, vec![1300.0, 1400.0, 1500.0, 1600.0, 1700.0]);
        assert!((stats.mean - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn std_uses_population_formula() {
        let mut w = RpmWindow::default();
        w.push(2.0);
        let s = w.push(4.0);
        assert_eq!(s.mean, 3.0);
        // sample formula would give sqrt(2)
        assert_eq!(s.std, 1.0);
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut w = RpmWindow::new(3);
        for i in 0..10 {
            w.push(i as f64);
            assert!(w.len() <= 3);
        }
        assert_eq!(w.samples(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn overflowing_sample_is_rejected_and_not_applied() {
        let store = StateStore::new(100);
        store.append("big", 1e200).unwrap();
        let err = store.append("big", -1e200).unwrap_err();
        assert!(matches!(err, StateError::NonFinite { rpm, .. } if rpm == -1e200));

        let (window, stats) = store.snapshot("big").unwrap();
        assert_eq!(window, vec![1e200]);
        assert_eq!(stats.std, 0.0);
    }

    #[test]
    fn rejected_sample_restores_evicted_one() {
        let mut w = RpmWindow::new(2);
        w.push(1e200);
        w.push(1e200);
        assert!(w.try_push(-1e200).is_none());
        assert_eq!(w.samples(), vec![1e200, 1e200]);
        assert!(w.try_push(f64::NAN).is_none());
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn rejected_first_sample_does_not_create_vehicle() {
        let store = StateStore::new(100);
        assert!(store.append("nan", f64::INFINITY).is_err());
        assert!(!store.contains("nan"));
    }

    #[test]
    fn vehicles_are_isolated() {
        let store = StateStore::new(100);
        store.append("a", 1000.0).unwrap();
        store.append("b", 5000.0).unwrap();
        let a = store.append("a", 1000.0).unwrap();
        assert_eq!(a.mean, 1000.0);
        assert_eq!(a.std, 0.0);
        assert_eq!(store.snapshot("b").unwrap().0, vec![5000.0]);
    }

    #[test]
    fn snapshot_of_unknown_vehicle_is_none() {
        let store = StateStore::new(100);
        assert!(store.snapshot("ghost").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_seen() {
        let store = StateStore::new(2);
        store.append("old", 1.0).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store.append("mid", 2.0).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store.append("old", 3.0).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store.append("new", 4.0).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.contains("old"));
        assert!(store.contains("new"));
        assert!(!store.contains("mid"));
    }

    #[test]
    fn eviction_frees_a_batch_below_the_cap() {
        let store = StateStore::new(20);
        for v in 0..20 {
            store.append(&format!("car-{v}"), 1.0).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(store.len(), 20);

        // one insert past the cap drops to the low-water mark of 18
        store.append("car-20", 1.0).unwrap();
        assert_eq!(store.len(), 18);
        for v in 0..3 {
            assert!(!store.contains(&format!("car-{v}")), "car-{v} should be evicted");
        }
        assert!(store.contains("car-3"));
        assert!(store.contains("car-20"));

        // the freed headroom absorbs new vehicles without another eviction
        store.append("car-21", 1.0).unwrap();
        store.append("car-22", 1.0).unwrap();
        assert_eq!(store.len(), 20);
        assert!(store.contains("car-3"));
    }

    #[test]
    fn idle_sweep_drops_quiet_vehicles() {
        let store = StateStore::new(100);
        store.append("a", 1.0).unwrap();
        store.append("b", 2.0).unwrap();

        assert_eq!(store.sweep_idle(Duration::from_secs(60)), 0);
        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(store.sweep_idle_at(later, Duration::from_secs(60)), 2);
        assert!(store.is_empty());

        // a swept vehicle starts over
        let s = store.append("a", 900.0).unwrap();
        assert_eq!(s.mean, 900.0);
    }

    #[test]
    fn concurrent_appends_match_sequential() {
        let store = Arc::new(StateStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|v| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let id = format!("car-{v}");
                    for i in 0..200 {
                        store.append(&id, (v * 1000 + i) as f64).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for v in 0..8 {
            let expected: Vec<f64> = (195..200).map(|i| (v * 1000 + i) as f64).collect();
            let (window, _) = store.snapshot(&format!("car-{v}")).unwrap();
            assert_eq!(window, expected);
        }
    }
}
