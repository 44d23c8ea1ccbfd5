//! Background eviction of expired counter records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::clock::Clock;
use super::store::LocalStore;

/// Lower bound on the sweep interval.
pub const DEFAULT_SWEEP_FLOOR: Duration = Duration::from_secs(10);

/// Shortest interval the sweeper will run at; tokio rejects a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Half the shortest window, but never below `floor`.
pub fn sweep_interval(min_window_ms: Option<u64>, floor: Duration) -> Duration {
    let interval = match min_window_ms {
        Some(ms) => Duration::from_millis(ms / 2).max(floor),
        None => floor,
    };
    interval.max(MIN_SWEEP_INTERVAL)
}

/// Handle to a running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl SweeperHandle {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the sweeper. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Eviction sweeper stopped");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a task that sweeps `store` every `interval`, whether or not traffic arrives.
///
/// Must be called from within a tokio runtime.
pub fn spawn(store: Arc<LocalStore>, clock: Arc<dyn Clock>, interval: Duration) -> SweeperHandle {
    info!(interval_ms = interval.as_millis() as u64, "Starting eviction sweeper");

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.sweep(clock.now_millis());
            if removed > 0 {
                debug!(removed, remaining = store.len(), "Evicted expired counters");
            }
        }
    });

    SweeperHandle {
        task: Some(task),
        interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    #[test]
    fn test_sweep_interval_clamped() {
        let floor = Duration::from_secs(10);

        assert_eq!(sweep_interval(Some(60_000), floor), Duration::from_secs(30));
        assert_eq!(sweep_interval(Some(4_000), floor), floor);
        assert_eq!(sweep_interval(None, floor), floor);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        assert_eq!(sweep_interval(None, Duration::ZERO), MIN_SWEEP_INTERVAL);
        assert_eq!(sweep_interval(Some(1), Duration::ZERO), MIN_SWEEP_INTERVAL);
        assert_eq!(sweep_interval(Some(10), Duration::ZERO), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_with_zero_floor() {
        let store = Arc::new(LocalStore::new(4));
        let clock = Arc::new(ManualClock::new(0));
        store.increment("k", 1, 5, 0);

        let handle = spawn(store.clone(), clock.clone(), sweep_interval(None, Duration::ZERO));

        clock.advance(10);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(handle.is_running());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_without_traffic() {
        let store = Arc::new(LocalStore::new(4));
        let clock = Arc::new(ManualClock::new(0));
        store.increment("k", 1_000, 5, 0);

        let handle = spawn(store.clone(), clock.clone(), Duration::from_secs(1));
        assert!(handle.is_running());

        clock.advance(2_000);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_live_records() {
        let store = Arc::new(LocalStore::new(4));
        let clock = Arc::new(ManualClock::new(0));
        store.increment("k", 10_000, 5, 0);

        let _handle = spawn(store.clone(), clock.clone(), Duration::from_secs(1));

        clock.advance(15_000);
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        // Expired but still inside its grace window.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let store = Arc::new(LocalStore::new(4));
        let clock = Arc::new(ManualClock::new(0));
        store.increment("k", 1_000, 5, 0);

        let mut handle = spawn(store.clone(), clock.clone(), Duration::from_secs(1));
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());

        clock.advance(5_000);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.len(), 1);
    }
}
