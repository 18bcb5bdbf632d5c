//! Per-client admission counters for the expensive auth endpoints.
//!
//! Each client key gets `capacity` admissions per window; the window starts
//! with the key's first admission and resets independently once it elapses.
//! Purely in memory, never touches the network. The table of client keys is
//! bounded, and expired windows are swept at most once per window length.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

use super::clock::Clock;

/// Default bound on tracked client keys.
pub const DEFAULT_MAX_KEYS: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

#[derive(Debug)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
struct Windows {
    entries: HashMap<String, Window>,
    /// Expired windows are swept at most once per window length.
    next_sweep: Option<DateTime<Utc>>,
}

impl Windows {
    fn sweep(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.entries
            .retain(|_, entry| now - entry.started_at < window);
        self.next_sweep = Some(now + window);
    }
}

#[derive(Debug)]
pub struct AdmissionControl {
    capacity: u32,
    window: TimeDelta,
    max_keys: usize,
    clock: Arc<dyn Clock>,
    windows: Mutex<Windows>,
}

impl AdmissionControl {
    #[must_use]
    pub fn new(capacity: u32, window: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            window,
            max_keys: DEFAULT_MAX_KEYS,
            clock,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Bound the number of tracked client keys. New keys are denied while the
    /// table is full of unexpired windows.
    #[must_use]
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn window(&self) -> TimeDelta {
        self.window
    }

    #[must_use]
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Count one request for `key`.
    pub fn admit(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.sweep(now, self.window);

        if !windows.entries.contains_key(key) && windows.entries.len() >= self.max_keys {
            let retry_after = windows
                .next_sweep
                .map_or(self.window, |at| at - now)
                .to_std()
                .unwrap_or_default();
            warn!(tracked = windows.entries.len(), "admission table full");
            return Admission::Denied { retry_after };
        }

        let entry = windows
            .entries
            .entry(key.to_string())
            .or_insert(Window {
                started_at: now,
                count: 0,
            });
        if now - entry.started_at >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count < self.capacity {
            entry.count += 1;
            return Admission::Allowed;
        }

        let retry_after = (entry.started_at + self.window - now)
            .to_std()
            .unwrap_or_default();
        Admission::Denied { retry_after }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::ManualClock;

    fn control(clock: &Arc<ManualClock>) -> AdmissionControl {
        AdmissionControl::new(10, TimeDelta::minutes(1), clock.clone())
    }

    #[test]
    fn eleventh_request_in_window_is_denied() {
        let clock = Arc::new(ManualClock::default());
        let admission = control(&clock);

        for _ in 0..10 {
            assert_eq!(admission.admit("203.0.113.5"), Admission::Allowed);
        }
        assert_eq!(
            admission.admit("203.0.113.5"),
            Admission::Denied {
                retry_after: Duration::from_secs(60)
            }
        );

        clock.advance(TimeDelta::seconds(45));
        assert_eq!(
            admission.admit("203.0.113.5"),
            Admission::Denied {
                retry_after: Duration::from_secs(15)
            }
        );
    }

    #[test]
    fn window_resets_after_elapsing() {
        let clock = Arc::new(ManualClock::default());
        let admission = control(&clock);

        for _ in 0..10 {
            admission.admit("203.0.113.5");
        }
        assert!(matches!(
            admission.admit("203.0.113.5"),
            Admission::Denied { .. }
        ));

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(admission.admit("203.0.113.5"), Admission::Allowed);
    }

    #[test]
    fn keys_are_independent() {
        let clock = Arc::new(ManualClock::default());
        let admission = control(&clock);

        for _ in 0..10 {
            admission.admit("a");
        }
        assert!(matches!(admission.admit("a"), Admission::Denied { .. }));
        assert_eq!(admission.admit("b"), Admission::Allowed);
    }

    #[test]
    fn expired_windows_are_swept() {
        let clock = Arc::new(ManualClock::default());
        let admission = control(&clock);

        for index in 0..64 {
            admission.admit(&format!("client-{index}"));
        }
        assert_eq!(admission.tracked_keys(), 64);

        clock.advance(TimeDelta::minutes(2));
        admission.admit("fresh");
        assert_eq!(admission.tracked_keys(), 1);
    }

    #[test]
    fn distinct_keys_are_bounded() {
        let clock = Arc::new(ManualClock::default());
        let admission = control(&clock).with_max_keys(256);

        for index in 0..10_000 {
            admission.admit(&format!("198.51.100.{index}"));
        }
        assert_eq!(admission.tracked_keys(), 256);

        // Known keys keep their own budget while the table is full.
        assert_eq!(admission.admit("198.51.100.0"), Admission::Allowed);
        assert_eq!(
            admission.admit("203.0.113.9"),
            Admission::Denied {
                retry_after: Duration::from_secs(60)
            }
        );

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(admission.admit("203.0.113.9"), Admission::Allowed);
        assert_eq!(admission.tracked_keys(), 1);
    }
}
