//! Sliding-window circuit breaker guarding one secondary adapter.
//!
//! `failure_threshold` failures inside `window` open the circuit for `open`.
//! While open, calls fail fast without touching the backend. Any success
//! closes the circuit and clears the failure history.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use relay_common::config::CircuitSettings;

pub struct CircuitBreaker {
    failure_threshold: usize,
    window: Duration,
    open_for: Duration,
    state: Mutex<CircuitState>,
}

#[derive(Default)]
struct CircuitState {
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, window: Duration, open_for: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            window,
            open_for,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn from_settings(settings: &CircuitSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            Duration::from_millis(settings.window_ms),
            Duration::from_millis(settings.open_ms),
        )
    }

    pub fn is_open(&self) -> bool {
        self.time_until_reset() > Duration::ZERO
    }

    /// Remaining open time, zero when closed.
    pub fn time_until_reset(&self) -> Duration {
        let state = self.lock();
        match state.open_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        prune(&mut state.failures, now, self.window);
        state.failures.push_back(now);

        if state.failures.len() >= self.failure_threshold {
            state.open_until = Some(now + self.open_for);
            // Start counting afresh so the circuit does not re-trip the moment it closes.
            state.failures.clear();
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.open_until = None;
    }

    pub fn reset(&self) {
        self.record_success();
    }

    /// Failures still inside the window.
    pub fn failure_count(&self) -> usize {
        let mut state = self.lock();
        prune(&mut state.failures, Instant::now(), self.window);
        state.failures.len()
    }

    // Every critical section leaves the state valid, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_settings(&CircuitSettings::default())
    }
}

fn prune(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = failures.front() {
        if now.duration_since(oldest) > window {
            failures.pop_front();
        } else {
            break;
        }
    }
}
