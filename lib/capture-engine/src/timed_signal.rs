use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

pub const DEFAULT_BASE_RATE: f64 = 30.0;

/// Wake-up flag with bounded waits.
///
/// Any number of `unlock()` calls between two successful locks collapse
/// into one pending wake-up.
#[derive(Debug)]
pub struct TimedSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
    base_rate: f64,
}

#[derive(Debug)]
struct SignalState {
    count: u32,
    time_multiplier: f64,
}

impl Default for TimedSignal {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_RATE)
    }
}

impl TimedSignal {
    pub fn new(base_rate: f64) -> Self {
        Self {
            state: Mutex::new(SignalState {
                count: 0,
                time_multiplier: 1.0,
            }),
            cond: Condvar::new(),
            base_rate,
        }
    }

    pub fn lock(&self) {
        let mut state = self.state();
        while state.count == 0 {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.count = 0;
    }

    /// Returns `false` if nothing was signaled within [`Self::wait_time`].
    pub fn timed_lock(&self) -> bool {
        let timeout = self.wait_time();
        let state = self.state();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.count == 0)
            .unwrap_or_else(|e| e.into_inner());

        if state.count == 0 {
            return false;
        }
        state.count = 0;
        true
    }

    pub fn try_lock(&self) -> bool {
        let mut state = self.state();
        if state.count == 0 {
            return false;
        }
        state.count = 0;
        true
    }

    pub fn unlock(&self) {
        self.state().count = 1;
        self.cond.notify_all();
    }

    /// Values below or equal to zero are ignored.
    pub fn update_time_multiplier(&self, multiplier: f64) {
        if multiplier <= 0.0 {
            return;
        }
        self.state().time_multiplier = multiplier;
    }

    pub fn wait_time(&self) -> Duration {
        let multiplier = self.state().time_multiplier;
        Duration::from_secs_f64(multiplier / self.base_rate)
    }

    fn state(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
