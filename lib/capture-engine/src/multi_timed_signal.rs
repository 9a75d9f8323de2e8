use crate::timed_signal::DEFAULT_BASE_RATE;
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// [`crate::TimedSignal`] over `N` independently signaled indices.
///
/// `specific_*` waits on one index. `general_*` waits until any index is
/// signaled and reports the lowest signaled one. Out-of-range indices never
/// block and never succeed.
#[derive(Debug)]
pub struct MultiTimedSignal {
    state: Mutex<MultiState>,
    cond: Condvar,
    base_rate: f64,
}

#[derive(Debug)]
struct MultiState {
    counts: Vec<u32>,
    time_multiplier: f64,
}

impl MultiState {
    fn first_signaled(&self) -> Option<usize> {
        self.counts.iter().position(|c| *c > 0)
    }
}

impl MultiTimedSignal {
    pub fn new(num_indices: usize) -> Self {
        Self::with_base_rate(num_indices, DEFAULT_BASE_RATE)
    }

    pub fn with_base_rate(num_indices: usize, base_rate: f64) -> Self {
        Self {
            state: Mutex::new(MultiState {
                counts: vec![0; num_indices],
                time_multiplier: 1.0,
            }),
            cond: Condvar::new(),
            base_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.state().counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn specific_lock(&self, index: usize) {
        let mut state = self.state();
        if index >= state.counts.len() {
            return;
        }

        while state.counts[index] == 0 {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.counts[index] = 0;
    }

    pub fn specific_timed_lock(&self, index: usize) -> bool {
        let timeout = self.wait_time();
        let state = self.state();
        if index >= state.counts.len() {
            return false;
        }

        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.counts[index] == 0)
            .unwrap_or_else(|e| e.into_inner());

        if state.counts[index] == 0 {
            return false;
        }
        state.counts[index] = 0;
        true
    }

    pub fn specific_try_lock(&self, index: usize) -> bool {
        let mut state = self.state();
        match state.counts.get_mut(index) {
            Some(count) if *count > 0 => {
                *count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn specific_unlock(&self, index: usize) {
        {
            let mut state = self.state();
            match state.counts.get_mut(index) {
                Some(count) => *count = 1,
                None => return,
            }
        }
        self.cond.notify_all();
    }

    pub fn general_lock(&self) -> Option<usize> {
        let mut state = self.state();
        if state.counts.is_empty() {
            return None;
        }

        loop {
            if let Some(index) = state.first_signaled() {
                state.counts[index] = 0;
                return Some(index);
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn general_timed_lock(&self) -> Option<usize> {
        let deadline = Instant::now() + self.wait_time();
        let mut state = self.state();

        loop {
            if let Some(index) = state.first_signaled() {
                state.counts[index] = 0;
                return Some(index);
            }

            let now = Instant::now();
            if now >= deadline || state.counts.is_empty() {
                return None;
            }

            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn general_try_lock(&self) -> Option<usize> {
        let mut state = self.state();
        let index = state.first_signaled()?;
        state.counts[index] = 0;
        Some(index)
    }

    /// Signal every index.
    pub fn unlock_all(&self) {
        self.state().counts.iter_mut().for_each(|c| *c = 1);
        self.cond.notify_all();
    }

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

    fn state(&self) -> MutexGuard<'_, MultiState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
