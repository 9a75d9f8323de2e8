use std::sync::{
    Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Fault injection and inspection handle of one simulated device.
#[derive(Debug)]
pub struct SimControl {
    plugged: AtomicBool,
    opened: AtomicBool,
    completed: AtomicU64,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub shift: usize,
    pub idle: usize,
    pub halted: bool,
    pub timeouts: u32,
    pub short_reads: u32,
}

impl Default for SimControl {
    fn default() -> Self {
        Self {
            plugged: AtomicBool::new(true),
            opened: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }
}

impl SimControl {
    /// Drop `bytes` logical bytes from the stream.
    pub fn inject_shift(&self, bytes: usize) {
        self.faults().shift += bytes;
    }

    /// Lengthen the next marker run by `bytes`.
    pub fn inject_idle(&self, bytes: usize) {
        self.faults().idle += bytes;
    }

    /// Halt the endpoint until the halt is cleared.
    pub fn inject_stall(&self) {
        self.faults().halted = true;
    }

    pub fn inject_timeouts(&self, count: u32) {
        self.faults().timeouts += count;
    }

    pub fn inject_short_reads(&self, count: u32) {
        self.faults().short_reads += count;
    }

    pub fn unplug(&self) {
        self.plugged.store(false, Ordering::Release);
    }

    pub fn replug(&self) {
        self.faults().halted = false;
        self.plugged.store(true, Ordering::Release);
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::Acquire)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.faults().halted
    }

    /// Transfers that completed with data.
    pub fn completed_transfers(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }

    pub(crate) fn count_completed(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}
