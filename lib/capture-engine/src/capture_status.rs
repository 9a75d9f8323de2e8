use crate::{EngineConfig, FrameBufferPool, TimedSignal};
use capture_device::{CaptureMode, ConnectionKind, DeviceDescriptor};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    Draining,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Streaming,
            2 => EngineState::Draining,
            _ => EngineState::Idle,
        }
    }
}

/// Playback speed of devices that capture slower than real time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSpeed {
    #[default]
    Full,
    Half,
    Third,
    Quarter,
}

impl CaptureSpeed {
    pub const ALL: [CaptureSpeed; 4] = [
        CaptureSpeed::Full,
        CaptureSpeed::Half,
        CaptureSpeed::Third,
        CaptureSpeed::Quarter,
    ];

    /// Factor a frame takes longer than at full speed.
    pub fn multiplier(self) -> f64 {
        match self {
            CaptureSpeed::Full => 1.0,
            CaptureSpeed::Half => 2.0,
            CaptureSpeed::Third => 3.0,
            CaptureSpeed::Quarter => 4.0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CaptureSpeed::Full => "full",
            CaptureSpeed::Half => "half",
            CaptureSpeed::Third => "third",
            CaptureSpeed::Quarter => "quarter",
        }
    }
}

impl fmt::Display for CaptureSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CaptureSpeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|speed| speed.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown capture speed `{s}`, expected full, half, third or quarter"))
    }
}

/// Connection state of one capture session.
///
/// Written by the orchestrator and by the acquisition thread, read by
/// everyone. Consumers wait on `video_wait` and `audio_wait`.
#[derive(Debug)]
pub struct CaptureStatus {
    connected: AtomicBool,
    running: AtomicBool,
    close_success: AtomicBool,
    cooldown: AtomicU32,
    cooldown_initial: u32,
    engine_state: AtomicU8,
    frames_delivered: AtomicU64,
    frames_skipped: AtomicU64,
    device: Mutex<Option<DeviceDescriptor>>,
    mode: Mutex<CaptureMode>,
    capture_speed: Mutex<CaptureSpeed>,
    error: Mutex<ErrorText>,

    pub video_wait: TimedSignal,
    pub audio_wait: TimedSignal,
}

#[derive(Debug, Default)]
struct ErrorText {
    text: String,
    is_new: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub running: bool,
    pub close_success: bool,
    pub device: Option<DeviceDescriptor>,
    pub mode: CaptureMode,
    pub capture_speed: CaptureSpeed,
    pub error_text: String,
    pub cooldown: u32,
    pub frames_delivered: u64,
    pub frames_skipped: u64,
    pub engine_state: EngineState,
}

impl CaptureStatus {
    pub fn new(cooldown_initial: u32, base_rate: f64) -> Self {
        Self {
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
            close_success: AtomicBool::new(true),
            cooldown: AtomicU32::new(cooldown_initial),
            cooldown_initial,
            engine_state: AtomicU8::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            device: Mutex::new(None),
            mode: Mutex::new(CaptureMode::default()),
            capture_speed: Mutex::new(CaptureSpeed::default()),
            error: Mutex::new(ErrorText::default()),
            video_wait: TimedSignal::new(base_rate),
            audio_wait: TimedSignal::new(base_rate),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clearing this asks every loop of the session to wind down.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn close_success(&self) -> bool {
        self.close_success.load(Ordering::Acquire)
    }

    pub fn set_close_success(&self, done: bool) {
        self.close_success.store(done, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.is_running() && self.is_connected()
    }

    pub fn cooldown(&self) -> u32 {
        self.cooldown.load(Ordering::Acquire)
    }

    pub fn cooldown_initial(&self) -> u32 {
        self.cooldown_initial
    }

    pub fn reset_cooldown(&self) {
        self.set_cooldown(self.cooldown_initial);
    }

    pub fn set_cooldown(&self, frames: u32) {
        self.cooldown.store(frames, Ordering::Release);
    }

    /// Count one delivered frame against the cooldown. Returns `true` while
    /// the cooldown was still running, so the frame may be torn.
    pub fn consume_cooldown(&self) -> bool {
        self.cooldown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    pub fn engine_state(&self) -> EngineState {
        EngineState::from_u8(self.engine_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_engine_state(&self, state: EngineState) {
        self.engine_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn count_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        lock(&self.device).clone()
    }

    pub fn set_device(&self, device: Option<DeviceDescriptor>) {
        *lock(&self.device) = device;
        self.apply_time_multiplier();
    }

    pub fn capture_speed(&self) -> CaptureSpeed {
        *lock(&self.capture_speed)
    }

    /// Only IS Nitro devices can be slowed down, the speed is kept but has no
    /// effect on other devices.
    pub fn set_capture_speed(&self, speed: CaptureSpeed) {
        *lock(&self.capture_speed) = speed;
        self.apply_time_multiplier();
    }

    fn apply_time_multiplier(&self) {
        let slowed = lock(&self.device)
            .as_ref()
            .is_some_and(|d| d.kind == ConnectionKind::IsNitro);
        let multiplier = if slowed {
            self.capture_speed().multiplier()
        } else {
            1.0
        };

        self.video_wait.update_time_multiplier(multiplier);
        self.audio_wait.update_time_multiplier(multiplier);
    }

    pub fn mode(&self) -> CaptureMode {
        *lock(&self.mode)
    }

    pub fn set_mode(&self, mode: CaptureMode) {
        *lock(&self.mode) = mode;
    }

    pub fn error_text(&self) -> String {
        lock(&self.error).text.clone()
    }

    pub fn set_error_text(&self, text: impl Into<String>) {
        let mut error = lock(&self.error);
        error.text = text.into();
        error.is_new = true;
    }

    /// The error text, once per change.
    pub fn take_new_error(&self) -> Option<String> {
        let mut error = lock(&self.error);
        if !error.is_new {
            return None;
        }
        error.is_new = false;
        Some(error.text.clone())
    }

    /// Wake both consumers, whether or not a frame arrived.
    pub fn wake_consumers(&self) {
        self.video_wait.unlock();
        self.audio_wait.unlock();
    }

    /// Drop any pending wake-up on both consumer signals.
    pub fn clear_consumer_signals(&self) {
        self.video_wait.try_lock();
        self.audio_wait.try_lock();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.is_connected(),
            running: self.is_running(),
            close_success: self.close_success(),
            device: self.device(),
            mode: self.mode(),
            capture_speed: self.capture_speed(),
            error_text: self.error_text(),
            cooldown: self.cooldown(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            engine_state: self.engine_state(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything one capture session shares between the acquisition thread and
/// the consumers.
#[derive(Debug)]
pub struct CaptureContext {
    pub status: CaptureStatus,
    pub pool: FrameBufferPool,
}

impl CaptureContext {
    pub fn new(config: &EngineConfig, slot_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            status: CaptureStatus::new(config.cooldown_initial, config.base_rate),
            pool: FrameBufferPool::new(config.slots(), config.writer_lanes, slot_capacity),
        })
    }
}
