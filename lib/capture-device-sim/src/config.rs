use capture_device::{
    CaptureMode, ConnectionKind, DS_SAMPLES_IN, DeviceDescriptor, HEIGHT_3DS, HEIGHT_DS,
    O3DS_SAMPLES_IN, StreamFraming, TOP_WIDTH_3DS, BOT_WIDTH_3DS, WIDTH_DS,
};
use derive_setters::Setters;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Every read returns one whole frame
    Plain,

    /// Continuous stream with packet headers and a marker-run trailer
    Framed,
}

#[derive(Debug, Clone, Setters)]
#[setters(prefix = "with_")]
pub struct SimDeviceConfig {
    pub serial: String,
    pub name: String,
    pub kind: SimKind,

    /// Logical frame size in 2D mode
    pub frame_bytes: usize,

    /// Logical frame size in 3D mode
    pub frame_bytes_3d: usize,

    /// Trailing part of every frame holding audio
    pub audio_bytes: usize,

    pub max_lanes: usize,
    pub supports_async: bool,

    /// Time the device needs to produce one frame
    pub frame_interval: Duration,

    pub seed: u64,

    /// Longest marker run closing a framed frame, in words
    pub max_run_words: usize,

    pub stall_clearable: bool,

    /// Drop `shift_bytes` logical bytes every this many transfers
    #[setters(strip_option)]
    pub shift_every: Option<u64>,

    pub shift_bytes: usize,

    /// Bytes at the front of every frame that carry no data
    pub leading_offset: usize,

    /// The device FIFO overflows when no read is pending for this long, and
    /// the device restarts on the next frame boundary.
    #[setters(strip_option)]
    pub overrun_after: Option<Duration>,
}

impl SimDeviceConfig {
    /// A 3DS-style device delivering RGB888 frames.
    pub fn plain(serial: impl Into<String>) -> Self {
        let video = (HEIGHT_3DS * (TOP_WIDTH_3DS + BOT_WIDTH_3DS)) as usize * 3;
        let video_3d = (HEIGHT_3DS * (TOP_WIDTH_3DS * 2 + BOT_WIDTH_3DS)) as usize * 3;
        let audio = O3DS_SAMPLES_IN * 2;

        Self {
            serial: serial.into(),
            name: "Sim 3DS".to_string(),
            kind: SimKind::Plain,
            frame_bytes: video + audio,
            frame_bytes_3d: video_3d + audio,
            audio_bytes: audio,
            max_lanes: 8,
            supports_async: true,
            frame_interval: Duration::from_micros(16_715),
            seed: 0,
            max_run_words: 64,
            stall_clearable: true,
            shift_every: None,
            shift_bytes: 2,
            leading_offset: 0,
            overrun_after: None,
        }
    }

    /// An old-DS-style device streaming RGB565 frames with packet headers.
    pub fn framed(serial: impl Into<String>) -> Self {
        let video = (WIDTH_DS * HEIGHT_DS * 2) as usize * 2;
        let audio = DS_SAMPLES_IN * 2;

        Self {
            name: "Sim DS".to_string(),
            kind: SimKind::Framed,
            frame_bytes: video + audio,
            frame_bytes_3d: video + audio,
            audio_bytes: audio,
            max_lanes: 4,
            ..Self::plain(serial)
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        let long_name = format!("Simulated {} ({})", self.name, self.serial);
        match self.kind {
            SimKind::Plain => {
                DeviceDescriptor::new_3ds(self.serial.clone(), self.name.clone(), ConnectionKind::Ftd3)
                    .with_has_3d(true)
                    .with_long_name(long_name)
            }
            SimKind::Framed => {
                DeviceDescriptor::new(self.serial.clone(), self.name.clone(), ConnectionKind::Ftd2)
                    .with_long_name(long_name)
            }
        }
    }

    pub fn framing(&self) -> Option<StreamFraming> {
        (self.kind == SimKind::Framed).then(StreamFraming::default)
    }

    pub fn frame_size(&self, mode: CaptureMode) -> usize {
        let size = if mode.stereo_3d {
            self.frame_bytes_3d
        } else {
            self.frame_bytes
        };

        // RGB565 instead of RGB888 for the video part
        if mode.low_bandwidth && self.kind == SimKind::Plain {
            let video = size.saturating_sub(self.audio_bytes);
            return (video / 3 * 2 + self.audio_bytes) & !1;
        }
        size & !1
    }

    pub fn video_in_size(&self, mode: CaptureMode) -> usize {
        self.frame_size(mode).saturating_sub(self.audio_bytes)
    }

    /// Bytes one read of `mode` takes on the bus.
    pub fn transfer_size(&self, mode: CaptureMode) -> usize {
        let frame = self.frame_size(mode);
        match self.framing() {
            Some(framing) => framing.expanded_length(frame),
            None => frame,
        }
    }

    pub fn max_transfer_size(&self) -> usize {
        [false, true]
            .into_iter()
            .flat_map(|stereo_3d| [false, true].map(|low| CaptureMode::new(stereo_3d, low)))
            .map(|mode| self.transfer_size(mode))
            .max()
            .unwrap_or_default()
    }
}
