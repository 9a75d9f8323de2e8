use crate::PixelLayout;
use derive_setters::Setters;
use serde::{Deserialize, Serialize};

pub const WIDTH_DS: u32 = 256;
pub const HEIGHT_DS: u32 = 192;
pub const TOP_WIDTH_3DS: u32 = 400;
pub const BOT_WIDTH_3DS: u32 = 320;
pub const HEIGHT_3DS: u32 = 240;

pub const DS_SAMPLES_IN: usize = 1096;
pub const O3DS_SAMPLES_IN: usize = 1096 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Ftd3,
    Usb,
    Ftd2,
    IsNitro,
    CypressNisetro,
    CypressOptimize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoDataType {
    Rgb,
    Bgr,
    Rgb16,
    Bgr16,
}

impl VideoDataType {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            VideoDataType::Rgb | VideoDataType::Bgr => 3,
            VideoDataType::Rgb16 | VideoDataType::Bgr16 => 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureScreens {
    #[default]
    Both,
    Top,
    Bottom,
}

/// Runtime-switchable capture parameters that change the frame size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMode {
    pub stereo_3d: bool,
    pub low_bandwidth: bool,
}

impl CaptureMode {
    pub fn new(stereo_3d: bool, low_bandwidth: bool) -> Self {
        Self {
            stereo_3d,
            low_bandwidth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
pub struct DeviceDescriptor {
    pub serial: String,
    pub name: String,
    pub long_name: String,
    pub kind: ConnectionKind,
    pub video_data_type: VideoDataType,
    pub is_3ds: bool,
    pub has_3d: bool,
    pub has_audio: bool,

    /// Geometry of the top screen, in pixels
    pub top_width: u32,
    pub top_height: u32,

    /// Geometry of the bottom screen, in pixels
    pub bot_width: u32,
    pub bot_height: u32,

    /// Maximum number of audio sample words in one frame
    pub max_samples_in: usize,
}

impl DeviceDescriptor {
    pub fn new(serial: impl Into<String>, name: impl Into<String>, kind: ConnectionKind) -> Self {
        let name = name.into();
        Self {
            serial: serial.into(),
            long_name: name.clone(),
            name,
            kind,
            video_data_type: VideoDataType::Rgb16,
            is_3ds: false,
            has_3d: false,
            has_audio: true,
            top_width: WIDTH_DS,
            top_height: HEIGHT_DS,
            bot_width: WIDTH_DS,
            bot_height: HEIGHT_DS,
            max_samples_in: DS_SAMPLES_IN,
        }
    }

    pub fn new_3ds(serial: impl Into<String>, name: impl Into<String>, kind: ConnectionKind) -> Self {
        Self::new(serial, name, kind)
            .with_video_data_type(VideoDataType::Rgb)
            .with_is_3ds(true)
            .with_top_width(TOP_WIDTH_3DS)
            .with_top_height(HEIGHT_3DS)
            .with_bot_width(BOT_WIDTH_3DS)
            .with_bot_height(HEIGHT_3DS)
            .with_max_samples_in(O3DS_SAMPLES_IN)
    }

    pub fn pixel_layout(&self) -> PixelLayout {
        match (self.video_data_type, self.kind) {
            (VideoDataType::Rgb | VideoDataType::Bgr, _) => PixelLayout::Rgb888,
            (_, ConnectionKind::CypressOptimize) => PixelLayout::Optimize565,
            _ => PixelLayout::OldDs565,
        }
    }

    /// Bytes of video data at the front of a frame captured in `mode`.
    pub fn video_in_size(&self, mode: CaptureMode) -> usize {
        let top_width = if mode.stereo_3d && self.has_3d {
            self.top_width * 2
        } else {
            self.top_width
        };
        let pixels = (top_width * self.top_height + self.bot_width * self.bot_height) as usize;

        let bytes_per_pixel = if mode.low_bandwidth && self.is_3ds {
            2
        } else {
            self.video_data_type.bytes_per_pixel()
        };
        pixels * bytes_per_pixel
    }

    /// Number of audio sample words carried by a frame of `frame_len` bytes.
    pub fn audio_samples(&self, frame_len: usize, video_in_size: usize) -> usize {
        audio_samples(frame_len, video_in_size, self.max_samples_in, self.has_audio)
    }
}

/// Audio follows the video data as 16-bit words.
pub fn audio_samples(
    frame_len: usize,
    video_in_size: usize,
    max_samples_in: usize,
    has_audio: bool,
) -> usize {
    if !has_audio || frame_len <= video_in_size {
        return 0;
    }

    ((frame_len - video_in_size) / 2).min(max_samples_in)
}
