use capture_device::{BackendError, DeviceDescriptor};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Previous device still closing...")]
    PreviousStillClosing,

    #[error("No device was found")]
    NoDeviceFound,

    #[error("{} devices found, a selection is needed", .0.len())]
    NeedsSelection(Vec<DeviceDescriptor>),

    #[error("Invalid device selection: {0}")]
    InvalidSelection(String),

    #[error("Backend failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Disconnected: Resync timeout")]
    ResyncTimeout,

    #[error("Disconnected: {0}")]
    Fatal(String),

    #[error("Invalid configuration parameters: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

/// Why a writer lane got no slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("writer lane {0} is out of range")]
    LaneOutOfRange(usize),

    #[error("writer lane already holds slot {0}")]
    AlreadyLeased(usize),

    #[error("no free slot")]
    Exhausted,
}
