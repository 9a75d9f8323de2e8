mod device;
mod pixel;
mod transfer;

pub use device::*;
pub use pixel::*;
pub use transfer::*;

use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("No device was found")]
    NoDevice,

    #[error("Device open failed: {0}")]
    Open(String),

    #[error("Transfer failed: {0}")]
    Io(String),

    #[error("Transfer timed out")]
    Timeout,

    #[error("Pipe stall")]
    Stall,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// One hardware family. Enumerates its devices and opens connections to them.
pub trait CaptureBackend: Send {
    fn name(&self) -> &str;

    /// Largest number of bytes a single read of any mode may need.
    fn max_transfer_size(&self) -> usize;

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError>;

    fn open(
        &mut self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn CaptureConnection>, BackendError>;
}

/// An opened device.
///
/// Sizes returned by `frame_size` and `video_in_size` are logical sizes. For
/// devices that report a [`StreamFraming`], the number of bytes actually read
/// from the bus is larger, see [`StreamFraming::expanded_length`].
pub trait CaptureConnection: Send {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Upper bound on concurrently outstanding reads.
    fn max_lanes(&self) -> usize;

    fn frame_size(&self, mode: CaptureMode) -> usize;

    fn video_in_size(&self, mode: CaptureMode) -> usize;

    /// Bytes at the front of every payload that carry no frame data.
    fn leading_offset(&self, _mode: CaptureMode) -> usize {
        0
    }

    fn framing(&self) -> Option<StreamFraming> {
        None
    }

    fn supports_async(&self) -> bool {
        true
    }

    /// Queue an asynchronous read of `request.size` bytes.
    ///
    /// Exactly one completion is delivered per call, also when the read could
    /// not be queued at all. The buffer travels back inside the completion.
    fn submit_read(&mut self, request: ReadRequest);

    /// Abort the outstanding read on `lane`. Its completion still fires, with
    /// [`TransferStatus::Cancelled`] unless it had already finished.
    fn cancel(&mut self, lane: usize);

    fn blocking_read(&mut self, buffer: &mut [u8], timeout: Duration)
    -> Result<usize, BackendError>;

    fn reconfigure(&mut self, mode: CaptureMode) -> Result<(), BackendError>;

    fn clear_halt(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("clear halt".to_string()))
    }

    fn close(&mut self);
}
