use crate::CaptureScreens;

pub const MAX_PACKET_SIZE_USB2: usize = 512;
pub const FTD2_INTRA_PACKET_HEADER_SIZE: usize = 2;
pub const FTD2_OLDDS_SYNCH_VALUES: u16 = 0x4321;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Stall,
    Cancelled,
    NoDevice,
    Overflow,
    Error,
}

pub type ReadCallback = Box<dyn FnOnce(TransferResult) + Send + 'static>;

pub struct ReadRequest {
    pub lane: usize,
    pub buffer: Box<[u8]>,

    /// Bytes to read into the front of `buffer`
    pub size: usize,

    pub callback: ReadCallback,
}

impl ReadRequest {
    /// Fire the completion without touching the bus.
    pub fn fail(self, status: TransferStatus) {
        let result = TransferResult {
            lane: self.lane,
            status,
            requested: self.size,
            transferred: 0,
            screens: CaptureScreens::Both,
            buffer: self.buffer,
        };
        (self.callback)(result);
    }
}

#[derive(Debug)]
pub struct TransferResult {
    pub lane: usize,
    pub status: TransferStatus,
    pub requested: usize,
    pub transferred: usize,
    pub screens: CaptureScreens,
    pub buffer: Box<[u8]>,
}

impl TransferResult {
    pub fn is_short(&self) -> bool {
        self.status == TransferStatus::Completed && self.transferred < self.requested
    }
}

/// Raw bulk stream layout of devices that insert a small header into every
/// USB packet and pad the end of each frame with a run of `marker` halfwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFraming {
    pub chunk_size: usize,
    pub header_size: usize,
    pub marker: u16,
}

impl Default for StreamFraming {
    fn default() -> Self {
        Self {
            chunk_size: MAX_PACKET_SIZE_USB2,
            header_size: FTD2_INTRA_PACKET_HEADER_SIZE,
            marker: FTD2_OLDDS_SYNCH_VALUES,
        }
    }
}

impl StreamFraming {
    pub fn payload_per_chunk(&self) -> usize {
        self.chunk_size - self.header_size
    }

    /// Raw bytes needed on the bus to carry `length` logical bytes.
    pub fn expanded_length(&self, length: usize) -> usize {
        if length == 0 {
            return self.header_size;
        }
        length + length.div_ceil(self.payload_per_chunk()) * self.header_size
    }

    /// Logical bytes carried by `raw_length` bytes read from the bus.
    ///
    /// Every chunk is charged a full header, a trailing chunk shorter than
    /// the header carries nothing.
    pub fn stripped_length(&self, raw_length: usize) -> usize {
        let full = raw_length / self.chunk_size;
        let rest = raw_length % self.chunk_size;
        full * self.payload_per_chunk() + rest.saturating_sub(self.header_size)
    }
}
