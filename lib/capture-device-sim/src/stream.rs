use crate::{SimDeviceConfig, SimKind};
use byteorder::{ByteOrder, LittleEndian};
use capture_device::{CaptureMode, FTD2_OLDDS_SYNCH_VALUES, StreamFraming};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// FTDI modem status bytes leading every packet.
pub const PACKET_HEADER: [u8; 2] = [0x32, 0x60];

/// Payload words carry the high bit so they never look like the marker.
const PAYLOAD_FLAG: u16 = 0x8000;

/// Frame count and payload length encoded in a framed frame's first words.
pub fn payload_length_of(logical: &[u8]) -> usize {
    if logical.len() < 2 {
        return 0;
    }
    (LittleEndian::read_u16(logical) & !PAYLOAD_FLAG) as usize * 2
}

pub fn framed_index_of(logical: &[u8]) -> Option<u16> {
    let word = LittleEndian::read_u16(logical.get(2..4)?);
    Some(word & !PAYLOAD_FLAG)
}

/// Frame counter stamped on the front of every plain frame.
pub fn plain_index_of(data: &[u8]) -> Option<u64> {
    data.get(..8).map(LittleEndian::read_u64)
}

/// Deterministic content source of one simulated device.
#[derive(Debug)]
pub(crate) struct SimStream {
    kind: SimKind,
    framing: StreamFraming,
    seed: u64,
    max_run_words: usize,
    frame_bytes: usize,

    // logical byte position in the ideal framed stream
    position: u64,
    cached_frame: Option<(u64, usize)>,
    idle_at: u64,
    idle_left: usize,

    plain_frames: u64,
}

impl SimStream {
    pub fn new(config: &SimDeviceConfig) -> Self {
        Self {
            kind: config.kind,
            framing: StreamFraming::default(),
            seed: config.seed,
            max_run_words: config.max_run_words.max(1),
            frame_bytes: config.frame_size(CaptureMode::default()),
            position: 0,
            cached_frame: None,
            idle_at: 0,
            idle_left: 0,
            plain_frames: 0,
        }
    }

    /// Restart the stream on a frame boundary with a new frame size.
    pub fn restart(&mut self, frame_bytes: usize) {
        self.frame_bytes = frame_bytes;
        self.position = 0;
        self.cached_frame = None;
        self.idle_left = 0;
    }

    pub fn shift(&mut self, bytes: usize) {
        self.position += (bytes & !1) as u64;
    }

    /// Drop the rest of the current frame, and any pending idle run.
    pub fn skip_to_boundary(&mut self) {
        let frame = self.frame_bytes.max(2) as u64;
        self.position = self.position.div_ceil(frame) * frame;
        self.idle_left = 0;
    }

    /// Extend the marker run at the next frame boundary.
    pub fn insert_idle(&mut self, bytes: usize) {
        let frame = self.frame_bytes.max(2) as u64;
        self.idle_at = self.position.div_ceil(frame) * frame;
        self.idle_left += bytes & !1;
    }

    /// Fill `raw` with what the device puts on the bus.
    pub fn fill(&mut self, raw: &mut [u8]) {
        match self.kind {
            SimKind::Plain => self.fill_plain(raw),
            SimKind::Framed => self.fill_framed(raw),
        }
    }

    fn fill_plain(&mut self, raw: &mut [u8]) {
        let index = self.plain_frames;
        self.plain_frames += 1;

        raw.fill(index as u8);
        if raw.len() >= 8 {
            LittleEndian::write_u64(&mut raw[..8], index);
        }
    }

    fn fill_framed(&mut self, raw: &mut [u8]) {
        let header = self.framing.header_size;
        for packet in raw.chunks_mut(self.framing.chunk_size) {
            let split = header.min(packet.len());
            let (head, payload) = packet.split_at_mut(split);
            head.copy_from_slice(&PACKET_HEADER[..split]);
            self.fill_logical(payload);
        }
    }

    fn fill_logical(&mut self, out: &mut [u8]) {
        let marker = FTD2_OLDDS_SYNCH_VALUES.to_le_bytes();

        for byte in out.iter_mut() {
            if self.idle_left > 0 && self.position == self.idle_at {
                *byte = marker[self.idle_left % 2];
                self.idle_left -= 1;
                continue;
            }

            let word = self.word_at(self.position & !1);
            *byte = word.to_le_bytes()[(self.position % 2) as usize];
            self.position += 1;
        }
    }

    fn word_at(&mut self, position: u64) -> u16 {
        let frame_bytes = self.frame_bytes.max(2) as u64;
        let frame = position / frame_bytes;
        let word = ((position % frame_bytes) / 2) as usize;

        let payload_words = self.payload_words(frame);
        if word >= payload_words {
            return FTD2_OLDDS_SYNCH_VALUES;
        }

        let value = match word {
            0 => payload_words as u16,
            1 => frame as u16,
            _ => word as u16,
        };
        PAYLOAD_FLAG | (value & !PAYLOAD_FLAG)
    }

    fn payload_words(&mut self, frame: u64) -> usize {
        if let Some((cached, words)) = self.cached_frame
            && cached == frame
        {
            return words;
        }

        let total = self.frame_bytes / 2;
        let max_run = self.max_run_words.min(total.saturating_sub(2)).max(1);
        let mut rng = StdRng::seed_from_u64(self.seed ^ frame.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let run = rng.random_range(1..=max_run);
        let words = total.saturating_sub(run);

        self.cached_frame = Some((frame, words));
        words
    }
}
