use crate::CaptureError;
use byteorder::{ByteOrder, LittleEndian};
use capture_device::{BackendError, CaptureConnection, StreamFraming};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Packets read per probe while hunting for a frame boundary.
pub const RESYNC_PROBE_PACKETS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Frame boundary at the start, `length` bytes of payload before the
    /// trailing marker run
    Aligned { length: usize },

    /// Buffer starts inside a marker run. Discarding `discard` bytes lands on
    /// the next frame, zero when no boundary was visible.
    LeadingRun { discard: usize },

    /// Buffer does not end in a marker run. Discarding `discard` bytes lands
    /// on the next frame, zero when no boundary was visible.
    Lost { discard: usize },
}

/// Realigns framed byte streams on their marker runs.
///
/// All lengths are in bytes but every decision is taken on whole 16-bit
/// words, so discards are always even.
#[derive(Debug, Clone, Copy)]
pub struct StreamSynchronizer {
    framing: StreamFraming,
}

impl StreamSynchronizer {
    pub fn new(framing: StreamFraming) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> StreamFraming {
        self.framing
    }

    /// Raw bytes to request for a frame of `frame_size` logical bytes.
    pub fn transfer_size(&self, frame_size: usize) -> usize {
        self.framing.expanded_length(frame_size)
    }

    /// Remove the per-packet headers from the first `raw_length` bytes of
    /// `buffer`, in place. Returns the logical length.
    pub fn strip_headers(&self, buffer: &mut [u8], raw_length: usize) -> usize {
        let raw_length = raw_length.min(buffer.len());
        let chunk = self.framing.chunk_size;
        let header = self.framing.header_size;
        let mut written = 0;

        for start in (0..raw_length).step_by(chunk) {
            let end = (start + chunk).min(raw_length);
            let payload_start = (start + header).min(end);
            buffer.copy_within(payload_start..end, written);
            written += end - payload_start;
        }

        written
    }

    pub fn check(&self, logical: &[u8]) -> Alignment {
        let words = logical.len() / 2;
        if words == 0 {
            return Alignment::Lost { discard: 0 };
        }

        if self.is_marker(logical, 0) {
            let run = (0..words)
                .take_while(|i| self.is_marker(logical, *i))
                .count();
            let discard = if run == words { 0 } else { run * 2 };
            return Alignment::LeadingRun { discard };
        }

        if !self.is_marker(logical, words - 1) {
            let discard = self
                .first_run_end(logical, 0)
                .map(|word| word * 2)
                .unwrap_or_default();
            return Alignment::Lost { discard };
        }

        Alignment::Aligned {
            length: self.trim_trailing_run(logical),
        }
    }

    /// Length of `logical` without its trailing marker run.
    pub fn trim_trailing_run(&self, logical: &[u8]) -> usize {
        let mut words = logical.len() / 2;
        while words > 0 && self.is_marker(logical, words - 1) {
            words -= 1;
        }
        words * 2
    }

    /// Consume `bytes` logical bytes with one direct read.
    pub fn discard(
        &self,
        conn: &mut dyn CaptureConnection,
        bytes: usize,
        timeout: Duration,
    ) -> Result<(), CaptureError> {
        let bytes = bytes & !1;
        if bytes == 0 {
            return Ok(());
        }

        let raw = self.framing.expanded_length(bytes);
        let mut scratch = vec![0; raw];
        let read = direct_read(conn, &mut scratch, timeout)?;
        if self.framing.stripped_length(read) < bytes {
            return Err(CaptureError::Fatal(format!(
                "Resync: discarded {read} of {raw} bytes"
            )));
        }

        debug!("discarded {bytes} bytes to realign the stream");
        Ok(())
    }

    /// Probe the stream until a marker run ends inside a probe, then discard
    /// up to the next frame boundary.
    ///
    /// Returns `Ok(false)` when `keep_going` turned false before a boundary
    /// was found.
    pub fn hard_resync(
        &self,
        conn: &mut dyn CaptureConnection,
        frame_size: usize,
        read_timeout: Duration,
        resync_timeout: Duration,
        keep_going: impl Fn() -> bool,
    ) -> Result<bool, CaptureError> {
        let deadline = Instant::now() + resync_timeout;
        let probe_raw = self.framing.chunk_size * RESYNC_PROBE_PACKETS;
        let mut probe = vec![0; probe_raw];
        let mut probes = 0;

        info!("hard resync of a {frame_size} byte frame stream");

        while keep_going() {
            if Instant::now() >= deadline {
                warn!("hard resync gave up after {probes} probes");
                return Err(CaptureError::ResyncTimeout);
            }

            let read = match direct_read(conn, &mut probe, read_timeout) {
                Ok(read) => read,
                Err(CaptureError::Backend(BackendError::Timeout)) => continue,
                Err(e) => return Err(e),
            };
            probes += 1;

            let logical = self.strip_headers(&mut probe, read);
            let Some(word) = self.first_run_end(&probe[..logical], 0) else {
                continue;
            };

            let into_frame = (logical - word * 2) % frame_size.max(1);
            let remainder = (frame_size - into_frame) % frame_size.max(1);
            self.discard(conn, remainder, read_timeout)?;

            info!("hard resync found a boundary after {probes} probes");
            return Ok(true);
        }

        Ok(false)
    }

    /// Word index right after the first marker run that ends inside
    /// `logical`, searching from word `from`.
    fn first_run_end(&self, logical: &[u8], from: usize) -> Option<usize> {
        let words = logical.len() / 2;
        let mut i = from;

        while i < words && !self.is_marker(logical, i) {
            i += 1;
        }
        if i == words {
            return None;
        }
        while i < words && self.is_marker(logical, i) {
            i += 1;
        }

        (i < words).then_some(i)
    }

    fn is_marker(&self, logical: &[u8], word: usize) -> bool {
        LittleEndian::read_u16(&logical[word * 2..word * 2 + 2]) == self.framing.marker
    }
}

fn direct_read(
    conn: &mut dyn CaptureConnection,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, CaptureError> {
    conn.blocking_read(buffer, timeout)
        .map_err(CaptureError::Backend)
}
