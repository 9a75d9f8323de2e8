use crate::{
    CaptureContext, CaptureError, EngineConfig, EngineState, FrameMeta, MultiTimedSignal,
    ResyncPolicy, SlotError, WriterSlot,
    stream_sync::{Alignment, StreamSynchronizer},
};
use capture_device::{
    BackendError, CaptureConnection, CaptureMode, CaptureScreens, ReadRequest, TransferResult,
    TransferStatus,
};
use crossbeam::channel::{Receiver, TryRecvError};
use log::{debug, info, trace, warn};
use spin_sleep::SpinSleeper;
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Requests from the control surface to the acquisition thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Reconfigure(CaptureMode),
    Disconnect,
}

/// Runs the read pipeline of one connection until it goes away.
pub struct AcquisitionEngine {
    context: Arc<CaptureContext>,
    config: EngineConfig,
}

impl AcquisitionEngine {
    pub fn new(context: Arc<CaptureContext>, config: EngineConfig) -> Self {
        Self { context, config }
    }

    pub fn context(&self) -> &Arc<CaptureContext> {
        &self.context
    }

    /// Stream from `conn` until the session stops, a disconnect is requested
    /// or a fatal error occurs. Every outstanding read has been waited for
    /// (within the drain timeout) when this returns.
    pub fn run_until_disconnect(
        &self,
        conn: &mut dyn CaptureConnection,
        control: &Receiver<ControlCommand>,
    ) -> Result<(), CaptureError> {
        let mut session = Session::new(self, conn)?;
        let result = session.stream(control);
        session.shutdown();
        result
    }
}

/// Per-lane and per-stream bookkeeping touched by the completions.
#[derive(Debug)]
struct LaneBook {
    in_use: Vec<bool>,
    lane_last: Vec<Option<Instant>>,
    last_delivered: Option<Instant>,
    next_sequence: u64,

    // completions at or below this belong to an earlier submission round
    last_used: u64,

    misaligned_since: Option<Instant>,
    resync_discard: Option<usize>,
}

/// Session state shared with the completion callbacks.
struct Shared {
    context: Arc<CaptureContext>,
    lane_free: MultiTimedSignal,
    book: Mutex<LaneBook>,
    fatal: Mutex<Option<CaptureError>>,
    stall_pending: AtomicBool,
    consecutive_timeouts: AtomicU32,
    max_consecutive_timeouts: u32,
    sync: Option<StreamSynchronizer>,
    leading_offset: AtomicUsize,
}

enum Outcome {
    Delivered,
    Skipped,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, LaneBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, lane: usize) -> u64 {
        let mut book = self.book();
        book.in_use[lane] = true;
        book.next_sequence += 1;
        book.next_sequence
    }

    fn outstanding(&self) -> usize {
        self.book().in_use.iter().filter(|b| **b).count()
    }

    fn is_free(&self, lane: usize) -> bool {
        !self.book().in_use[lane]
    }

    fn fail(&self, error: CaptureError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            warn!("capture failed: {error}");
            *fatal = Some(error);
        }
    }

    fn take_fatal(&self) -> Option<CaptureError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn has_fatal(&self) -> bool {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn has_pending(&self) -> bool {
        self.has_fatal()
            || self.stall_pending.load(Ordering::Acquire)
            || self.book().resync_discard.is_some()
    }

    /// Ignore completions of everything submitted so far.
    fn retire_submissions(&self) {
        let mut book = self.book();
        book.last_used = book.next_sequence;
    }

    fn reset_stream(&self) {
        let mut book = self.book();
        book.lane_last.iter_mut().for_each(|t| *t = None);
        book.last_delivered = None;
        book.misaligned_since = None;
        book.resync_discard = None;
    }

    /// Completion of one read, on the backend's event thread or inline.
    fn complete(&self, mut lease: WriterSlot, sequence: u64, result: TransferResult) {
        let full_read = result.status == TransferStatus::Completed && !result.is_short();
        let TransferResult {
            lane,
            status,
            requested,
            transferred,
            screens,
            buffer,
        } = result;
        lease.restore_payload(buffer);

        let outcome = if full_read {
            self.consecutive_timeouts.store(0, Ordering::Release);
            self.deliver(lease, sequence, transferred, screens)
        } else {
            drop(lease);
            self.classify_failure(lane, status, requested, transferred);
            Outcome::Skipped
        };

        match outcome {
            Outcome::Delivered => {
                self.context.status.count_delivered();
                self.context.status.wake_consumers();
            }
            Outcome::Skipped => self.context.status.count_skipped(),
        }

        // The lease is gone by now, so the lane may take a new one
        self.book().in_use[lane] = false;
        self.lane_free.specific_unlock(lane);
    }

    fn classify_failure(
        &self,
        lane: usize,
        status: TransferStatus,
        requested: usize,
        transferred: usize,
    ) {
        match status {
            TransferStatus::Completed => {
                trace!("lane {lane}: short read of {transferred}/{requested} bytes");
            }
            TransferStatus::TimedOut => {
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
                if timeouts > self.max_consecutive_timeouts {
                    self.fail(CaptureError::Fatal("Read timeout".to_string()));
                } else {
                    debug!("lane {lane}: read timed out ({timeouts} in a row)");
                }
            }
            TransferStatus::Cancelled => (),
            TransferStatus::Stall => {
                debug!("lane {lane}: pipe stall");
                self.stall_pending.store(true, Ordering::Release);
            }
            TransferStatus::NoDevice => {
                self.fail(CaptureError::Fatal("Device removed".to_string()));
            }
            TransferStatus::Overflow | TransferStatus::Error => {
                self.fail(CaptureError::Fatal("Read error".to_string()));
            }
        }
    }

    fn deliver(
        &self,
        mut lease: WriterSlot,
        sequence: u64,
        transferred: usize,
        screens: CaptureScreens,
    ) -> Outcome {
        let lane = lease.lane();
        let alignment = match self.sync {
            Some(sync) => {
                let payload = lease.payload_mut();
                let logical = sync.strip_headers(payload, transferred);
                sync.check(&payload[..logical])
            }
            None => Alignment::Aligned {
                length: transferred,
            },
        };

        let now = Instant::now();
        let (time_delta, lane_elapsed, length) = {
            let mut book = self.book();
            if sequence <= book.last_used {
                trace!("lane {lane}: dropping stale completion {sequence}");
                return Outcome::Skipped;
            }
            book.last_used = sequence;

            let lane_elapsed = book.lane_last[lane]
                .replace(now)
                .map(|t| now - t)
                .unwrap_or_default();

            match alignment {
                Alignment::Aligned { length } => {
                    book.misaligned_since = None;
                    let time_delta = book
                        .last_delivered
                        .replace(now)
                        .map(|t| now - t)
                        .unwrap_or_default();
                    (time_delta, lane_elapsed, length)
                }
                Alignment::LeadingRun { discard } | Alignment::Lost { discard } => {
                    debug!("lane {lane}: frame {sequence} misaligned, discard {discard}");
                    book.misaligned_since.get_or_insert(now);
                    book.resync_discard = Some(discard);
                    return Outcome::Skipped;
                }
            }
        };

        let leading_offset = self.leading_offset.load(Ordering::Acquire);
        if leading_offset >= length {
            trace!("lane {lane}: frame {sequence} holds no data past the leading offset");
            return Outcome::Skipped;
        }

        let meta = FrameMeta {
            length,
            time_delta,
            lane_elapsed,
            screens,
            leading_offset,
            discard_candidate: self.context.status.consume_cooldown(),
            sequence: 0,
        };

        trace!("lane {lane}: frame {sequence} of {length} bytes");
        if self.context.pool.write_payload(lease, None, meta) {
            Outcome::Delivered
        } else {
            Outcome::Skipped
        }
    }
}

struct Session<'a> {
    config: &'a EngineConfig,
    context: Arc<CaptureContext>,
    conn: &'a mut dyn CaptureConnection,
    shared: Arc<Shared>,
    lanes: usize,
    mode: CaptureMode,
    raw_size: usize,
    is_async: bool,
}

impl<'a> Session<'a> {
    fn new(
        engine: &'a AcquisitionEngine,
        conn: &'a mut dyn CaptureConnection,
    ) -> Result<Self, CaptureError> {
        let config = &engine.config;
        let context = engine.context.clone();
        let lanes = config
            .writer_lanes
            .min(context.pool.writer_lanes())
            .min(conn.max_lanes())
            .max(1);
        let mode = context.status.mode();
        let sync = conn.framing().map(StreamSynchronizer::new);

        let shared = Arc::new(Shared {
            context: context.clone(),
            lane_free: MultiTimedSignal::with_base_rate(lanes, config.base_rate),
            book: Mutex::new(LaneBook {
                in_use: vec![false; lanes],
                lane_last: vec![None; lanes],
                last_delivered: None,
                next_sequence: 0,
                last_used: 0,
                misaligned_since: None,
                resync_discard: None,
            }),
            fatal: Mutex::new(None),
            stall_pending: AtomicBool::new(false),
            consecutive_timeouts: AtomicU32::new(0),
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            sync,
            leading_offset: AtomicUsize::new(conn.leading_offset(mode)),
        });

        let is_async = conn.supports_async();
        let mut session = Self {
            config,
            context,
            conn,
            shared,
            lanes,
            mode,
            raw_size: 0,
            is_async,
        };
        session.raw_size = session.transfer_size()?;

        info!(
            "streaming {} with {lanes} {} lanes, {} bytes per read",
            session.conn.descriptor().long_name,
            if is_async { "async" } else { "blocking" },
            session.raw_size
        );
        session.set_state(EngineState::Streaming);
        Ok(session)
    }

    fn set_state(&self, state: EngineState) {
        if self.context.status.engine_state() != state {
            debug!("engine state {state:?}");
        }
        self.context.status.set_engine_state(state);
    }

    fn transfer_size(&self) -> Result<usize, CaptureError> {
        let frame = self.conn.frame_size(self.mode);
        let raw = match self.shared.sync {
            Some(sync) => sync.transfer_size(frame),
            None => frame,
        };

        let capacity = self.context.pool.slot_capacity();
        if raw == 0 || raw > capacity {
            return Err(CaptureError::Fatal(format!(
                "Frame of {raw} bytes does not fit a {capacity} byte slot"
            )));
        }
        Ok(raw)
    }

    fn stream(&mut self, control: &Receiver<ControlCommand>) -> Result<(), CaptureError> {
        let sleeper = SpinSleeper::default();

        loop {
            if !self.context.status.is_live() {
                info!("capture stopped");
                return Ok(());
            }

            if let Some(e) = self.shared.take_fatal() {
                return Err(e);
            }

            match control.try_recv() {
                Ok(ControlCommand::Reconfigure(mode)) => self.reconfigure(mode)?,
                Ok(ControlCommand::Disconnect) => {
                    info!("disconnect requested");
                    return Ok(());
                }
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }

            if self.shared.stall_pending.swap(false, Ordering::AcqRel) {
                self.clear_stall()?;
            }

            let discard = self.shared.book().resync_discard.take();
            if let Some(discard) = discard {
                self.resync(discard)?;
            }

            let starved = self.fill_lanes();

            if self.is_async && !(starved && self.shared.outstanding() == 0) {
                self.shared.lane_free.general_timed_lock();
            } else if starved {
                sleeper.sleep(self.config.poll_interval);
            }
        }
    }

    /// Submit a read on every free lane. Returns whether the pool ran out of
    /// slots.
    fn fill_lanes(&mut self) -> bool {
        let lanes = if self.is_async { self.lanes } else { 1 };

        for lane in 0..lanes {
            if self.shared.has_pending() || !self.context.status.is_live() {
                break;
            }
            if !self.shared.is_free(lane) {
                continue;
            }
            if !self.submit(lane) {
                return true;
            }
        }

        if !self.is_async {
            self.shared.lane_free.general_try_lock();
        }
        false
    }

    fn submit(&mut self, lane: usize) -> bool {
        let mut lease = match self.context.pool.get_writer_slot(lane) {
            Ok(lease) => lease,
            Err(e @ SlotError::Exhausted) => {
                trace!("lane {lane}: {e}");
                return false;
            }
            Err(e) => {
                warn!("lane {lane}: {e}");
                return false;
            }
        };

        let sequence = self.shared.begin(lane);
        let buffer = lease.take_payload();

        if self.is_async {
            let shared = self.shared.clone();
            self.conn.submit_read(ReadRequest {
                lane,
                buffer,
                size: self.raw_size,
                callback: Box::new(move |result| shared.complete(lease, sequence, result)),
            });
            return true;
        }

        let mut buffer = buffer;
        let size = self.raw_size.min(buffer.len());
        let (status, transferred) =
            match self.conn.blocking_read(&mut buffer[..size], self.config.read_timeout) {
                Ok(read) => (TransferStatus::Completed, read),
                Err(BackendError::Timeout) => (TransferStatus::TimedOut, 0),
                Err(BackendError::Stall) => (TransferStatus::Stall, 0),
                Err(BackendError::NoDevice) => (TransferStatus::NoDevice, 0),
                Err(e) => {
                    warn!("lane {lane}: {e}");
                    (TransferStatus::Error, 0)
                }
            };

        self.shared.complete(
            lease,
            sequence,
            TransferResult {
                lane,
                status,
                requested: size,
                transferred,
                screens: CaptureScreens::Both,
                buffer,
            },
        );
        true
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shared.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.shared.lane_free.general_timed_lock();
        }
    }

    /// Wait for every outstanding read, cancelling them if they take too
    /// long.
    fn drain(&mut self) -> bool {
        self.set_state(EngineState::Draining);

        let drained = self.wait_idle(self.config.drain_timeout) || {
            debug!("cancelling {} outstanding reads", self.shared.outstanding());
            for lane in 0..self.lanes {
                self.conn.cancel(lane);
            }
            self.wait_idle(self.config.drain_timeout)
        };

        self.shared.retire_submissions();
        drained
    }

    fn drain_or_fail(&mut self, what: &str) -> Result<(), CaptureError> {
        if self.drain() {
            return Ok(());
        }
        Err(CaptureError::Fatal(format!(
            "{what}: {} reads did not complete",
            self.shared.outstanding()
        )))
    }

    fn reconfigure(&mut self, mode: CaptureMode) -> Result<(), CaptureError> {
        info!("reconfiguring capture to {mode:?}");
        self.drain_or_fail("Reconfigure")?;

        self.conn.reconfigure(mode)?;
        self.mode = mode;
        self.context.status.set_mode(mode);
        self.raw_size = self.transfer_size()?;
        self.shared
            .leading_offset
            .store(self.conn.leading_offset(mode), Ordering::Release);

        self.context.status.reset_cooldown();
        self.shared.reset_stream();
        self.set_state(EngineState::Streaming);

        info!("reconfigured, {} bytes per read", self.raw_size);
        Ok(())
    }

    fn clear_stall(&mut self) -> Result<(), CaptureError> {
        self.drain_or_fail("Pipe stall")?;

        if let Err(e) = self.conn.clear_halt() {
            warn!("clearing the endpoint halt failed: {e}");
            return Err(CaptureError::Fatal("Pipe stall".to_string()));
        }

        self.shared.stall_pending.store(false, Ordering::Release);
        info!("cleared endpoint halt");
        self.set_state(EngineState::Streaming);
        Ok(())
    }

    fn resync(&mut self, discard: usize) -> Result<(), CaptureError> {
        let Some(sync) = self.shared.sync else {
            return Ok(());
        };
        self.drain_or_fail("Resync")?;
        // drained reads report the same phase
        self.shared.book().resync_discard = None;

        match self.config.resync_policy {
            ResyncPolicy::SleepAndGuess => {
                let since = self.shared.book().misaligned_since;
                if since.is_some_and(|t| t.elapsed() >= self.config.resync_timeout) {
                    warn!("stream still misaligned after {:?}", self.config.resync_timeout);
                    return Err(CaptureError::ResyncTimeout);
                }
                SpinSleeper::default().sleep(Duration::from_millis(1));
            }
            ResyncPolicy::Scan => {
                let since = self.shared.book().misaligned_since;
                if since.is_some_and(|t| t.elapsed() >= self.config.resync_after) {
                    let context = self.context.clone();
                    let frame_size = self.conn.frame_size(self.mode);
                    let found = sync.hard_resync(
                        &mut *self.conn,
                        frame_size,
                        self.config.resync_read_timeout,
                        self.config.resync_timeout,
                        move || context.status.is_live(),
                    )?;

                    if found {
                        self.context
                            .status
                            .set_cooldown(2 * self.lanes as u32);
                        self.shared.book().misaligned_since = None;
                    }
                } else {
                    sync.discard(&mut *self.conn, discard, self.config.resync_read_timeout)?;
                }
            }
        }

        self.set_state(EngineState::Streaming);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.set_state(EngineState::Draining);

        for lane in 0..self.lanes {
            self.conn.cancel(lane);
        }
        if !self.wait_idle(self.config.drain_timeout) {
            warn!(
                "{} reads still outstanding after shutdown",
                self.shared.outstanding()
            );
        }
        self.shared.retire_submissions();

        self.set_state(EngineState::Idle);
        info!("capture engine idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use capture_device::CaptureBackend;
    use capture_device_sim::{SimBackend, SimDeviceConfig};

    fn start(
        config: SimDeviceConfig,
        engine_config: EngineConfig,
    ) -> (SimBackend, Box<dyn CaptureConnection>, AcquisitionEngine) {
        let mut backend = SimBackend::new(vec![config]);
        let devices = backend.list_devices().unwrap();
        let conn = backend.open(&devices[0]).unwrap();

        let context = CaptureContext::new(&engine_config, backend.max_transfer_size());
        context.status.set_connected(true);
        (backend, conn, AcquisitionEngine::new(context, engine_config))
    }

    fn small_plain() -> SimDeviceConfig {
        SimDeviceConfig::plain("E")
            .with_frame_bytes(4096)
            .with_frame_bytes_3d(6144)
            .with_audio_bytes(512)
            .with_frame_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_disconnect_command_stops_streaming() {
        let (_backend, mut conn, engine) = start(small_plain(), EngineConfig::new());
        let (tx, rx) = unbounded();
        tx.send(ControlCommand::Disconnect).unwrap();

        assert!(engine.run_until_disconnect(conn.as_mut(), &rx).is_ok());
        assert_eq!(engine.context().status.engine_state(), EngineState::Idle);
    }

    #[test]
    fn test_frame_too_large_for_pool() {
        let config = small_plain();
        let engine_config = EngineConfig::new();
        let mut backend = SimBackend::new(vec![config]);
        let devices = backend.list_devices().unwrap();
        let mut conn = backend.open(&devices[0]).unwrap();

        let context = CaptureContext::new(&engine_config, 1024);
        context.status.set_connected(true);
        let engine = AcquisitionEngine::new(context, engine_config);
        let (_tx, rx) = unbounded();

        let err = engine.run_until_disconnect(conn.as_mut(), &rx).unwrap_err();
        assert!(matches!(err, CaptureError::Fatal(_)));
    }

    #[test]
    fn test_unplug_is_fatal() {
        let (backend, mut conn, engine) = start(small_plain(), EngineConfig::new());
        let control = backend.control("E").unwrap();
        let (_tx, rx) = unbounded();

        let unplug = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control.unplug();
        });

        let err = engine.run_until_disconnect(conn.as_mut(), &rx).unwrap_err();
        unplug.join().unwrap();
        assert_eq!(err.to_string(), "Disconnected: Device removed");
        assert!(engine.context().status.snapshot().frames_delivered > 0);
    }

    #[test]
    fn test_empty_frames_keep_cooldown() {
        let config = small_plain().with_leading_offset(8192);
        let (backend, mut conn, engine) = start(config, EngineConfig::new().with_writer_lanes(2));
        let control = backend.control("E").unwrap();
        let (tx, rx) = unbounded();

        let stopper = std::thread::spawn(move || {
            while control.completed_transfers() < 10 {
                std::thread::sleep(Duration::from_millis(1));
            }
            tx.send(ControlCommand::Disconnect).unwrap();
        });

        engine.run_until_disconnect(conn.as_mut(), &rx).unwrap();
        stopper.join().unwrap();

        let snapshot = engine.context().status.snapshot();
        assert_eq!(snapshot.frames_delivered, 0);
        assert!(snapshot.frames_skipped >= 5);
        assert_eq!(snapshot.cooldown, 3);
    }

    #[test]
    fn test_framed_frames_are_trimmed() {
        let config = SimDeviceConfig::framed("E")
            .with_frame_bytes(4080)
            .with_audio_bytes(0)
            .with_frame_interval(Duration::from_millis(1));
        let (_backend, mut conn, engine) = start(config, EngineConfig::new().with_writer_lanes(2));
        let context = engine.context().clone();
        let (tx, rx) = unbounded();

        let reader = std::thread::spawn(move || {
            let mut lengths = vec![];
            while lengths.len() < 5 {
                context.status.video_wait.timed_lock();
                if let Some(frame) = context.pool.get_reader_slot(crate::ReaderRole::Video) {
                    let payload = capture_device_sim::payload_length_of(frame.data());
                    lengths.push((frame.data().len(), payload));
                    drop(frame);
                    context.pool.release_reader_slot(crate::ReaderRole::Video);
                }
            }
            tx.send(ControlCommand::Disconnect).unwrap();
            lengths
        });

        engine.run_until_disconnect(conn.as_mut(), &rx).unwrap();
        for (length, payload) in reader.join().unwrap() {
            assert_eq!(length, payload);
            assert!(length < 4080);
        }
    }
}
