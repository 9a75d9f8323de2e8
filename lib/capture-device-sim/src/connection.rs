use crate::{SimControl, SimDeviceConfig, stream::SimStream};
use capture_device::{
    BackendError, CaptureConnection, CaptureMode, CaptureScreens, DeviceDescriptor, ReadRequest,
    StreamFraming, TransferResult, TransferStatus,
};
use crossbeam::channel::{Receiver, Sender, unbounded};
use spin_sleep::SpinSleeper;
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

struct Job {
    request: ReadRequest,
    epoch: u64,
}

/// Bus side of a simulated device. Produces content and applies faults.
struct SimDevice {
    stream: SimStream,
    control: Arc<SimControl>,
    frame_interval: Duration,
    next_frame_at: Option<Instant>,
    shift_every: Option<u64>,
    shift_bytes: usize,
    overrun_after: Option<Duration>,
    last_read_end: Option<Instant>,
}

impl SimDevice {
    /// No read was pending for `idle`.
    fn host_idle(&mut self, idle: Duration) {
        if self.overrun_after.is_some_and(|limit| idle >= limit) {
            log::debug!("sim fifo overrun after {idle:?} without a read");
            self.stream.skip_to_boundary();
        }
    }

    fn pace(&mut self) {
        if self.frame_interval.is_zero() {
            return;
        }

        let now = Instant::now();
        let at = self.next_frame_at.map_or(now, |t| t.max(now));
        SpinSleeper::default().sleep(at - now);
        self.next_frame_at = Some(at + self.frame_interval);
    }

    fn read(&mut self, raw: &mut [u8]) -> (TransferStatus, usize) {
        if !self.control.is_plugged() {
            return (TransferStatus::NoDevice, 0);
        }

        {
            let mut faults = self.control.faults();
            if faults.halted {
                return (TransferStatus::Stall, 0);
            }
            if faults.timeouts > 0 {
                faults.timeouts -= 1;
                return (TransferStatus::TimedOut, 0);
            }
            if faults.short_reads > 0 {
                faults.short_reads -= 1;
                return (TransferStatus::Completed, raw.len() / 2);
            }

            let shift = std::mem::take(&mut faults.shift);
            if shift > 0 {
                self.stream.shift(shift);
            }
            let idle = std::mem::take(&mut faults.idle);
            if idle > 0 {
                self.stream.insert_idle(idle);
            }
        }

        self.stream.fill(raw);
        self.last_read_end = Some(Instant::now());

        let completed = self.control.count_completed();
        if let Some(every) = self.shift_every
            && every > 0
            && completed % every == 0
        {
            log::debug!("sim shifting stream by {} bytes", self.shift_bytes);
            self.stream.shift(self.shift_bytes);
        }

        (TransferStatus::Completed, raw.len())
    }
}

pub struct SimConnection {
    config: SimDeviceConfig,
    descriptor: DeviceDescriptor,
    control: Arc<SimControl>,
    device: Arc<Mutex<SimDevice>>,
    cancel_epochs: Arc<Vec<AtomicU64>>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    mode: CaptureMode,
}

impl SimConnection {
    pub fn open(config: SimDeviceConfig, control: Arc<SimControl>) -> Self {
        let device = Arc::new(Mutex::new(SimDevice {
            stream: SimStream::new(&config),
            control: control.clone(),
            frame_interval: config.frame_interval,
            next_frame_at: None,
            shift_every: config.shift_every,
            shift_bytes: config.shift_bytes,
            overrun_after: config.overrun_after,
            last_read_end: None,
        }));

        let cancel_epochs: Arc<Vec<AtomicU64>> =
            Arc::new((0..config.max_lanes).map(|_| AtomicU64::new(0)).collect());

        let (sender, receiver) = unbounded();
        let worker = spawn_event_thread(receiver, device.clone(), cancel_epochs.clone());

        control.set_opened(true);
        log::info!("opened simulated device {}", config.serial);

        Self {
            descriptor: config.descriptor(),
            config,
            control,
            device,
            cancel_epochs,
            sender: Some(sender),
            worker: Some(worker),
            mode: CaptureMode::default(),
        }
    }

    fn device(&self) -> MutexGuard<'_, SimDevice> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn spawn_event_thread(
    receiver: Receiver<Job>,
    device: Arc<Mutex<SimDevice>>,
    cancel_epochs: Arc<Vec<AtomicU64>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let is_cancelled = |lane: usize, epoch: u64| {
            cancel_epochs
                .get(lane)
                .is_none_or(|e| e.load(Ordering::Acquire) != epoch)
        };

        loop {
            let waiting_since = Instant::now();
            let Ok(Job { request, epoch }) = receiver.recv() else {
                break;
            };
            let idle = waiting_since.elapsed();

            if is_cancelled(request.lane, epoch) {
                request.fail(TransferStatus::Cancelled);
                continue;
            }

            let ReadRequest {
                lane,
                mut buffer,
                size,
                callback,
            } = request;
            let size = size.min(buffer.len());

            let (status, transferred) = {
                let mut device = device.lock().unwrap_or_else(|e| e.into_inner());
                device.host_idle(idle);
                device.pace();
                if is_cancelled(lane, epoch) {
                    (TransferStatus::Cancelled, 0)
                } else {
                    device.read(&mut buffer[..size])
                }
            };

            callback(TransferResult {
                lane,
                status,
                requested: size,
                transferred,
                screens: CaptureScreens::Both,
                buffer,
            });
        }

        log::info!("exit sim event thread");
    })
}

impl CaptureConnection for SimConnection {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn max_lanes(&self) -> usize {
        self.config.max_lanes
    }

    fn frame_size(&self, mode: CaptureMode) -> usize {
        self.config.frame_size(mode)
    }

    fn video_in_size(&self, mode: CaptureMode) -> usize {
        self.config.video_in_size(mode)
    }

    fn leading_offset(&self, _mode: CaptureMode) -> usize {
        self.config.leading_offset
    }

    fn framing(&self) -> Option<StreamFraming> {
        self.config.framing()
    }

    fn supports_async(&self) -> bool {
        self.config.supports_async
    }

    fn submit_read(&mut self, request: ReadRequest) {
        let Some(epoch) = self
            .cancel_epochs
            .get(request.lane)
            .map(|e| e.load(Ordering::Acquire))
        else {
            request.fail(TransferStatus::Error);
            return;
        };

        let Some(sender) = self.sender.as_ref() else {
            request.fail(TransferStatus::NoDevice);
            return;
        };

        if let Err(e) = sender.send(Job { request, epoch }) {
            e.into_inner().request.fail(TransferStatus::NoDevice);
        }
    }

    fn cancel(&mut self, lane: usize) {
        if let Some(epoch) = self.cancel_epochs.get(lane) {
            epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn blocking_read(
        &mut self,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, BackendError> {
        let whole_frame = buffer.len() >= self.config.transfer_size(self.mode);
        let mut device = self.device();
        if let Some(idle) = device.last_read_end.map(|t| t.elapsed()) {
            device.host_idle(idle);
        }
        if whole_frame {
            device.pace();
        }

        match device.read(buffer) {
            (TransferStatus::Completed, read) => Ok(read),
            (TransferStatus::TimedOut, _) => Err(BackendError::Timeout),
            (TransferStatus::NoDevice, _) => Err(BackendError::NoDevice),
            (TransferStatus::Stall, _) => Err(BackendError::Stall),
            (status, _) => Err(BackendError::Io(format!("{status:?}"))),
        }
    }

    fn reconfigure(&mut self, mode: CaptureMode) -> Result<(), BackendError> {
        if !self.control.is_plugged() {
            return Err(BackendError::NoDevice);
        }

        self.mode = mode;
        let frame_size = self.config.frame_size(mode);
        self.device().stream.restart(frame_size);
        log::info!("sim device {} reconfigured to {mode:?}", self.config.serial);
        Ok(())
    }

    fn clear_halt(&mut self) -> Result<(), BackendError> {
        if !self.config.stall_clearable {
            return Err(BackendError::Io("endpoint halt could not be cleared".to_string()));
        }
        self.control.faults().halted = false;
        Ok(())
    }

    fn close(&mut self) {
        for epoch in self.cancel_epochs.iter() {
            epoch.fetch_add(1, Ordering::AcqRel);
        }

        // Ending the channel stops the event thread once the queue is empty
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::warn!("sim event thread panicked");
        }

        if self.control.is_opened() {
            self.control.set_opened(false);
            log::info!("closed simulated device {}", self.config.serial);
        }
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimDeviceConfig;
    use crossbeam::channel::bounded;

    fn open(config: SimDeviceConfig) -> (Arc<SimControl>, SimConnection) {
        let control = Arc::new(SimControl::default());
        let conn = SimConnection::open(config, control.clone());
        (control, conn)
    }

    fn submit(conn: &mut SimConnection, lane: usize, size: usize) -> Receiver<TransferResult> {
        let (tx, rx) = bounded(1);
        conn.submit_read(ReadRequest {
            lane,
            buffer: vec![0; size].into_boxed_slice(),
            size,
            callback: Box::new(move |result| {
                _ = tx.send(result);
            }),
        });
        rx
    }

    fn small_plain() -> SimDeviceConfig {
        SimDeviceConfig::plain("C")
            .with_frame_bytes(64)
            .with_audio_bytes(16)
            .with_frame_interval(Duration::ZERO)
    }

    #[test]
    fn test_async_reads_complete_in_order() {
        let (control, mut conn) = open(small_plain());
        let first = submit(&mut conn, 0, 64);
        let second = submit(&mut conn, 1, 64);

        let a = first.recv().unwrap();
        let b = second.recv().unwrap();
        assert_eq!(a.status, TransferStatus::Completed);
        assert_eq!(crate::plain_index_of(&a.buffer), Some(0));
        assert_eq!(crate::plain_index_of(&b.buffer), Some(1));
        assert_eq!(control.completed_transfers(), 2);
    }

    #[test]
    fn test_cancel_still_completes() {
        let config = small_plain().with_frame_interval(Duration::from_millis(30));
        let (_control, mut conn) = open(config);
        let first = submit(&mut conn, 0, 64);
        let second = submit(&mut conn, 1, 64);
        conn.cancel(1);

        assert_eq!(first.recv().unwrap().status, TransferStatus::Completed);
        assert_eq!(second.recv().unwrap().status, TransferStatus::Cancelled);
    }

    #[test]
    fn test_faults() {
        let (control, mut conn) = open(small_plain());

        control.inject_timeouts(1);
        assert_eq!(submit(&mut conn, 0, 64).recv().unwrap().status, TransferStatus::TimedOut);

        control.inject_short_reads(1);
        let short = submit(&mut conn, 0, 64).recv().unwrap();
        assert!(short.is_short());

        control.inject_stall();
        assert_eq!(submit(&mut conn, 0, 64).recv().unwrap().status, TransferStatus::Stall);
        conn.clear_halt().unwrap();
        assert_eq!(submit(&mut conn, 0, 64).recv().unwrap().status, TransferStatus::Completed);

        control.unplug();
        assert_eq!(submit(&mut conn, 0, 64).recv().unwrap().status, TransferStatus::NoDevice);
        let mut buffer = [0; 64];
        assert_eq!(
            conn.blocking_read(&mut buffer, Duration::from_millis(10)),
            Err(BackendError::NoDevice)
        );
    }

    #[test]
    fn test_unclearable_stall() {
        let (control, mut conn) = open(small_plain().with_stall_clearable(false));
        control.inject_stall();
        assert!(conn.clear_halt().is_err());
        assert!(control.is_halted());
    }

    #[test]
    fn test_close_fails_pending_and_later_reads() {
        let config = small_plain().with_frame_interval(Duration::from_millis(20));
        let (control, mut conn) = open(config);
        let pending: Vec<_> = (0..4).map(|lane| submit(&mut conn, lane, 64)).collect();
        conn.close();
        assert!(!control.is_opened());

        for rx in pending {
            let status = rx.recv().unwrap().status;
            assert!(matches!(status, TransferStatus::Completed | TransferStatus::Cancelled));
        }
        assert_eq!(submit(&mut conn, 0, 64).recv().unwrap().status, TransferStatus::NoDevice);
    }

    #[test]
    fn test_overrun_lands_on_next_frame() {
        let config = SimDeviceConfig::framed("F")
            .with_frame_bytes(1020)
            .with_audio_bytes(0)
            .with_frame_interval(Duration::ZERO)
            .with_overrun_after(Duration::from_millis(20));
        let size = config.transfer_size(CaptureMode::default());
        let (control, mut conn) = open(config);

        // drop the two header bytes of every packet
        let logical = |raw: &[u8]| -> Vec<u8> {
            raw.chunks(512).flat_map(|packet| packet[2..].to_vec()).collect()
        };

        let first = submit(&mut conn, 0, size).recv().unwrap();
        assert_eq!(crate::framed_index_of(&logical(&first.buffer[..])), Some(0));

        control.inject_shift(100);
        let shifted = submit(&mut conn, 0, size).recv().unwrap();
        assert_ne!(crate::framed_index_of(&logical(&shifted.buffer[..])), Some(1));

        std::thread::sleep(Duration::from_millis(40));
        let after = submit(&mut conn, 0, size).recv().unwrap();
        assert_eq!(crate::framed_index_of(&logical(&after.buffer[..])), Some(3));
    }

    #[test]
    fn test_lane_out_of_range() {
        let (_control, mut conn) = open(small_plain().with_max_lanes(2));
        assert_eq!(submit(&mut conn, 2, 64).recv().unwrap().status, TransferStatus::Error);
    }
}
