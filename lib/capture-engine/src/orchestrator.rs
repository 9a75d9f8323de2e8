use crate::{
    AcquisitionEngine, CaptureContext, CaptureError, CaptureSpeed, ControlCommand, EngineConfig,
    StatusSnapshot,
};
use capture_device::{CaptureBackend, CaptureConnection, CaptureMode, DeviceDescriptor};
use crossbeam::channel::{Receiver, Sender, unbounded};
use log::{info, warn};
use spin_sleep::SpinSleeper;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which of the enumerated devices `connect` should open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The only device present
    #[default]
    Auto,
    Index(usize),
    Serial(String),
}

/// Owns the backends and the session context. Drives connect, stream and
/// close cycles on the capture thread while other threads use the control
/// methods.
pub struct CaptureOrchestrator {
    backends: Mutex<Vec<Box<dyn CaptureBackend>>>,
    pending: Mutex<Option<Box<dyn CaptureConnection>>>,
    engine: AcquisitionEngine,
    config: EngineConfig,
    control_tx: Sender<ControlCommand>,
    control_rx: Receiver<ControlCommand>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CaptureOrchestrator {
    pub fn new(
        backends: Vec<Box<dyn CaptureBackend>>,
        config: EngineConfig,
    ) -> Result<Self, CaptureError> {
        config.validate()?;

        let slot_capacity = backends
            .iter()
            .map(|b| b.max_transfer_size())
            .max()
            .unwrap_or_default();
        let context = CaptureContext::new(&config, slot_capacity);
        let (control_tx, control_rx) = unbounded();

        info!(
            "capture orchestrator with {} backends, {} slots of {slot_capacity} bytes",
            backends.len(),
            config.slots()
        );

        Ok(Self {
            backends: Mutex::new(backends),
            pending: Mutex::new(None),
            engine: AcquisitionEngine::new(context, config.clone()),
            config,
            control_tx,
            control_rx,
        })
    }

    /// Shared state for the consumers.
    pub fn context(&self) -> Arc<CaptureContext> {
        self.engine.context().clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.engine.context().status.snapshot()
    }

    /// Devices of every backend. A backend that fails to enumerate is
    /// skipped.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.candidates()
            .into_iter()
            .map(|(_, device)| device)
            .collect()
    }

    fn candidates(&self) -> Vec<(usize, DeviceDescriptor)> {
        let mut backends = lock(&self.backends);
        let mut candidates = vec![];

        for (index, backend) in backends.iter_mut().enumerate() {
            match backend.list_devices() {
                Ok(devices) => candidates.extend(devices.into_iter().map(|d| (index, d))),
                Err(e) => warn!("{}: listing devices failed: {e}", backend.name()),
            }
        }

        candidates
    }

    pub fn connect(&self, selector: DeviceSelector) -> Result<DeviceDescriptor, CaptureError> {
        let status = &self.engine.context().status;
        if status.is_connected() {
            return Err(CaptureError::AlreadyConnected);
        }
        if !status.close_success() {
            return Err(CaptureError::PreviousStillClosing);
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(CaptureError::NoDeviceFound);
        }

        let chosen = match &selector {
            DeviceSelector::Auto if candidates.len() == 1 => 0,
            DeviceSelector::Auto => {
                return Err(CaptureError::NeedsSelection(
                    candidates.into_iter().map(|(_, d)| d).collect(),
                ));
            }
            DeviceSelector::Index(index) if *index < candidates.len() => *index,
            DeviceSelector::Index(index) => {
                return Err(CaptureError::InvalidSelection(format!(
                    "index {index} of {} devices",
                    candidates.len()
                )));
            }
            DeviceSelector::Serial(serial) => candidates
                .iter()
                .position(|(_, d)| &d.serial == serial)
                .ok_or_else(|| CaptureError::InvalidSelection(format!("serial {serial}")))?,
        };

        let (backend, device) = &candidates[chosen];
        let conn = lock(&self.backends)[*backend].open(device)?;
        let descriptor = conn.descriptor().clone();

        status.set_device(Some(descriptor.clone()));
        status.set_mode(CaptureMode::default());
        status.clear_consumer_signals();
        status.reset_cooldown();
        while self.control_rx.try_recv().is_ok() {}

        *lock(&self.pending) = Some(conn);
        status.set_connected(true);

        info!("connected to {}", descriptor.long_name);
        Ok(descriptor)
    }

    /// Switch the capture mode of the open connection.
    pub fn request_reconfigure(&self, mode: CaptureMode) -> Result<(), CaptureError> {
        self.send(ControlCommand::Reconfigure(mode))
    }

    /// Stretch the consumer waits of slowed down IS Nitro captures. Kept
    /// across connections.
    pub fn set_capture_speed(&self, speed: CaptureSpeed) {
        info!("capture speed {speed}");
        self.engine.context().status.set_capture_speed(speed);
    }

    pub fn disconnect(&self) -> Result<(), CaptureError> {
        self.send(ControlCommand::Disconnect)
    }

    fn send(&self, command: ControlCommand) -> Result<(), CaptureError> {
        if !self.engine.context().status.is_connected() {
            return Err(CaptureError::NotConnected);
        }
        self.control_tx
            .send(command)
            .map_err(|e| CaptureError::Other(e.to_string()))
    }

    /// End the session. `run` returns after the current connection closed.
    pub fn stop(&self) {
        let status = &self.engine.context().status;
        status.set_running(false);
        status.wake_consumers();
    }

    /// Capture loop. Blocks until [`Self::stop`].
    pub fn run(&self) {
        let status = &self.engine.context().status;
        let sleeper = SpinSleeper::default();
        info!("capture loop started");

        while status.is_running() {
            if !status.is_connected() {
                sleeper.sleep(self.config.poll_interval);
                continue;
            }

            let Some(mut conn) = lock(&self.pending).take() else {
                warn!("connected without an open device");
                status.set_connected(false);
                continue;
            };

            let result = self
                .engine
                .run_until_disconnect(conn.as_mut(), &self.control_rx);

            status.set_close_success(false);
            status.set_connected(false);
            status.reset_cooldown();
            status.wake_consumers();

            match result {
                Ok(()) => info!("disconnected from {}", conn.descriptor().long_name),
                Err(e) => {
                    warn!("{}: {e}", conn.descriptor().long_name);
                    status.set_error_text(e.to_string());
                }
            }

            conn.close();
            status.set_device(None);
            status.set_close_success(true);
        }

        if let Some(mut conn) = lock(&self.pending).take() {
            conn.close();
        }
        status.set_connected(false);
        info!("capture loop exit");
    }
}
