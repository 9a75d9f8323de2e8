use crate::{SimConnection, SimControl, SimDeviceConfig};
use capture_device::{BackendError, CaptureBackend, CaptureConnection, DeviceDescriptor};
use std::sync::Arc;

struct SimEntry {
    config: SimDeviceConfig,
    control: Arc<SimControl>,
}

/// Backend serving a fixed set of simulated devices.
pub struct SimBackend {
    devices: Vec<SimEntry>,
}

impl SimBackend {
    pub fn new(configs: Vec<SimDeviceConfig>) -> Self {
        let devices = configs
            .into_iter()
            .map(|config| SimEntry {
                config,
                control: Arc::new(SimControl::default()),
            })
            .collect();

        Self { devices }
    }

    pub fn control(&self, serial: &str) -> Option<Arc<SimControl>> {
        self.devices
            .iter()
            .find(|entry| entry.config.serial == serial)
            .map(|entry| entry.control.clone())
    }
}

impl CaptureBackend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn max_transfer_size(&self) -> usize {
        self.devices
            .iter()
            .map(|entry| entry.config.max_transfer_size())
            .max()
            .unwrap_or_default()
    }

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError> {
        Ok(self
            .devices
            .iter()
            .filter(|entry| entry.control.is_plugged())
            .map(|entry| entry.config.descriptor())
            .collect())
    }

    fn open(
        &mut self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn CaptureConnection>, BackendError> {
        let entry = self
            .devices
            .iter()
            .find(|entry| entry.config.serial == descriptor.serial)
            .ok_or(BackendError::NoDevice)?;

        if !entry.control.is_plugged() {
            return Err(BackendError::NoDevice);
        }

        if entry.control.is_opened() {
            return Err(BackendError::Open(format!(
                "{} is already open",
                descriptor.serial
            )));
        }

        Ok(Box::new(SimConnection::open(
            entry.config.clone(),
            entry.control.clone(),
        )))
    }
}
