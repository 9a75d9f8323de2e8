use anyhow::{Context, Result};
use capture_device_sim::SimDeviceConfig;
use capture_engine::{CaptureSpeed, EngineConfig, ResyncPolicy};
use log::debug;
use once_cell::sync::Lazy;
use platform_dirs::AppDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const APP_NAME: &str = "capture-cli";

static DEFAULT_CONFIG_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    AppDirs::new(Some(APP_NAME), true).map(|dirs| dirs.config_dir.join(format!("{APP_NAME}.toml")))
});

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Config {
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub engine: Engine,

    #[serde(default)]
    pub device: Device,
}

#[derive(Serialize, Deserialize, Debug, Clone, Derivative)]
#[derivative(Default)]
#[serde(default)]
pub struct Engine {
    #[derivative(Default(value = "capture_engine::DEFAULT_WRITER_LANES"))]
    pub writer_lanes: usize,

    #[derivative(Default(value = "capture_engine::DEFAULT_BASE_RATE"))]
    pub base_rate: f64,

    #[derivative(Default(value = "capture_engine::FIX_PARTIAL_FIRST_FRAME_NUM"))]
    pub cooldown_initial: u32,

    #[derivative(Default(value = "8"))]
    pub max_consecutive_timeouts: u32,

    #[derivative(Default(value = "500"))]
    pub drain_timeout_ms: u64,

    #[derivative(Default(value = "50"))]
    pub resync_after_ms: u64,

    #[derivative(Default(value = "2000"))]
    pub resync_timeout_ms: u64,

    pub resync_policy: ResyncPolicy,

    /// Consumer pacing of slowed down IS Nitro captures
    pub capture_speed: CaptureSpeed,
}

impl Engine {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_writer_lanes(self.writer_lanes)
            .with_base_rate(self.base_rate)
            .with_cooldown_initial(self.cooldown_initial)
            .with_max_consecutive_timeouts(self.max_consecutive_timeouts)
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .with_resync_after(Duration::from_millis(self.resync_after_ms))
            .with_resync_timeout(Duration::from_millis(self.resync_timeout_ms))
            .with_resync_policy(self.resync_policy)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Derivative)]
#[derivative(Default)]
#[serde(default)]
pub struct Device {
    #[derivative(Default(value = "\"SIM-0\".to_string()"))]
    pub serial: String,

    /// Old DS adapter with a framed stream instead of a 3DS adapter
    pub framed: bool,

    #[derivative(Default(value = "16715"))]
    pub frame_interval_us: u64,

    pub seed: u64,

    pub shift_every: Option<u64>,

    #[derivative(Default(value = "true"))]
    pub stall_clearable: bool,
}

impl Device {
    pub fn sim_config(&self) -> SimDeviceConfig {
        let config = if self.framed {
            SimDeviceConfig::framed(self.serial.clone())
        } else {
            SimDeviceConfig::plain(self.serial.clone())
        }
        .with_frame_interval(Duration::from_micros(self.frame_interval_us))
        .with_seed(self.seed)
        .with_stall_clearable(self.stall_clearable);

        match self.shift_every {
            Some(every) => config.with_shift_every(every),
            None => config,
        }
    }
}

/// Load the config at `path`, or at the default location.
///
/// A missing default config is created with default values. A missing
/// explicit config is an error.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (
            DEFAULT_CONFIG_PATH
                .clone()
                .context("no platform config directory")?,
            false,
        ),
    };

    let mut config = match fs::read_to_string(&path) {
        Ok(text) => toml::from_str::<Config>(&text)
            .with_context(|| format!("parse {} failed", path.display()))?,
        Err(e) if explicit => {
            return Err(e).with_context(|| format!("read {} failed", path.display()));
        }
        Err(_) => {
            let config = Config::default();
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, toml::to_string_pretty(&config)?)
                .with_context(|| format!("save {} failed", path.display()))?;
            config
        }
    };

    config.config_path = path;
    debug!("{config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        fs::write(&path, "[engine]\nwriter_lanes = 4\n\n[device]\nframed = true\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.config_path, path);
        assert_eq!(config.engine.writer_lanes, 4);
        assert_eq!(config.engine.cooldown_initial, 3);
        assert_eq!(config.engine.capture_speed, CaptureSpeed::Full);
        assert!(config.device.framed);
        assert_eq!(config.device.serial, "SIM-0");

        let engine = config.engine.engine_config();
        assert_eq!(engine.writer_lanes, 4);
        assert!(engine.validate().is_ok());
        assert!(config.device.sim_config().framing().is_some());
    }

    #[test]
    fn test_missing_or_broken_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("broken.toml");
        fs::write(&path, "[engine\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn test_capture_speed_is_lowercase() {
        let config: Config = toml::from_str("[engine]\ncapture_speed = \"quarter\"\n").unwrap();
        assert_eq!(config.engine.capture_speed, CaptureSpeed::Quarter);
        assert!(toml::from_str::<Config>("[engine]\ncapture_speed = \"Quarter\"\n").is_err());
    }

    #[test]
    fn test_defaults_round_trip() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.engine.resync_after_ms, 50);
        assert_eq!(config.device.frame_interval_us, 16715);
        assert!(config.device.shift_every.is_none());
    }
}
