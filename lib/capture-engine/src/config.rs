use crate::{CaptureError, frame_pool::min_pool_slots, timed_signal::DEFAULT_BASE_RATE};
use derivative::Derivative;
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WRITER_LANES: usize = 8;
pub const MAX_WRITER_LANES: usize = 16;
pub const FIX_PARTIAL_FIRST_FRAME_NUM: u32 = 3;

/// What to do when a framed stream loses alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncPolicy {
    /// Read and discard up to the next frame boundary
    Scan,

    /// Wait a little and hope the next reads land on a boundary
    SleepAndGuess,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            ResyncPolicy::SleepAndGuess
        } else {
            ResyncPolicy::Scan
        }
    }
}

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
pub struct EngineConfig {
    /// Concurrently outstanding reads, capped by what the device allows
    #[derivative(Default(value = "DEFAULT_WRITER_LANES"))]
    pub writer_lanes: usize,

    /// Pool size, `None` for the minimum the lane count needs
    #[setters(strip_option)]
    pub pool_slots: Option<usize>,

    /// Rate the consumer wait time is derived from
    #[derivative(Default(value = "DEFAULT_BASE_RATE"))]
    pub base_rate: f64,

    /// Frames flagged as discard candidates after (re)connect or reconfigure
    #[derivative(Default(value = "FIX_PARTIAL_FIRST_FRAME_NUM"))]
    pub cooldown_initial: u32,

    /// Timeouts in a row tolerated before the device counts as gone
    #[derivative(Default(value = "8"))]
    pub max_consecutive_timeouts: u32,

    /// Timeout of a single blocking read
    #[derivative(Default(value = "Duration::from_millis(500)"))]
    pub read_timeout: Duration,

    /// Bound on waiting for outstanding reads to come back
    #[derivative(Default(value = "Duration::from_millis(500)"))]
    pub drain_timeout: Duration,

    /// Misalignment that lasts longer than this triggers a hard resync
    #[derivative(Default(value = "Duration::from_millis(50)"))]
    pub resync_after: Duration,

    /// Timeout of each direct read while resyncing
    #[derivative(Default(value = "Duration::from_millis(50)"))]
    pub resync_read_timeout: Duration,

    /// Bound on one whole hard resync
    #[derivative(Default(value = "Duration::from_secs(2)"))]
    pub resync_timeout: Duration,

    pub resync_policy: ResyncPolicy,

    /// Sleep between checks while no device is connected
    #[derivative(Default(value = "Duration::from_millis(1)"))]
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots(&self) -> usize {
        self.pool_slots
            .unwrap_or_else(|| min_pool_slots(self.writer_lanes))
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.writer_lanes == 0 || self.writer_lanes > MAX_WRITER_LANES {
            return Err(CaptureError::InvalidConfig(format!(
                "writer lanes must be within 1..={MAX_WRITER_LANES}, got {}",
                self.writer_lanes
            )));
        }

        let min_slots = min_pool_slots(self.writer_lanes);
        if self.slots() < min_slots {
            return Err(CaptureError::InvalidConfig(format!(
                "{} lanes need at least {min_slots} pool slots, got {}",
                self.writer_lanes,
                self.slots()
            )));
        }

        if self.base_rate.is_nan() || self.base_rate <= 0.0 {
            return Err(CaptureError::InvalidConfig(format!(
                "base rate must be positive, got {}",
                self.base_rate
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.writer_lanes, 8);
        assert_eq!(config.slots(), 11);
        assert_eq!(config.cooldown_initial, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_follows_lanes() {
        let config = EngineConfig::new().with_writer_lanes(5);
        assert_eq!(config.slots(), 8);
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::new().with_writer_lanes(0).validate().is_err());
        assert!(EngineConfig::new().with_writer_lanes(17).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_writer_lanes(4)
                .with_pool_slots(6)
                .validate()
                .is_err()
        );
        assert!(EngineConfig::new().with_base_rate(0.0).validate().is_err());
        assert!(EngineConfig::new().with_base_rate(f64::NAN).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_writer_lanes(1)
                .with_pool_slots(8)
                .validate()
                .is_ok()
        );
    }
}
