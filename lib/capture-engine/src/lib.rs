mod capture_status;
mod config;
mod engine;
mod error;
mod frame_pool;
mod multi_timed_signal;
mod orchestrator;
mod stream_sync;
mod timed_signal;

pub use capture_status::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use frame_pool::*;
pub use multi_timed_signal::*;
pub use orchestrator::*;
pub use stream_sync::*;
pub use timed_signal::*;

pub use capture_device;
