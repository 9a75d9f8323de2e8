//! Simulated capture devices for tests and demos.

mod backend;
mod config;
mod connection;
mod control;
mod stream;

pub use backend::SimBackend;
pub use config::{SimDeviceConfig, SimKind};
pub use connection::SimConnection;
pub use control::SimControl;
pub use stream::{PACKET_HEADER, framed_index_of, payload_length_of, plain_index_of};
