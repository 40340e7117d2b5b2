//! Sensor device protocols.
//!
//! Each driver implements one of the capability traits in
//! [`sensors`](crate::sensors) and knows nothing about validity policy:
//! it reports what the device said, or why it could not say anything.

pub mod ds18b20;
pub mod mhz19;
pub mod sds011;

pub use ds18b20::W1Probe;
pub use mhz19::Mhz19;
pub use sds011::Sds011;

use thiserror::Error;

/// Errors that can occur while talking to a sensor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// No complete reply within the protocol timeout
    #[error("no reply within {0} ms")]
    Timeout(u64),

    /// Reply arrived but its checksum did not match
    #[error("checksum mismatch")]
    Checksum,

    /// Reply arrived but was not the frame we asked for
    #[error("unexpected frame: {0}")]
    Frame(String),

    /// Probe is not wired or not enumerated
    #[error("device disconnected")]
    Disconnected,

    #[error("device IO: {0}")]
    Io(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for SensorError {
    fn from(e: std::io::Error) -> Self {
        SensorError::Io(e.to_string())
    }
}
