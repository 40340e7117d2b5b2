//! Sensor channels.
//!
//! A channel wraps one device capability and applies that sensor's validity
//! policy, always answering a poll with a [`Reading`]. The channels share
//! nothing beyond the [`SensorChannel`] contract; each one is tested with a
//! fake implementing its capability trait.

pub mod gas;
pub mod particulate;
pub mod position;
pub mod temperature;

pub use gas::GasChannel;
pub use particulate::{ParticulateChannel, ParticulatePolicy};
pub use position::PositionChannel;
pub use temperature::TemperatureChannel;

use crate::clock::Clock;
use crate::devices::SensorError;
use crate::{Reading, SensorKind};

pub trait SensorChannel {
    fn kind(&self) -> SensorKind;

    /// Produce one reading. Failures yield the sentinel reading for
    /// [`kind`](Self::kind), never an error.
    fn poll(&mut self, clock: &mut dyn Clock) -> Reading;

    /// Background work that must run every scheduler tick regardless of
    /// the publish cadence. Most channels have none.
    fn service(&mut self, _clock: &mut dyn Clock) {}
}

/// One-shot CO2 concentration read, in ppm. Device error codes surface as
/// `Err` or as out-of-range values.
pub trait Co2Sensor {
    fn read_ppm(&mut self, clock: &mut dyn Clock) -> Result<i32, SensorError>;
}

/// Duty-cycled particulate sensor.
pub trait ParticulateSensor {
    /// Wait at most `timeout_ms` for a PM2.5 value in µg/m³.
    fn read_pm25(&mut self, timeout_ms: u64, clock: &mut dyn Clock) -> Result<f64, SensorError>;

    fn wake(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError>;

    fn set_active_reporting(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError>;

    fn set_continuous_mode(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError>;
}

/// Digital temperature probe with a request/read conversion cycle.
pub trait TemperatureProbe {
    fn set_resolution(&mut self, bits: u8) -> Result<(), SensorError>;

    /// Time the probe needs after [`request_conversion`](Self::request_conversion)
    /// at `bits` resolution.
    fn conversion_time_ms(&self, bits: u8) -> u64 {
        // 93.75 ms at 9 bits, doubling per extra bit
        750 >> (12 - bits.clamp(9, 12))
    }

    fn request_conversion(&mut self) -> Result<(), SensorError>;

    /// Degrees Celsius. A disconnected probe may answer with its disconnect
    /// code (−127) rather than an error.
    fn read_celsius(&mut self) -> Result<f64, SensorError>;
}
