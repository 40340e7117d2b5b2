//! # AQ Node Core Library
//!
//! This library provides the acquisition-and-publish pipeline for a small
//! air-quality node: a Raspberry Pi class board with a GPS receiver, an
//! MH-Z19 CO2 sensor, an SDS011 particulate sensor and a DS18B20 probe,
//! publishing one JSON message every ten seconds to an MQTT broker.
//!
//! ## Design Philosophy
//!
//! ### Single-threaded cooperative execution
//! Everything but the portal's HTTP server runs on one thread, and the
//! portal only queues requests for that thread. The [`scheduler::Scheduler`] owns every
//! piece of mutable state (link state, location label, last publish time)
//! and passes it explicitly to the component it calls. "Blocking" waits are
//! bounded and go through the [`clock::Clock`] capability so tests can run
//! them in virtual time.
//!
//! ### Fixed-shape data
//! - **Sentinels, not omissions**: a failed channel still produces a value
//!   ([`SENTINEL`] or [`TEMPERATURE_SENTINEL`]) so every message has the
//!   same five metrics in the same order
//! - **Bounded buffers**: the encode buffer is allocated once and reused,
//!   per-cycle records live on the stack
//!
//! ### Data Flow
//! 1. **Tick**: portal → link check → link service → stream feed
//! 2. **Every 10 s**: poll channels → [`Record`] → JSON → `device/messages`
//! 3. **On (re)connect**: retained `online` birth on `device/status`, with a
//!    retained `offline` last will registered at the broker
//!
//! ## Core Types
//! - [`Reading`]: what one channel returns for one poll
//! - [`Record`]: the five ordered measurements of one publish cycle

use serde::Serialize;

// Module declarations
pub mod aggregator;
pub mod clock;
pub mod config;
pub mod devices;
pub mod link;
pub mod message;
pub mod mqtt;
pub mod network;
pub mod nmea;
pub mod portal;
pub mod scheduler;
pub mod sensors;
pub mod serial;
pub mod simulated;
pub mod store;

#[cfg(test)]
mod tests;

/// Sentinel for an invalid scalar metric or coordinate.
pub const SENTINEL: f64 = -1.0;

/// Sentinel for an invalid temperature. Matches the disconnect code the
/// DS18B20 family reports, which is why it differs from [`SENTINEL`].
pub const TEMPERATURE_SENTINEL: f64 = -127.0;

/// Topic that carries the measurement messages.
pub const MESSAGE_TOPIC: &str = "device/messages";

/// Topic that carries the retained online/offline status.
pub const STATUS_TOPIC: &str = "device/status";

/// The four sensor channels, in the order they are polled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorKind {
    Position,
    GasConcentration,
    Particulate,
    Temperature,
}

impl SensorKind {
    pub fn label(self) -> &'static str {
        match self {
            SensorKind::Position => "position",
            SensorKind::GasConcentration => "co2",
            SensorKind::Particulate => "pm2.5",
            SensorKind::Temperature => "temperature",
        }
    }
}

/// Value carried by a [`Reading`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReadingValue {
    Scalar(f64),
    Coordinates { lat: f64, lon: f64 },
}

/// Result of polling one sensor channel.
///
/// An invalid reading always carries the sentinel for its kind; it is never
/// dropped.
///
/// # Example
/// ```
/// use aq_node_lib::{Reading, ReadingValue, SensorKind};
///
/// let bad = Reading::invalid(SensorKind::Position);
/// assert!(!bad.valid);
/// assert_eq!(bad.value, ReadingValue::Coordinates { lat: -1.0, lon: -1.0 });
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    pub value: ReadingValue,
    pub valid: bool,
}

impl Reading {
    pub fn scalar(kind: SensorKind, value: f64) -> Self {
        Reading {
            kind,
            value: ReadingValue::Scalar(value),
            valid: true,
        }
    }

    pub fn position(lat: f64, lon: f64) -> Self {
        Reading {
            kind: SensorKind::Position,
            value: ReadingValue::Coordinates { lat, lon },
            valid: true,
        }
    }

    /// Sentinel reading for `kind`.
    pub fn invalid(kind: SensorKind) -> Self {
        let value = match kind {
            SensorKind::Position => ReadingValue::Coordinates {
                lat: SENTINEL,
                lon: SENTINEL,
            },
            SensorKind::Temperature => ReadingValue::Scalar(TEMPERATURE_SENTINEL),
            SensorKind::GasConcentration | SensorKind::Particulate => {
                ReadingValue::Scalar(SENTINEL)
            }
        };
        Reading {
            kind,
            value,
            valid: false,
        }
    }

    /// Scalar value, or the first coordinate for a position reading.
    pub fn scalar_value(&self) -> f64 {
        match self.value {
            ReadingValue::Scalar(v) => v,
            ReadingValue::Coordinates { lat, .. } => lat,
        }
    }

    /// Coordinates, or the sentinel pair for a scalar reading.
    pub fn coordinates(&self) -> (f64, f64) {
        match self.value {
            ReadingValue::Coordinates { lat, lon } => (lat, lon),
            ReadingValue::Scalar(_) => (SENTINEL, SENTINEL),
        }
    }
}

/// One named measurement of a [`Record`]. Serializes as
/// `{"measurement": name, "value": value}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(rename = "measurement")]
    pub name: &'static str,
    pub value: f64,
}

/// Wire names of the five measurements, in wire order.
pub const MEASUREMENT_NAMES: [&str; 5] = ["CO2", "PM2.5", "Temperature", "Lat", "Lon"];

/// The five measurements of one publish cycle, in wire order.
///
/// Consumers rely on the order, so it is fixed by construction rather than
/// by the order channels were polled in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    measurements: [Measurement; 5],
}

impl Record {
    pub fn new(co2: f64, pm25: f64, temperature: f64, lat: f64, lon: f64) -> Self {
        let values = [co2, pm25, temperature, lat, lon];
        let mut measurements = [Measurement {
            name: MEASUREMENT_NAMES[0],
            value: 0.0,
        }; 5];
        for (slot, (name, value)) in measurements
            .iter_mut()
            .zip(MEASUREMENT_NAMES.into_iter().zip(values))
        {
            *slot = Measurement { name, value };
        }
        Record { measurements }
    }

    pub fn measurements(&self) -> &[Measurement; 5] {
        &self.measurements
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.measurements
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value)
    }
}
