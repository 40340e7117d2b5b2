//! # Simulated Sensors
//!
//! Deterministic stand-ins for the four devices, used by `--simulate` and
//! whenever a hardware port cannot be opened. They exercise the same
//! channel logic as the real drivers, including the failure paths:
//!
//! - **GPS**: one valid `GPRMC` sentence per second, tracing a slow loop
//!   around a fixed base position
//! - **CO2**: a gentle wave around ambient, with the occasional zero reading
//!   an MH-Z19 gives while warming up
//! - **Dust**: a periodic reading that goes silent every few cycles until
//!   it is woken, which drives the particulate recovery sequence
//! - **Temperature**: a slow wave that now and then returns the disconnect
//!   code
//!
//! ## Model characteristics
//! All values are pure functions of a call counter or of clock time, so a
//! run against the manual clock is reproducible.

use crate::clock::Clock;
use crate::devices::SensorError;
use crate::nmea::sentence;
use crate::sensors::{Co2Sensor, ParticulateSensor, TemperatureProbe};
use crate::serial::SerialPort;
use crate::TEMPERATURE_SENTINEL;
use std::collections::VecDeque;
use tracing::debug;

/// Base position of the simulated receiver (decimal degrees).
const BASE_LAT: f64 = 7.1193;
const BASE_LON: f64 = -73.1227;

/// Radius of the loop traced around the base, in degrees.
const WANDER_DEG: f64 = 0.0005;

/// Period of one loop, in seconds.
const WANDER_PERIOD_S: f64 = 600.0;

/// GPS receiver emitting one `GPRMC` sentence per second of `clock` time.
pub struct SimulatedGps<C> {
    clock: C,
    pending: VecDeque<u8>,
    next_emit_ms: u64,
}

impl<C: Clock> SimulatedGps<C> {
    pub fn new(clock: C) -> Self {
        let next_emit_ms = clock.now_ms();
        Self {
            clock,
            pending: VecDeque::new(),
            next_emit_ms,
        }
    }

    fn emit_due(&mut self) {
        let now = self.clock.now_ms();
        if now < self.next_emit_ms {
            return;
        }
        // a starved reader gets only the latest sentence, as from a real
        // receiver whose UART buffer overflowed
        self.next_emit_ms = now - now % 1000 + 1000;
        self.pending.clear();
        self.pending
            .extend(rmc_sentence(self.clock.utc_now(), now).into_bytes());
    }
}

fn format_coordinate(value: f64, degree_digits: usize) -> String {
    let magnitude = value.abs();
    let degrees = magnitude.trunc();
    let minutes = (magnitude - degrees) * 60.0;
    format!(
        "{:0width$}{:07.4}",
        degrees as u32,
        minutes,
        width = degree_digits
    )
}

/// Simulated position at `elapsed_ms`.
pub fn simulated_position(elapsed_ms: u64) -> (f64, f64) {
    let angle = (elapsed_ms as f64 / 1000.0) / WANDER_PERIOD_S * std::f64::consts::TAU;
    (
        BASE_LAT + WANDER_DEG * angle.sin(),
        BASE_LON + WANDER_DEG * angle.cos(),
    )
}

fn rmc_sentence(at: chrono::DateTime<chrono::Utc>, elapsed_ms: u64) -> String {
    let (lat, lon) = simulated_position(elapsed_ms);
    let body = format!(
        "GPRMC,{},A,{},{},{},{},0.02,,{},,,A",
        at.format("%H%M%S.00"),
        format_coordinate(lat, 2),
        if lat >= 0.0 { 'N' } else { 'S' },
        format_coordinate(lon, 3),
        if lon >= 0.0 { 'E' } else { 'W' },
        at.format("%d%m%y"),
    );
    sentence(&body)
}

impl<C: Clock> SerialPort for SimulatedGps<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
        self.emit_due();
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, _data: &[u8]) -> Result<(), SensorError> {
        Ok(())
    }
}

/// CO2 source. Every `WARMUP_EVERY`th reading is the zero a warming sensor
/// reports.
#[derive(Default)]
pub struct SimulatedCo2 {
    reads: u32,
}

impl SimulatedCo2 {
    const WARMUP_EVERY: u32 = 17;
}

impl Co2Sensor for SimulatedCo2 {
    fn read_ppm(&mut self, _clock: &mut dyn Clock) -> Result<i32, SensorError> {
        self.reads += 1;
        if self.reads % Self::WARMUP_EVERY == 0 {
            return Ok(0);
        }
        let wave = (f64::from(self.reads) * 0.3).sin() * 35.0;
        Ok(430 + wave.round() as i32)
    }
}

/// Dust source that goes silent after every `SILENT_AFTER` readings and
/// stays silent until woken.
#[derive(Default)]
pub struct SimulatedDust {
    reads: u32,
    asleep: bool,
}

impl SimulatedDust {
    const SILENT_AFTER: u32 = 5;
}

impl ParticulateSensor for SimulatedDust {
    fn read_pm25(&mut self, timeout_ms: u64, clock: &mut dyn Clock) -> Result<f64, SensorError> {
        if self.asleep {
            clock.delay_ms(timeout_ms);
            return Err(SensorError::Timeout(timeout_ms));
        }
        self.reads += 1;
        if self.reads % Self::SILENT_AFTER == 0 {
            debug!("simulated dust sensor going silent");
            self.asleep = true;
        }
        let wave = (f64::from(self.reads) * 0.7).sin() * 4.0;
        Ok(((12.0 + wave) * 10.0).round() / 10.0)
    }

    fn wake(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
        self.asleep = false;
        Ok(())
    }

    fn set_active_reporting(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
        Ok(())
    }

    fn set_continuous_mode(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
        Ok(())
    }
}

/// Temperature probe. Every `DISCONNECT_EVERY`th read answers with the
/// disconnect code.
#[derive(Default)]
pub struct SimulatedProbe {
    reads: u32,
    resolution: u8,
}

impl SimulatedProbe {
    const DISCONNECT_EVERY: u32 = 7;

    pub fn resolution(&self) -> u8 {
        self.resolution
    }
}

impl TemperatureProbe for SimulatedProbe {
    fn set_resolution(&mut self, bits: u8) -> Result<(), SensorError> {
        self.resolution = bits;
        Ok(())
    }

    fn request_conversion(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        self.reads += 1;
        if self.reads % Self::DISCONNECT_EVERY == 0 {
            return Ok(TEMPERATURE_SENTINEL);
        }
        let wave = (f64::from(self.reads) * 0.05).sin() * 1.5;
        // 12-bit resolution steps
        Ok(((24.0 + wave) * 16.0).round() / 16.0)
    }
}
