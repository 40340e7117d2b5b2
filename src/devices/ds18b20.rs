//! DS18B20 probe through the Linux `w1-therm` driver.
//!
//! The kernel exposes each probe as `/sys/bus/w1/devices/28-*/` with a
//! `w1_slave` file:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! Reading the file performs the conversion, so this driver reports a zero
//! conversion time and `request_conversion` is a no-op.

use crate::devices::SensorError;
use crate::sensors::TemperatureProbe;
use crate::TEMPERATURE_SENTINEL;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

pub struct W1Probe {
    dir: PathBuf,
}

impl W1Probe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Parse the two-line `w1_slave` dump into degrees Celsius.
pub(crate) fn parse_w1_slave(text: &str) -> Result<f64, SensorError> {
    let mut lines = text.lines();
    let crc_line = lines.next().ok_or(SensorError::Disconnected)?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::Checksum);
    }
    let data_line = lines.next().ok_or(SensorError::Disconnected)?;
    let raw = data_line
        .split("t=")
        .nth(1)
        .ok_or_else(|| SensorError::Frame(data_line.to_string()))?;
    let millis: i32 = raw
        .trim()
        .parse()
        .map_err(|_| SensorError::Frame(data_line.to_string()))?;
    Ok(f64::from(millis) / 1000.0)
}

impl TemperatureProbe for W1Probe {
    fn set_resolution(&mut self, bits: u8) -> Result<(), SensorError> {
        fs::write(self.dir.join("resolution"), bits.to_string())?;
        Ok(())
    }

    fn conversion_time_ms(&self, _bits: u8) -> u64 {
        0
    }

    fn request_conversion(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        match fs::read_to_string(self.dir.join("w1_slave")) {
            Ok(text) => parse_w1_slave(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TEMPERATURE_SENTINEL),
            Err(e) => Err(e.into()),
        }
    }
}
