//! CO2 channel: one synchronous read per cycle, no retry.

use crate::clock::Clock;
use crate::sensors::{Co2Sensor, SensorChannel};
use crate::{Reading, SensorKind};
use tracing::{debug, warn};

/// Exclusive bounds of a plausible concentration, in ppm.
pub const MIN_PPM: i32 = 0;
pub const MAX_PPM: i32 = 10_000;

pub struct GasChannel<S> {
    sensor: S,
}

impl<S: Co2Sensor> GasChannel<S> {
    pub fn new(sensor: S) -> Self {
        Self { sensor }
    }
}

impl<S: Co2Sensor> SensorChannel for GasChannel<S> {
    fn kind(&self) -> SensorKind {
        SensorKind::GasConcentration
    }

    fn poll(&mut self, clock: &mut dyn Clock) -> Reading {
        match self.sensor.read_ppm(clock) {
            Ok(ppm) if ppm > MIN_PPM && ppm < MAX_PPM => {
                debug!(ppm, "co2 read");
                Reading::scalar(SensorKind::GasConcentration, f64::from(ppm))
            }
            Ok(ppm) => {
                warn!(ppm, "co2 reading out of range");
                Reading::invalid(SensorKind::GasConcentration)
            }
            Err(e) => {
                warn!(error = %e, "co2 read failed");
                Reading::invalid(SensorKind::GasConcentration)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::devices::SensorError;
    use crate::SENTINEL;

    struct FixedCo2(Result<i32, SensorError>, u32);

    impl Co2Sensor for FixedCo2 {
        fn read_ppm(&mut self, _clock: &mut dyn Clock) -> Result<i32, SensorError> {
            self.1 += 1;
            self.0.clone()
        }
    }

    fn poll(result: Result<i32, SensorError>) -> Reading {
        GasChannel::new(FixedCo2(result, 0)).poll(&mut ManualClock::new())
    }

    #[test]
    fn accepts_values_inside_band() {
        let reading = poll(Ok(412));
        assert!(reading.valid);
        assert_eq!(reading.scalar_value(), 412.0);
        assert!(poll(Ok(1)).valid);
        assert!(poll(Ok(9_999)).valid);
    }

    #[test]
    fn band_edges_and_error_codes_are_sentinel() {
        for ppm in [0, 10_000, 65_535, -1, -2] {
            let reading = poll(Ok(ppm));
            assert!(!reading.valid, "{ppm} should be rejected");
            assert_eq!(reading.scalar_value(), SENTINEL);
        }
    }

    #[test]
    fn driver_error_is_sentinel_without_retry() {
        let mut channel = GasChannel::new(FixedCo2(Err(SensorError::Timeout(500)), 0));
        let reading = channel.poll(&mut ManualClock::new());
        assert!(!reading.valid);
        assert_eq!(reading.scalar_value(), SENTINEL);
        assert_eq!(channel.sensor.1, 1);
    }
}
