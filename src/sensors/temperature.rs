//! Temperature channel: three conversions, plausibility filter, average.

use crate::clock::Clock;
use crate::sensors::{SensorChannel, TemperatureProbe};
use crate::{Reading, SensorKind};
use tracing::{debug, warn};

pub const RESOLUTION_BITS: u8 = 12;
pub const SAMPLES: usize = 3;

/// Exclusive bounds of a physically plausible reading, in °C. The probe's
/// disconnect code (−127) falls outside.
pub const MIN_CELSIUS: f64 = -55.0;
pub const MAX_CELSIUS: f64 = 125.0;

pub struct TemperatureChannel<P> {
    probe: P,
    configured: bool,
}

impl<P: TemperatureProbe> TemperatureChannel<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            configured: false,
        }
    }

    fn sample(&mut self, clock: &mut dyn Clock) -> Option<f64> {
        if let Err(e) = self.probe.request_conversion() {
            debug!(error = %e, "temperature conversion request failed");
            return None;
        }
        clock.delay_ms(self.probe.conversion_time_ms(RESOLUTION_BITS));
        match self.probe.read_celsius() {
            Ok(c) if c > MIN_CELSIUS && c < MAX_CELSIUS => Some(c),
            Ok(c) => {
                debug!(celsius = c, "temperature sample discarded");
                None
            }
            Err(e) => {
                debug!(error = %e, "temperature read failed");
                None
            }
        }
    }
}

impl<P: TemperatureProbe> SensorChannel for TemperatureChannel<P> {
    fn kind(&self) -> SensorKind {
        SensorKind::Temperature
    }

    fn poll(&mut self, clock: &mut dyn Clock) -> Reading {
        if !self.configured {
            if let Err(e) = self.probe.set_resolution(RESOLUTION_BITS) {
                warn!(error = %e, "could not set probe resolution");
            }
            self.configured = true;
        }

        let mut sum = 0.0;
        let mut kept = 0usize;
        for _ in 0..SAMPLES {
            if let Some(c) = self.sample(clock) {
                sum += c;
                kept += 1;
            }
        }

        if kept == 0 {
            warn!("no plausible temperature samples, probe disconnected?");
            return Reading::invalid(SensorKind::Temperature);
        }
        Reading::scalar(SensorKind::Temperature, sum / kept as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::devices::SensorError;
    use crate::TEMPERATURE_SENTINEL;
    use std::collections::VecDeque;

    struct FakeProbe {
        samples: VecDeque<Result<f64, SensorError>>,
        resolution_calls: u32,
    }

    impl FakeProbe {
        fn new(samples: Vec<Result<f64, SensorError>>) -> Self {
            Self {
                samples: samples.into(),
                resolution_calls: 0,
            }
        }
    }

    impl TemperatureProbe for FakeProbe {
        fn set_resolution(&mut self, bits: u8) -> Result<(), SensorError> {
            assert_eq!(bits, RESOLUTION_BITS);
            self.resolution_calls += 1;
            Ok(())
        }

        fn request_conversion(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        fn read_celsius(&mut self) -> Result<f64, SensorError> {
            self.samples
                .pop_front()
                .unwrap_or(Ok(TEMPERATURE_SENTINEL))
        }
    }

    #[test]
    fn disconnect_code_is_discarded_from_average() {
        let probe = FakeProbe::new(vec![Ok(23.5), Ok(-127.0), Ok(24.1)]);
        let reading = TemperatureChannel::new(probe).poll(&mut ManualClock::new());
        assert!(reading.valid);
        assert!((reading.scalar_value() - 23.8).abs() < 1e-9);
    }

    #[test]
    fn no_survivors_is_disconnect_sentinel() {
        let probe = FakeProbe::new(vec![Ok(-127.0), Ok(125.0), Err(SensorError::Checksum)]);
        let reading = TemperatureChannel::new(probe).poll(&mut ManualClock::new());
        assert!(!reading.valid);
        assert_eq!(reading.scalar_value(), TEMPERATURE_SENTINEL);
    }

    #[test]
    fn band_is_exclusive() {
        let probe = FakeProbe::new(vec![Ok(-55.0), Ok(-54.9), Ok(124.9)]);
        let reading = TemperatureChannel::new(probe).poll(&mut ManualClock::new());
        assert!(reading.valid);
        assert!((reading.scalar_value() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn waits_conversion_time_and_sets_resolution_once() {
        let probe = FakeProbe::new(vec![Ok(20.0); 6]);
        let mut channel = TemperatureChannel::new(probe);
        let mut clock = ManualClock::new();
        channel.poll(&mut clock);
        channel.poll(&mut clock);
        assert_eq!(channel.probe.resolution_calls, 1);
        assert_eq!(clock.now_ms(), 6 * 750);
    }
}
