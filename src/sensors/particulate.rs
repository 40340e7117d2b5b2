//! PM2.5 channel with bounded retries and a one-time recovery sequence.
//!
//! Duty-cycled particulate sensors tend to go quiet after idle periods.
//! When every regular attempt fails the channel wakes the sensor, lets it
//! stabilize, forces active reporting and continuous working period, then
//! tries exactly once more.

use crate::clock::Clock;
use crate::sensors::{ParticulateSensor, SensorChannel};
use crate::{Reading, SensorKind};
use tracing::{debug, info, warn};

/// Upper bound of the plausibility band (µg/m³, exclusive). The lower bound
/// is 0 inclusive.
pub const MAX_PM25: f64 = 1000.0;

/// Retry and recovery timings.
#[derive(Clone, Copy, Debug)]
pub struct ParticulatePolicy {
    pub attempts: u32,
    pub read_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub stabilize_ms: u64,
}

impl Default for ParticulatePolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            read_timeout_ms: 2000,
            retry_delay_ms: 250,
            stabilize_ms: 3000,
        }
    }
}

pub struct ParticulateChannel<S> {
    sensor: S,
    policy: ParticulatePolicy,
}

impl<S: ParticulateSensor> ParticulateChannel<S> {
    pub fn new(sensor: S) -> Self {
        Self::with_policy(sensor, ParticulatePolicy::default())
    }

    pub fn with_policy(sensor: S, policy: ParticulatePolicy) -> Self {
        Self { sensor, policy }
    }

    fn attempt(&mut self, clock: &mut dyn Clock) -> Option<f64> {
        match self.sensor.read_pm25(self.policy.read_timeout_ms, clock) {
            Ok(v) if v.is_finite() && (0.0..MAX_PM25).contains(&v) => Some(v),
            Ok(v) => {
                debug!(value = v, "pm2.5 value rejected");
                None
            }
            Err(e) => {
                debug!(error = %e, "pm2.5 read failed");
                None
            }
        }
    }

    fn recover(&mut self, clock: &mut dyn Clock) {
        if let Err(e) = self.sensor.wake(clock) {
            warn!(error = %e, "pm2.5 wake failed");
        }
        clock.delay_ms(self.policy.stabilize_ms);
        if let Err(e) = self.sensor.set_active_reporting(clock) {
            warn!(error = %e, "pm2.5 set active reporting failed");
        }
        if let Err(e) = self.sensor.set_continuous_mode(clock) {
            warn!(error = %e, "pm2.5 set continuous mode failed");
        }
    }
}

impl<S: ParticulateSensor> SensorChannel for ParticulateChannel<S> {
    fn kind(&self) -> SensorKind {
        SensorKind::Particulate
    }

    fn poll(&mut self, clock: &mut dyn Clock) -> Reading {
        for attempt in 1..=self.policy.attempts {
            if let Some(v) = self.attempt(clock) {
                return Reading::scalar(SensorKind::Particulate, v);
            }
            if attempt < self.policy.attempts {
                clock.delay_ms(self.policy.retry_delay_ms);
            }
        }

        warn!(
            attempts = self.policy.attempts,
            "pm2.5 sensor silent, running recovery sequence"
        );
        self.recover(clock);
        match self.attempt(clock) {
            Some(v) => {
                info!(value = v, "pm2.5 sensor recovered");
                Reading::scalar(SensorKind::Particulate, v)
            }
            None => {
                warn!("pm2.5 sensor did not recover");
                Reading::invalid(SensorKind::Particulate)
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
    use std::collections::VecDeque;

    #[derive(Debug, PartialEq)]
    enum Call {
        Read,
        Wake,
        Active,
        Continuous,
    }

    #[derive(Default)]
    struct FakeDust {
        results: VecDeque<Result<f64, SensorError>>,
        calls: Vec<Call>,
    }

    impl FakeDust {
        fn new(results: Vec<Result<f64, SensorError>>) -> Self {
            Self {
                results: results.into(),
                calls: Vec::new(),
            }
        }
    }

    impl ParticulateSensor for FakeDust {
        fn read_pm25(&mut self, _timeout: u64, _clock: &mut dyn Clock) -> Result<f64, SensorError> {
            self.calls.push(Call::Read);
            self.results
                .pop_front()
                .unwrap_or(Err(SensorError::Timeout(0)))
        }

        fn wake(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
            self.calls.push(Call::Wake);
            Ok(())
        }

        fn set_active_reporting(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
            self.calls.push(Call::Active);
            Ok(())
        }

        fn set_continuous_mode(&mut self, _clock: &mut dyn Clock) -> Result<(), SensorError> {
            self.calls.push(Call::Continuous);
            Err(SensorError::Timeout(1000))
        }
    }

    #[test]
    fn first_finite_value_wins() {
        let dust = FakeDust::new(vec![Ok(f64::NAN), Ok(8.3)]);
        let mut channel = ParticulateChannel::new(dust);
        let mut clock = ManualClock::new();
        let reading = channel.poll(&mut clock);
        assert!(reading.valid);
        assert_eq!(reading.scalar_value(), 8.3);
        assert_eq!(channel.sensor.calls, vec![Call::Read, Call::Read]);
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn recovers_after_four_non_finite_reads() {
        let dust = FakeDust::new(vec![
            Ok(f64::NAN),
            Ok(f64::INFINITY),
            Err(SensorError::Timeout(2000)),
            Ok(f64::NAN),
            Ok(11.7),
        ]);
        let mut channel = ParticulateChannel::new(dust);
        let mut clock = ManualClock::new();
        let reading = channel.poll(&mut clock);

        assert!(reading.valid);
        assert_eq!(reading.scalar_value(), 11.7);
        assert_eq!(
            channel.sensor.calls,
            vec![
                Call::Read,
                Call::Read,
                Call::Read,
                Call::Read,
                Call::Wake,
                Call::Active,
                Call::Continuous,
                Call::Read,
            ]
        );
        // three inter-attempt delays plus stabilization
        assert_eq!(clock.now_ms(), 3 * 250 + 3000);
    }

    #[test]
    fn failed_recovery_is_sentinel() {
        let dust = FakeDust::new(vec![Ok(f64::NAN); 5]);
        let mut channel = ParticulateChannel::new(dust);
        let reading = channel.poll(&mut ManualClock::new());
        assert!(!reading.valid);
        assert_eq!(reading.scalar_value(), SENTINEL);
        assert_eq!(
            channel
                .sensor
                .calls
                .iter()
                .filter(|c| **c == Call::Read)
                .count(),
            5
        );
    }

    #[test]
    fn out_of_band_values_count_as_failures() {
        let dust = FakeDust::new(vec![Ok(-1.0), Ok(1500.0), Ok(-0.5), Ok(4000.0), Ok(-3.0)]);
        let reading = ParticulateChannel::new(dust).poll(&mut ManualClock::new());
        assert!(!reading.valid);
        assert_eq!(reading.scalar_value(), SENTINEL);
    }
}
