//! Polls every channel once per publish cycle and assembles the [`Record`].

use crate::clock::Clock;
use crate::sensors::SensorChannel;
use crate::Record;
use tracing::{debug, info};

/// Owns the four channels in polling order: position, gas, particulate,
/// temperature.
pub struct ReadingAggregator {
    position: Box<dyn SensorChannel>,
    gas: Box<dyn SensorChannel>,
    particulate: Box<dyn SensorChannel>,
    temperature: Box<dyn SensorChannel>,
}

impl ReadingAggregator {
    pub fn new(
        position: Box<dyn SensorChannel>,
        gas: Box<dyn SensorChannel>,
        particulate: Box<dyn SensorChannel>,
        temperature: Box<dyn SensorChannel>,
    ) -> Self {
        Self {
            position,
            gas,
            particulate,
            temperature,
        }
    }

    /// Per-tick background step of every channel (the GPS feed).
    pub fn service(&mut self, clock: &mut dyn Clock) {
        for channel in self.channels_mut() {
            channel.service(clock);
        }
    }

    /// Poll all channels in order. A failing channel only degrades its own
    /// fields to their sentinels.
    pub fn collect(&mut self, clock: &mut dyn Clock) -> Record {
        let position = self.position.poll(clock);
        let gas = self.gas.poll(clock);
        let particulate = self.particulate.poll(clock);
        let temperature = self.temperature.poll(clock);

        for reading in [&position, &gas, &particulate, &temperature] {
            if !reading.valid {
                debug!(channel = reading.kind.label(), "degraded to sentinel");
            }
        }

        let (lat, lon) = position.coordinates();
        let record = Record::new(
            gas.scalar_value(),
            particulate.scalar_value(),
            temperature.scalar_value(),
            lat,
            lon,
        );
        info!(
            co2 = gas.scalar_value(),
            pm25 = particulate.scalar_value(),
            temperature = temperature.scalar_value(),
            lat,
            lon,
            "readings collected"
        );
        record
    }

    fn channels_mut(&mut self) -> [&mut Box<dyn SensorChannel>; 4] {
        [
            &mut self.position,
            &mut self.gas,
            &mut self.particulate,
            &mut self.temperature,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::{Reading, SensorKind, MEASUREMENT_NAMES, SENTINEL, TEMPERATURE_SENTINEL};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Scripted {
        kind: SensorKind,
        reading: Reading,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl SensorChannel for Scripted {
        fn kind(&self) -> SensorKind {
            self.kind
        }

        fn poll(&mut self, _clock: &mut dyn Clock) -> Reading {
            self.log.borrow_mut().push(self.kind.label());
            self.reading
        }

        fn service(&mut self, _clock: &mut dyn Clock) {
            self.log.borrow_mut().push("service");
        }
    }

    fn channel(reading: Reading, log: &Rc<RefCell<Vec<&'static str>>>) -> Box<dyn SensorChannel> {
        Box::new(Scripted {
            kind: reading.kind,
            reading,
            log: Rc::clone(log),
        })
    }

    #[test]
    fn polls_in_fixed_order_and_emits_five_metrics() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut aggregator = ReadingAggregator::new(
            channel(Reading::position(7.1193, -73.1227), &log),
            channel(Reading::scalar(SensorKind::GasConcentration, 412.0), &log),
            channel(Reading::scalar(SensorKind::Particulate, 8.3), &log),
            channel(Reading::scalar(SensorKind::Temperature, 24.1), &log),
        );
        let record = aggregator.collect(&mut ManualClock::new());

        assert_eq!(*log.borrow(), vec!["position", "co2", "pm2.5", "temperature"]);
        let names: Vec<_> = record.measurements().iter().map(|m| m.name).collect();
        assert_eq!(names, MEASUREMENT_NAMES);
        assert_eq!(record.get("CO2"), Some(412.0));
        assert_eq!(record.get("Lat"), Some(7.1193));
    }

    #[test]
    fn failures_degrade_only_their_fields() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut aggregator = ReadingAggregator::new(
            channel(Reading::invalid(SensorKind::Position), &log),
            channel(Reading::scalar(SensorKind::GasConcentration, 600.0), &log),
            channel(Reading::invalid(SensorKind::Particulate), &log),
            channel(Reading::invalid(SensorKind::Temperature), &log),
        );
        let record = aggregator.collect(&mut ManualClock::new());
        assert_eq!(record.get("CO2"), Some(600.0));
        assert_eq!(record.get("PM2.5"), Some(SENTINEL));
        assert_eq!(record.get("Temperature"), Some(TEMPERATURE_SENTINEL));
        assert_eq!(record.get("Lat"), Some(SENTINEL));
        assert_eq!(record.get("Lon"), Some(SENTINEL));
    }

    #[test]
    fn service_reaches_every_channel() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut aggregator = ReadingAggregator::new(
            channel(Reading::invalid(SensorKind::Position), &log),
            channel(Reading::invalid(SensorKind::GasConcentration), &log),
            channel(Reading::invalid(SensorKind::Particulate), &log),
            channel(Reading::invalid(SensorKind::Temperature), &log),
        );
        aggregator.service(&mut ManualClock::new());
        assert_eq!(log.borrow().len(), 4);
    }
}
