//! # Cooperative Scheduler
//!
//! The single thread of control. Each tick, in order:
//!
//! 1. service the configuration portal (may change the location label)
//! 2. make sure WiFi and the broker session are up, re-establishing them if
//!    not (this can take arbitrarily long)
//! 3. broker inbound/keepalive processing
//! 4. per-channel service steps (the GPS stream feed)
//! 5. every [`PUBLISH_INTERVAL_MS`], one publish cycle:
//!    collect → encode → publish on [`MESSAGE_TOPIC`]
//!
//! The interval timer is reset to the start of the tick that published, so
//! the time spent reading sensors does not accumulate as drift across
//! cycles.

use crate::aggregator::ReadingAggregator;
use crate::clock::Clock;
use crate::link::LinkSession;
use crate::message::MessageEncoder;
use crate::portal::ConfigPortal;
use crate::store::ConfigStore;
use crate::MESSAGE_TOPIC;
use tracing::{error, info, warn};

/// Minimum time between two publish cycles.
pub const PUBLISH_INTERVAL_MS: u64 = 10_000;

/// Idle time between ticks.
pub const TICK_IDLE_MS: u64 = 10;

/// What a publish cycle ended in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Handed to the broker client.
    Published { bytes: usize },
    /// Message did not fit the payload bound. Nothing was sent.
    EncodeFailed,
    /// Link not up or the client rejected the message. The next cycle
    /// carries fresh readings; nothing is queued.
    PublishFailed,
}

pub struct Scheduler<C> {
    clock: C,
    portal: Option<Box<dyn ConfigPortal>>,
    store: ConfigStore,
    link: LinkSession,
    aggregator: ReadingAggregator,
    encoder: MessageEncoder,
    last_publish_ms: u64,
    cycles: u64,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(
        clock: C,
        store: ConfigStore,
        link: LinkSession,
        aggregator: ReadingAggregator,
        encoder: MessageEncoder,
    ) -> Self {
        let last_publish_ms = clock.now_ms();
        Self {
            clock,
            portal: None,
            store,
            link,
            aggregator,
            encoder,
            last_publish_ms,
            cycles: 0,
        }
    }

    pub fn with_portal(mut self, portal: Box<dyn ConfigPortal>) -> Self {
        self.portal = Some(portal);
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn link(&self) -> &LinkSession {
        &self.link
    }

    /// Publish cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// One pass of the loop. Returns the outcome of the publish cycle if
    /// this tick ran one.
    pub fn tick(&mut self) -> Option<CycleOutcome> {
        let started = self.clock.now_ms();

        if let Some(portal) = self.portal.as_mut() {
            portal.service(&mut self.store);
        }
        self.link.ensure_connected(&mut self.clock);
        self.link.service();
        self.aggregator.service(&mut self.clock);

        if started.saturating_sub(self.last_publish_ms) < PUBLISH_INTERVAL_MS {
            return None;
        }
        self.last_publish_ms = started;
        self.cycles += 1;
        Some(self.publish_cycle())
    }

    /// Tick forever.
    pub fn run(&mut self) -> ! {
        info!(
            interval_ms = PUBLISH_INTERVAL_MS,
            location = %self.store.location(),
            "scheduler running"
        );
        loop {
            self.tick();
            self.clock.delay_ms(TICK_IDLE_MS);
        }
    }

    fn publish_cycle(&mut self) -> CycleOutcome {
        let record = self.aggregator.collect(&mut self.clock);
        let at = self.clock.utc_now();

        let payload = match self.encoder.encode(&record, self.store.location(), at) {
            Ok(payload) => payload,
            Err(e) => {
                error!(cycle = self.cycles, error = %e, "message encoding failed, cycle skipped");
                return CycleOutcome::EncodeFailed;
            }
        };
        let bytes = payload.len();

        if self.link.publish(MESSAGE_TOPIC, payload, false) {
            info!(cycle = self.cycles, bytes, "message published");
            CycleOutcome::Published { bytes }
        } else {
            warn!(cycle = self.cycles, "message not published");
            CycleOutcome::PublishFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::link::fake::{FakeBroker, FakeRadio};
    use crate::link::WifiCredentials;
    use crate::message::Identity;
    use crate::sensors::SensorChannel;
    use crate::store::MemoryStorage;
    use crate::{Reading, SensorKind};
    use chrono::FixedOffset;

    struct Fixed(Reading);

    impl SensorChannel for Fixed {
        fn kind(&self) -> SensorKind {
            self.0.kind
        }

        fn poll(&mut self, _clock: &mut dyn Clock) -> Reading {
            self.0
        }
    }

    fn aggregator() -> ReadingAggregator {
        ReadingAggregator::new(
            Box::new(Fixed(Reading::position(7.1193, -73.1227))),
            Box::new(Fixed(Reading::scalar(SensorKind::GasConcentration, 412.0))),
            Box::new(Fixed(Reading::scalar(SensorKind::Particulate, 8.3))),
            Box::new(Fixed(Reading::scalar(SensorKind::Temperature, 24.1))),
        )
    }

    fn scheduler(clock: &ManualClock, broker: &FakeBroker) -> Scheduler<ManualClock> {
        let link = LinkSession::new(
            Box::new(FakeRadio::default()),
            Box::new(broker.clone()),
            WifiCredentials {
                ssid: "campus".to_string(),
                password: "pw".to_string(),
            },
            "aq-node-01",
        );
        let encoder = MessageEncoder::new(
            Identity {
                user_uuid: "6f1c2b1e-0c1d-4c7a-9a55-2b0f3f0d9e11".to_string(),
                device_id: "aq-node-01".to_string(),
            },
            FixedOffset::west_opt(5 * 3600).unwrap(),
        );
        let store = ConfigStore::open(Box::new(MemoryStorage::new())).unwrap();
        Scheduler::new(clock.clone(), store, link, aggregator(), encoder)
    }

    #[test]
    fn thirty_five_one_second_ticks_publish_three_times() {
        let clock = ManualClock::new();
        let broker = FakeBroker::default();
        let mut scheduler = scheduler(&clock, &broker);

        let mut outcomes = Vec::new();
        for second in 1..=35u64 {
            clock.set_ms(second * 1000);
            if let Some(outcome) = scheduler.tick() {
                outcomes.push((second, outcome));
            }
        }

        let seconds: Vec<u64> = outcomes.iter().map(|(s, _)| *s).collect();
        assert_eq!(seconds, vec![10, 20, 30]);
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, CycleOutcome::Published { .. })));
        assert_eq!(broker.published_on(MESSAGE_TOPIC).len(), 3);
        assert_eq!(scheduler.cycles(), 3);
    }

    #[test]
    fn slow_tick_resets_timer_to_its_start() {
        let clock = ManualClock::new();
        let broker = FakeBroker::default();
        let mut scheduler = scheduler(&clock, &broker);

        clock.set_ms(10_000);
        assert!(scheduler.tick().is_some());
        // the cycle started at 10 000 even if it finished later
        clock.set_ms(19_999);
        assert!(scheduler.tick().is_none());
        clock.set_ms(20_000);
        assert!(scheduler.tick().is_some());
    }

    #[test]
    fn broker_outage_delays_publish_until_reconnected() {
        let clock = ManualClock::new();
        let broker = FakeBroker::default();
        let mut scheduler = scheduler(&clock, &broker);

        clock.set_ms(1_000);
        scheduler.tick();
        assert!(scheduler.link().state().is_up());

        broker.drop_session();
        broker.fail_next(2);
        clock.set_ms(10_000);
        let outcome = scheduler.tick();

        // two failed attempts cost 10 s of backoff inside the tick
        assert_eq!(clock.now_ms(), 20_000);
        assert!(matches!(outcome, Some(CycleOutcome::Published { .. })));
        assert_eq!(scheduler.link().sessions(), 2);
    }

    #[test]
    fn birth_precedes_first_message() {
        let clock = ManualClock::new();
        let broker = FakeBroker::default();
        let mut scheduler = scheduler(&clock, &broker);
        clock.set_ms(10_000);
        scheduler.tick();

        let topics: Vec<String> = broker
            .events()
            .into_iter()
            .filter_map(|e| match e {
                crate::link::fake::BrokerEvent::Published { topic, .. } => Some(topic),
                _ => None,
            })
            .collect();
        assert_eq!(topics, vec![crate::STATUS_TOPIC, MESSAGE_TOPIC]);
    }

    struct SetLabel(&'static str);

    impl ConfigPortal for SetLabel {
        fn service(&mut self, store: &mut ConfigStore) {
            if store.location() != self.0 {
                store.set_location(self.0).unwrap();
            }
        }
    }

    #[test]
    fn portal_change_lands_in_the_same_tick_message() {
        let clock = ManualClock::new();
        let broker = FakeBroker::default();
        let mut scheduler = scheduler(&clock, &broker).with_portal(Box::new(SetLabel("Parque")));
        clock.set_ms(10_000);
        scheduler.tick();

        assert_eq!(scheduler.store().location(), "Parque");
        let payload = broker.published_on(MESSAGE_TOPIC).pop().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["header"]["location"], "Parque");
    }
}
