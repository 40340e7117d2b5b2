//! Position channel backed by the continuously fed NMEA decoder.
//!
//! `poll` never touches the wire: it reports the decoder's last fix if it
//! is fresh. The wire is drained by `service`, which the scheduler runs on
//! every tick.

use crate::clock::Clock;
use crate::nmea::GpsDecoder;
use crate::sensors::SensorChannel;
use crate::serial::SerialPort;
use crate::{Reading, SensorKind};
use tracing::{debug, warn};

/// A fix older than this is reported as no fix.
pub const MAX_FIX_AGE_MS: u64 = 3000;

const CHUNK: usize = 64;
/// Upper bound on chunks drained per tick, so a babbling port cannot hold
/// the loop.
const MAX_CHUNKS_PER_TICK: usize = 32;

pub struct PositionChannel<S> {
    stream: S,
    decoder: GpsDecoder,
}

impl<S: SerialPort> PositionChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: GpsDecoder::new(),
        }
    }

    pub fn decoder(&self) -> &GpsDecoder {
        &self.decoder
    }
}

impl<S: SerialPort> SensorChannel for PositionChannel<S> {
    fn kind(&self) -> SensorKind {
        SensorKind::Position
    }

    fn poll(&mut self, clock: &mut dyn Clock) -> Reading {
        let now = clock.now_ms();
        match (self.decoder.fix(), self.decoder.fix_age_ms(now)) {
            (Some(fix), Some(age)) if age < MAX_FIX_AGE_MS => Reading::position(fix.lat, fix.lon),
            (_, age) => {
                debug!(
                    age_ms = ?age,
                    passed = self.decoder.sentences_passed(),
                    failed = self.decoder.sentences_failed(),
                    "no fresh gps fix"
                );
                Reading::invalid(SensorKind::Position)
            }
        }
    }

    fn service(&mut self, clock: &mut dyn Clock) {
        let mut buf = [0u8; CHUNK];
        for _ in 0..MAX_CHUNKS_PER_TICK {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.decoder.feed_slice(&buf[..n], clock.now_ms()),
                Err(e) => {
                    warn!(error = %e, "gps stream read failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::nmea::sentence;
    use crate::serial::fake::ScriptedPort;
    use crate::SENTINEL;

    const RMC: &str = "GPRMC,153000.00,A,0707.158,N,07307.362,W,0.02,,140325,,,A";

    fn channel_with_fix_at(clock: &mut ManualClock, at_ms: u64) -> PositionChannel<ScriptedPort> {
        let mut port = ScriptedPort::default();
        port.push_rx(sentence(RMC).as_bytes());
        let mut channel = PositionChannel::new(port);
        clock.set_ms(at_ms);
        channel.service(clock);
        channel
    }

    #[test]
    fn fix_younger_than_limit_is_valid() {
        let mut clock = ManualClock::new();
        let mut channel = channel_with_fix_at(&mut clock, 10_000);
        clock.set_ms(10_000 + 2_999);
        let reading = channel.poll(&mut clock);
        assert!(reading.valid);
        let (lat, lon) = reading.coordinates();
        assert!((lat - 7.1193).abs() < 1e-6);
        assert!((lon + 73.1227).abs() < 1e-6);
    }

    #[test]
    fn stale_fix_is_sentinel() {
        let mut clock = ManualClock::new();
        let mut channel = channel_with_fix_at(&mut clock, 10_000);
        clock.set_ms(10_000 + 3_001);
        let reading = channel.poll(&mut clock);
        assert!(!reading.valid);
        assert_eq!(reading.coordinates(), (SENTINEL, SENTINEL));
    }

    #[test]
    fn no_fix_ever_is_sentinel() {
        let mut channel = PositionChannel::new(ScriptedPort::default());
        let mut clock = ManualClock::new();
        channel.service(&mut clock);
        let reading = channel.poll(&mut clock);
        assert!(!reading.valid);
        assert_eq!(reading.coordinates(), (SENTINEL, SENTINEL));
    }

    #[test]
    fn service_drains_everything_buffered() {
        let mut port = ScriptedPort::default();
        for _ in 0..10 {
            port.push_rx(sentence(RMC).as_bytes());
        }
        let mut channel = PositionChannel::new(port);
        channel.service(&mut ManualClock::new());
        assert_eq!(channel.decoder().sentences_passed(), 10);
        assert!(channel.stream.rx.is_empty());
    }
}
