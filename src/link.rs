//! # Link Session
//!
//! Owns WiFi association and the broker session.
//!
//! ```text
//!   WifiDown ──associate──▶ WifiUp+BrokerDown ──establish──▶ WifiUp+BrokerUp
//!      ▲                         ▲                                │
//!      └──── radio lost ─────────┴──────── session dropped ───────┘
//! ```
//!
//! - Association retries every 500 ms with no limit.
//! - Session establishment retries every 5 s with no limit. Each attempt
//!   registers a retained "offline" last will; a successful one is followed
//!   immediately by the retained "online" birth message.
//!
//! Neither wait has a cap or circuit breaker: an unreachable broker stalls
//! the loop until it comes back.

use crate::clock::Clock;
use crate::message::status_payload;
use crate::STATUS_TOPIC;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Broker did not acknowledge the session in time
    #[error("broker did not answer within {0} ms")]
    Timeout(u64),

    /// Broker answered CONNECT with a refusal
    #[error("connection refused: {0}")]
    Refused(String),

    /// Transport-level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation needs a session that is not up
    #[error("not connected")]
    NotConnected,

    #[error("radio: {0}")]
    Radio(String),
}

/// Connection state of one layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// WiFi state composed with broker session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkState {
    pub wifi: ConnState,
    pub broker: ConnState,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        self.wifi == ConnState::Connected && self.broker == ConnState::Connected
    }
}

/// Message the broker publishes on our behalf if the session drops
/// uncleanly.
#[derive(Clone, Debug, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

pub trait WifiRadio {
    /// Start associating. Called once per association round.
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;

    fn is_associated(&mut self) -> bool;
}

pub trait BrokerClient {
    /// Open a session registering `will`. Blocks until the broker accepts,
    /// refuses, or the attempt times out.
    fn connect(&mut self, will: &LastWill) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Inbound and keepalive processing. Marks the session dropped when the
    /// transport fails.
    fn poll(&mut self);

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError>;
}

/// Retry intervals.
#[derive(Clone, Copy, Debug)]
pub struct LinkPolicy {
    pub wifi_poll_ms: u64,
    pub broker_backoff_ms: u64,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            wifi_poll_ms: 500,
            broker_backoff_ms: 5000,
        }
    }
}

pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

pub struct LinkSession {
    radio: Box<dyn WifiRadio>,
    broker: Box<dyn BrokerClient>,
    credentials: WifiCredentials,
    will: LastWill,
    birth: Vec<u8>,
    policy: LinkPolicy,
    state: LinkState,
    sessions: u32,
}

impl LinkSession {
    pub fn new(
        radio: Box<dyn WifiRadio>,
        broker: Box<dyn BrokerClient>,
        credentials: WifiCredentials,
        device_id: &str,
    ) -> Self {
        Self::with_policy(radio, broker, credentials, device_id, LinkPolicy::default())
    }

    pub fn with_policy(
        radio: Box<dyn WifiRadio>,
        broker: Box<dyn BrokerClient>,
        credentials: WifiCredentials,
        device_id: &str,
        policy: LinkPolicy,
    ) -> Self {
        Self {
            radio,
            broker,
            credentials,
            will: LastWill {
                topic: STATUS_TOPIC.to_string(),
                payload: status_payload(device_id, false),
                retain: true,
            },
            birth: status_payload(device_id, true),
            policy,
            state: LinkState {
                wifi: ConnState::Disconnected,
                broker: ConnState::Disconnected,
            },
            sessions: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Sessions established since start-up.
    pub fn sessions(&self) -> u32 {
        self.sessions
    }

    /// Per-tick liveness check. Re-enters association and/or session
    /// establishment as needed and returns once both are up.
    ///
    /// Both layers are re-read from the radio and the client on every call,
    /// so a radio that was already associated at start-up, or a session that
    /// outlived a short radio drop, is picked up without reconnecting.
    pub fn ensure_connected(&mut self, clock: &mut dyn Clock) {
        if self.radio.is_associated() {
            if self.state.wifi != ConnState::Connected {
                info!("wifi associated");
                self.state.wifi = ConnState::Connected;
            }
        } else {
            if self.state.wifi == ConnState::Connected {
                warn!("wifi association lost");
            }
            self.state.wifi = ConnState::Disconnected;
            self.state.broker = ConnState::Disconnected;
            self.associate(clock);
        }

        if self.broker.is_connected() {
            if self.state.broker != ConnState::Connected {
                info!("broker session still open");
                self.state.broker = ConnState::Connected;
            }
        } else {
            if self.state.broker == ConnState::Connected {
                warn!("broker session dropped");
            }
            self.state.broker = ConnState::Disconnected;
            self.establish(clock);
        }
    }

    /// Broker inbound/keepalive processing.
    pub fn service(&mut self) {
        self.broker.poll();
        if self.state.broker == ConnState::Connected && !self.broker.is_connected() {
            warn!("broker session dropped");
            self.state.broker = ConnState::Disconnected;
        }
    }

    /// Publish when fully connected. Returns false (and logs) otherwise or
    /// when the transport rejects the message.
    pub fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        if !self.state.is_up() {
            warn!(topic, state = ?self.state, "publish skipped, link not up");
            return false;
        }
        match self.broker.publish(topic, payload, retain) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "publish failed");
                false
            }
        }
    }

    fn associate(&mut self, clock: &mut dyn Clock) {
        self.state.wifi = ConnState::Connecting;
        info!(ssid = %self.credentials.ssid, "associating");
        if let Err(e) = self
            .radio
            .begin(&self.credentials.ssid, &self.credentials.password)
        {
            warn!(error = %e, "wifi begin failed");
        }
        while !self.radio.is_associated() {
            clock.delay_ms(self.policy.wifi_poll_ms);
        }
        self.state.wifi = ConnState::Connected;
        info!("wifi associated");
    }

    fn establish(&mut self, clock: &mut dyn Clock) {
        self.state.broker = ConnState::Connecting;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.broker.connect(&self.will) {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms = self.policy.broker_backoff_ms,
                        "broker connect failed"
                    );
                    clock.delay_ms(self.policy.broker_backoff_ms);
                }
            }
        }
        self.state.broker = ConnState::Connected;
        self.sessions += 1;
        info!(attempt, sessions = self.sessions, "broker session established");

        if let Err(e) = self.broker.publish(STATUS_TOPIC, &self.birth, true) {
            warn!(error = %e, "birth message publish failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq)]
    pub enum BrokerEvent {
        ConnectFailed,
        Connected(LastWill),
        Published {
            topic: String,
            payload: Vec<u8>,
            retain: bool,
        },
    }

    /// Broker whose behaviour is driven through a shared handle.
    #[derive(Clone, Default)]
    pub struct FakeBroker {
        inner: Rc<RefCell<FakeBrokerState>>,
    }

    #[derive(Default)]
    pub struct FakeBrokerState {
        pub connected: bool,
        pub failures_before_success: u32,
        pub events: Vec<BrokerEvent>,
    }

    impl FakeBroker {
        pub fn fail_next(&self, attempts: u32) {
            self.inner.borrow_mut().failures_before_success = attempts;
        }

        pub fn drop_session(&self) {
            self.inner.borrow_mut().connected = false;
        }

        pub fn events(&self) -> Vec<BrokerEvent> {
            self.inner.borrow().events.clone()
        }

        pub fn clear_events(&self) {
            self.inner.borrow_mut().events.clear();
        }

        pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    BrokerEvent::Published { topic: t, payload, .. } if t == topic => {
                        Some(payload)
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl BrokerClient for FakeBroker {
        fn connect(&mut self, will: &LastWill) -> Result<(), LinkError> {
            let mut state = self.inner.borrow_mut();
            if state.failures_before_success > 0 {
                state.failures_before_success -= 1;
                state.events.push(BrokerEvent::ConnectFailed);
                return Err(LinkError::Connection("refused by fake".to_string()));
            }
            state.connected = true;
            state.events.push(BrokerEvent::Connected(will.clone()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.inner.borrow().connected
        }

        fn poll(&mut self) {}

        fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
            let mut state = self.inner.borrow_mut();
            if !state.connected {
                return Err(LinkError::NotConnected);
            }
            state.events.push(BrokerEvent::Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            });
            Ok(())
        }
    }

    /// Radio that associates after a scripted number of polls.
    #[derive(Clone, Default)]
    pub struct FakeRadio {
        pub inner: Rc<RefCell<FakeRadioState>>,
    }

    #[derive(Default)]
    pub struct FakeRadioState {
        pub associated: bool,
        pub polls_until_associated: u32,
        pub begins: u32,
    }

    impl WifiRadio for FakeRadio {
        fn begin(&mut self, _ssid: &str, _password: &str) -> Result<(), LinkError> {
            self.inner.borrow_mut().begins += 1;
            Ok(())
        }

        fn is_associated(&mut self) -> bool {
            let mut state = self.inner.borrow_mut();
            if !state.associated {
                if state.polls_until_associated == 0 {
                    state.associated = true;
                } else {
                    state.polls_until_associated -= 1;
                }
            }
            state.associated
        }
    }
}
