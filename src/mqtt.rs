//! Broker clients.
//!
//! [`MqttBroker`] speaks MQTT 3.1.1 through `rumqttc`'s synchronous client.
//! The client/connection pair is rebuilt on every `connect`, so the last
//! will registered in CONNECT is always the one the link session asks for,
//! and `rumqttc`'s own reconnect loop never runs behind our back.
//!
//! [`LoggingBroker`] accepts everything and logs it; it backs `--dry-run`.

use crate::config::BrokerConfig;
use crate::link::{BrokerClient, LastWill, LinkError};
use rumqttc::{Client, Connection, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `connect` waits for the broker's ConnAck.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Slice given to the event loop on each `poll`.
const POLL_SLICE: Duration = Duration::from_millis(1);

/// Events processed per `poll` at most.
const MAX_EVENTS_PER_POLL: usize = 16;

/// Request queue depth between client and event loop.
const REQUEST_CAPACITY: usize = 10;

pub struct MqttBroker {
    config: BrokerConfig,
    session: Option<(Client, Connection)>,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn options(&self, will: &LastWill) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);
        if !self.config.username.is_empty() {
            options.set_credentials(&self.config.username, &self.config.password);
        }
        options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
        ));
        options
    }

    /// Drive the event loop briefly. Returns false if the transport failed.
    fn pump(&mut self, budget: usize) -> bool {
        let Some((_, connection)) = self.session.as_mut() else {
            return false;
        };
        for _ in 0..budget {
            match connection.recv_timeout(POLL_SLICE) {
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("broker sent disconnect");
                    self.session = None;
                    return false;
                }
                Ok(Ok(event)) => debug!(?event, "mqtt event"),
                Ok(Err(e)) => {
                    warn!(error = %e, "mqtt connection error");
                    self.session = None;
                    return false;
                }
                // nothing pending within the slice
                Err(_) => break,
            }
        }
        true
    }
}

fn describe(e: ConnectionError) -> LinkError {
    match e {
        ConnectionError::ConnectionRefused(code) => LinkError::Refused(format!("{code:?}")),
        other => LinkError::Connection(other.to_string()),
    }
}

impl BrokerClient for MqttBroker {
    fn connect(&mut self, will: &LastWill) -> Result<(), LinkError> {
        self.session = None;
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "connecting to broker"
        );
        let (client, mut connection) = Client::new(self.options(will), REQUEST_CAPACITY);

        let deadline = std::time::Instant::now() + CONNACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout(CONNACK_TIMEOUT.as_millis() as u64));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != rumqttc::ConnectReturnCode::Success {
                        return Err(LinkError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(Ok(event)) => debug!(?event, "mqtt event before connack"),
                Ok(Err(e)) => return Err(describe(e)),
                Err(_) => return Err(LinkError::Timeout(CONNACK_TIMEOUT.as_millis() as u64)),
            }
        }

        self.session = Some((client, connection));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn poll(&mut self) {
        self.pump(MAX_EVENTS_PER_POLL);
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        let Some((client, _)) = self.session.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .map_err(|e| LinkError::Connection(e.to_string()))?;
        // hand the request to the socket now rather than on the next tick
        if self.pump(MAX_EVENTS_PER_POLL) {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

/// Broker stand-in that logs publishes instead of sending them.
#[derive(Default)]
pub struct LoggingBroker {
    connected: bool,
    published: u64,
}

impl LoggingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl BrokerClient for LoggingBroker {
    fn connect(&mut self, will: &LastWill) -> Result<(), LinkError> {
        info!(
            will_topic = %will.topic,
            will = %String::from_utf8_lossy(&will.payload),
            "dry run: session opened"
        );
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn poll(&mut self) {}

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.published += 1;
        info!(
            topic,
            retain,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload),
            "dry run: publish"
        );
        Ok(())
    }
}
