//! # Message Encoding
//!
//! Serializes a [`Record`] plus its header into the JSON published on
//! [`MESSAGE_TOPIC`]:
//!
//! ```text
//! {"header":{"userUUID":…,"deviceId":…,"timeStamp":"2025-03-14T10:00:00.000000-05:00",
//!  "topic":"device/messages","location":…,"shouldRequeue":true},
//!  "metrics":[{"measurement":"CO2","value":412.0}, … ]}
//! ```
//!
//! ## Bounded output
//! The payload is written into a buffer allocated once with capacity
//! [`MAX_PAYLOAD`]. A payload that would exceed it is an
//! [`EncodeError::PayloadTooLarge`]; nothing partial is ever returned. With
//! a fixed schema and a 31-byte location this is not reachable in normal
//! operation.
//!
//! ## Timestamps
//! `YYYY-MM-DDTHH:MM:SS.ffffff±HH:MM` in a static offset taken from the
//! configuration. Timestamps never go backwards between consecutive
//! messages: if the wall clock steps back, the previous timestamp is reused.

use crate::{Record, MESSAGE_TOPIC};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::io::{self, Write};
use thiserror::Error;
use tracing::warn;

/// Upper bound of an encoded message, in bytes.
pub const MAX_PAYLOAD: usize = 512;

/// Redelivery flag carried by every header. Always set.
pub const SHOULD_REQUEUE: bool = true;

#[derive(Error, Debug)]
pub enum EncodeError {
    /// Serialized message would not fit the payload bound
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),
}

/// Who the messages come from.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_uuid: String,
    pub device_id: String,
}

/// Header as it appears on the wire. Field order is the wire order.
#[derive(Serialize)]
struct Header<'a> {
    #[serde(rename = "userUUID")]
    user_uuid: &'a str,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    #[serde(rename = "timeStamp")]
    time_stamp: &'a str,
    topic: &'a str,
    location: &'a str,
    #[serde(rename = "shouldRequeue")]
    should_requeue: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    header: Header<'a>,
    metrics: &'a Record,
}

/// Retained liveness payload on the status topic.
#[derive(Serialize)]
struct Status<'a> {
    device: &'a str,
    status: &'a str,
}

/// `{"device": …, "status": "online" | "offline"}`.
pub fn status_payload(device_id: &str, online: bool) -> Vec<u8> {
    let status = Status {
        device: device_id,
        status: if online { "online" } else { "offline" },
    };
    // two string fields cannot fail to serialize
    serde_json::to_vec(&status).unwrap_or_default()
}

/// Writer that refuses to grow past `limit`.
struct BoundedWriter<'a> {
    buf: &'a mut Vec<u8>,
    limit: usize,
}

impl Write for BoundedWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "payload bound reached",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Format `at` as `YYYY-MM-DDTHH:MM:SS.ffffff±HH:MM` in `offset`.
pub fn format_timestamp(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset)
        .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
        .to_string()
}

pub struct MessageEncoder {
    identity: Identity,
    offset: FixedOffset,
    buffer: Vec<u8>,
    limit: usize,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MessageEncoder {
    pub fn new(identity: Identity, offset: FixedOffset) -> Self {
        Self::with_limit(identity, offset, MAX_PAYLOAD)
    }

    pub fn with_limit(identity: Identity, offset: FixedOffset, limit: usize) -> Self {
        Self {
            identity,
            offset,
            buffer: Vec::with_capacity(limit),
            limit,
            last_timestamp: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Encode one message. The returned slice borrows the encoder's reused
    /// buffer and is valid until the next call.
    pub fn encode(
        &mut self,
        record: &Record,
        location: &str,
        at: DateTime<Utc>,
    ) -> Result<&[u8], EncodeError> {
        let at = match self.last_timestamp {
            Some(last) if at < last => {
                warn!(%at, %last, "wall clock went backwards, reusing last timestamp");
                last
            }
            _ => at,
        };
        let time_stamp = format_timestamp(at, self.offset);

        let message = Message {
            header: Header {
                user_uuid: &self.identity.user_uuid,
                device_id: &self.identity.device_id,
                time_stamp: &time_stamp,
                topic: MESSAGE_TOPIC,
                location,
                should_requeue: SHOULD_REQUEUE,
            },
            metrics: record,
        };

        self.buffer.clear();
        let writer = BoundedWriter {
            buf: &mut self.buffer,
            limit: self.limit,
        };
        if let Err(e) = serde_json::to_writer(writer, &message) {
            self.buffer.clear();
            return Err(if e.is_io() {
                EncodeError::PayloadTooLarge { limit: self.limit }
            } else {
                EncodeError::Json(e)
            });
        }

        self.last_timestamp = Some(at);
        Ok(&self.buffer)
    }
}
