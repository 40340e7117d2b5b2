//! SDS011 laser particulate sensor over UART (9600 8N1).
//!
//! Data frame (10 bytes): `AA C0 P25L P25H P10L P10H ID1 ID2 CS AB`, where
//! PM2.5 = `(P25H * 256 + P25L) / 10` µg/m³ and `CS` is the low byte of the
//! sum of bytes 2..=7.
//!
//! Command frame (19 bytes): `AA B4 CMD D3 .. D14 FF FF CS AB`, `CS` being
//! the low byte of the sum of bytes 2..=16. Commands are acknowledged with a
//! 10-byte `AA C5 CMD ..` reply.

use crate::clock::Clock;
use crate::devices::SensorError;
use crate::sensors::ParticulateSensor;
use crate::serial::SerialPort;
use tracing::debug;

const HEAD: u8 = 0xAA;
const TAIL: u8 = 0xAB;
const DATA: u8 = 0xC0;
const REPLY: u8 = 0xC5;
const FRAME_LEN: usize = 10;
const COMMAND_LEN: usize = 19;

const CMD_REPORTING_MODE: u8 = 0x02;
const CMD_SLEEP_WORK: u8 = 0x06;
const CMD_WORKING_PERIOD: u8 = 0x08;

/// How long to wait for a command acknowledgement.
pub const ACK_TIMEOUT_MS: u64 = 1000;
const POLL_INTERVAL_MS: u64 = 10;

pub struct Sds011<P> {
    port: P,
    // partial frame carried between reads
    rx: [u8; FRAME_LEN],
    filled: usize,
}

impl<P: SerialPort> Sds011<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            rx: [0u8; FRAME_LEN],
            filled: 0,
        }
    }

    /// Next complete `AA .. AB` frame already buffered, without waiting.
    fn try_frame(&mut self) -> Result<Option<[u8; FRAME_LEN]>, SensorError> {
        let mut byte = [0u8; 1];
        while self.port.read(&mut byte)? == 1 {
            if self.filled == 0 && byte[0] != HEAD {
                continue;
            }
            self.rx[self.filled] = byte[0];
            self.filled += 1;
            if self.filled < FRAME_LEN {
                continue;
            }
            if self.rx[FRAME_LEN - 1] == TAIL {
                self.filled = 0;
                return Ok(Some(self.rx));
            }
            // misaligned: restart from the next head byte inside the frame
            match self.rx[1..].iter().position(|b| *b == HEAD) {
                Some(p) => {
                    self.rx.copy_within(p + 1..FRAME_LEN, 0);
                    self.filled = FRAME_LEN - 1 - p;
                }
                None => self.filled = 0,
            }
        }
        Ok(None)
    }

    /// Next frame on the wire, or `Timeout`.
    fn next_frame(
        &mut self,
        timeout_ms: u64,
        clock: &mut dyn Clock,
    ) -> Result<[u8; FRAME_LEN], SensorError> {
        let deadline = clock.now_ms() + timeout_ms;
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(frame);
            }
            if clock.now_ms() >= deadline {
                return Err(SensorError::Timeout(timeout_ms));
            }
            clock.delay_ms(POLL_INTERVAL_MS);
        }
    }

    /// Send a set-command and wait for its acknowledgement.
    fn command(&mut self, cmd: u8, value: u8, clock: &mut dyn Clock) -> Result<(), SensorError> {
        self.port.write_all(&command_frame(cmd, value))?;
        let deadline = clock.now_ms() + ACK_TIMEOUT_MS;
        loop {
            let remaining = deadline.saturating_sub(clock.now_ms());
            let frame = self.next_frame(remaining, clock)?;
            if frame[1] == REPLY && frame[2] == cmd {
                if data_checksum(&frame) != frame[8] {
                    return Err(SensorError::Checksum);
                }
                return Ok(());
            }
            debug!(kind = frame[1], "sds011: skipping frame while waiting for ack");
        }
    }
}

pub(crate) fn command_frame(cmd: u8, value: u8) -> [u8; COMMAND_LEN] {
    let mut frame = [0u8; COMMAND_LEN];
    frame[0] = HEAD;
    frame[1] = 0xB4;
    frame[2] = cmd;
    frame[3] = 0x01; // set, not query
    frame[4] = value;
    frame[15] = 0xFF;
    frame[16] = 0xFF;
    frame[17] = frame[2..=16]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    frame[18] = TAIL;
    frame
}

fn pm25(frame: &[u8; FRAME_LEN]) -> f64 {
    f64::from(u16::from_le_bytes([frame[2], frame[3]])) / 10.0
}

pub(crate) fn data_checksum(frame: &[u8; FRAME_LEN]) -> u8 {
    frame[2..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl<P: SerialPort> ParticulateSensor for Sds011<P> {
    /// Newest data frame in the receive buffer, so a backlog built up in
    /// continuous mode never delays the value. Waits for the next frame only
    /// when nothing usable is buffered.
    fn read_pm25(&mut self, timeout_ms: u64, clock: &mut dyn Clock) -> Result<f64, SensorError> {
        let mut newest = None;
        let mut corrupted = 0u32;
        while let Some(frame) = self.try_frame()? {
            if frame[1] != DATA {
                continue;
            }
            if data_checksum(&frame) == frame[8] {
                newest = Some(frame);
            } else {
                corrupted += 1;
            }
        }
        if let Some(frame) = newest {
            return Ok(pm25(&frame));
        }
        if corrupted > 0 {
            return Err(SensorError::Checksum);
        }

        let deadline = clock.now_ms() + timeout_ms;
        loop {
            let remaining = deadline.saturating_sub(clock.now_ms());
            let frame = self.next_frame(remaining, clock)?;
            if frame[1] != DATA {
                continue;
            }
            if data_checksum(&frame) != frame[8] {
                return Err(SensorError::Checksum);
            }
            return Ok(pm25(&frame));
        }
    }

    fn wake(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError> {
        self.command(CMD_SLEEP_WORK, 0x01, clock)
    }

    fn set_active_reporting(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError> {
        self.command(CMD_REPORTING_MODE, 0x00, clock)
    }

    fn set_continuous_mode(&mut self, clock: &mut dyn Clock) -> Result<(), SensorError> {
        self.command(CMD_WORKING_PERIOD, 0x00, clock)
    }
}
