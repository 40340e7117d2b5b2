//! MH-Z19 NDIR CO2 sensor over UART (9600 8N1).
//!
//! Request: `FF 01 86 00 00 00 00 00 79`.
//! Reply:   `FF 86 HH LL .. .. .. .. CS`, ppm = `HH * 256 + LL`,
//! `CS = 0xFF - (sum of bytes 1..=7) + 1`.

use crate::clock::Clock;
use crate::devices::SensorError;
use crate::sensors::Co2Sensor;
use crate::serial::SerialPort;

const READ_CO2: [u8; 9] = [0xFF, 0x01, 0x86, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];
const FRAME_LEN: usize = 9;

/// Protocol timeout for one request/reply exchange.
pub const REPLY_TIMEOUT_MS: u64 = 500;

pub struct Mhz19<P> {
    port: P,
}

impl<P: SerialPort> Mhz19<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }
}

pub(crate) fn checksum(frame: &[u8; FRAME_LEN]) -> u8 {
    let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFFu8.wrapping_sub(sum).wrapping_add(1)
}

fn decode(frame: &[u8; FRAME_LEN]) -> Result<i32, SensorError> {
    if frame[0] != 0xFF || frame[1] != 0x86 {
        return Err(SensorError::Frame(format!("{:02X?}", &frame[..2])));
    }
    if checksum(frame) != frame[8] {
        return Err(SensorError::Checksum);
    }
    Ok(i32::from(frame[2]) * 256 + i32::from(frame[3]))
}

impl<P: SerialPort> Co2Sensor for Mhz19<P> {
    fn read_ppm(&mut self, clock: &mut dyn Clock) -> Result<i32, SensorError> {
        self.port.discard_input()?;
        self.port.write_all(&READ_CO2)?;

        let mut frame = [0u8; FRAME_LEN];
        let mut filled = 0;
        let deadline = clock.now_ms() + REPLY_TIMEOUT_MS;
        loop {
            let n = self.port.read(&mut frame[filled..])?;
            if filled == 0 {
                // resync on the start byte
                if let Some(start) = frame[..n].iter().position(|b| *b == 0xFF) {
                    frame.copy_within(start..n, 0);
                    filled = n - start;
                }
            } else {
                filled += n;
            }
            if filled == FRAME_LEN {
                return decode(&frame);
            }
            if clock.now_ms() >= deadline {
                return Err(SensorError::Timeout(REPLY_TIMEOUT_MS));
            }
            clock.delay_ms(1);
        }
    }
}
