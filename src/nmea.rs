//! Incremental NMEA-0183 decoder for the GPS stream.
//!
//! Bytes are fed one at a time as they come off the UART; the decoder
//! assembles `$…*hh` sentences in a fixed buffer, checks the XOR checksum
//! and resolves position from `RMC` and `GGA` sentences of any talker
//! (`GP`, `GN`, `GL`, …). Everything else is counted and ignored.
//!
//! The stream has no flow control. If the decoder is not fed for longer
//! than the UART can buffer, bytes are lost and the sentences they belonged
//! to fail their checksum; that is accepted, the next sentence resyncs.

use tracing::trace;

/// NMEA caps sentences at 82 characters including `$` and CRLF.
const MAX_SENTENCE: usize = 96;

/// A resolved position and the monotonic time it was resolved at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
    pub at_ms: u64,
}

pub struct GpsDecoder {
    line: [u8; MAX_SENTENCE],
    len: usize,
    in_sentence: bool,
    fix: Option<Fix>,
    passed: u32,
    failed: u32,
}

impl Default for GpsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GpsDecoder {
    pub fn new() -> Self {
        Self {
            line: [0; MAX_SENTENCE],
            len: 0,
            in_sentence: false,
            fix: None,
            passed: 0,
            failed: 0,
        }
    }

    /// Feed one byte received at `now_ms`. Returns true when it completed a
    /// sentence that updated the fix.
    pub fn feed(&mut self, byte: u8, now_ms: u64) -> bool {
        match byte {
            b'$' => {
                self.in_sentence = true;
                self.len = 0;
                false
            }
            b'\r' | b'\n' => {
                if !self.in_sentence {
                    return false;
                }
                self.in_sentence = false;
                self.complete(now_ms)
            }
            _ if self.in_sentence => {
                if self.len == MAX_SENTENCE {
                    // overlong, drop until the next '$'
                    self.in_sentence = false;
                    self.failed += 1;
                } else {
                    self.line[self.len] = byte;
                    self.len += 1;
                }
                false
            }
            _ => false,
        }
    }

    pub fn feed_slice(&mut self, bytes: &[u8], now_ms: u64) {
        for &b in bytes {
            self.feed(b, now_ms);
        }
    }

    pub fn fix(&self) -> Option<Fix> {
        self.fix
    }

    /// Milliseconds since the last fix, if there ever was one.
    pub fn fix_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.fix.map(|f| now_ms.saturating_sub(f.at_ms))
    }

    /// Sentences that passed their checksum.
    pub fn sentences_passed(&self) -> u32 {
        self.passed
    }

    /// Sentences that failed their checksum or overflowed the buffer.
    pub fn sentences_failed(&self) -> u32 {
        self.failed
    }

    fn complete(&mut self, now_ms: u64) -> bool {
        let Ok(text) = std::str::from_utf8(&self.line[..self.len]) else {
            self.failed += 1;
            return false;
        };
        let Some(body) = verify_checksum(text) else {
            self.failed += 1;
            trace!(sentence = text, "nmea checksum failed");
            return false;
        };
        self.passed += 1;

        match parse_position(body) {
            Some((lat, lon)) => {
                self.fix = Some(Fix {
                    lat,
                    lon,
                    at_ms: now_ms,
                });
                true
            }
            None => false,
        }
    }
}

/// Body of `text` (without `*hh`) when its checksum matches.
fn verify_checksum(text: &str) -> Option<&str> {
    let (body, hex) = text.split_once('*')?;
    let expected = u8::from_str_radix(hex.get(..2)?, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected).then_some(body)
}

/// Position from a valid-fix `RMC` or `GGA` body.
fn parse_position(body: &str) -> Option<(f64, f64)> {
    let mut fields = body.split(',');
    let id = fields.next()?;
    let kind = id.get(2..)?;
    let fields: Vec<&str> = fields.collect();
    let (lat, ns, lon, ew) = match kind {
        "RMC" => {
            if *fields.get(1)? != "A" {
                return None;
            }
            (fields.get(2)?, fields.get(3)?, fields.get(4)?, fields.get(5)?)
        }
        "GGA" => {
            let quality: u8 = fields.get(5)?.parse().ok()?;
            if quality == 0 {
                return None;
            }
            (fields.get(1)?, fields.get(2)?, fields.get(3)?, fields.get(4)?)
        }
        _ => return None,
    };
    Some((
        parse_coordinate(lat, ns, 'N', 'S')?,
        parse_coordinate(lon, ew, 'E', 'W')?,
    ))
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, positive: char, negative: char) -> Option<f64> {
    if !value.is_ascii() {
        return None;
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    if minutes >= 60.0 {
        return None;
    }
    let magnitude = degrees + minutes / 60.0;
    match hemisphere.chars().next()? {
        c if c == positive => Some(magnitude),
        c if c == negative => Some(-magnitude),
        _ => None,
    }
}

/// Wrap a sentence body as `$body*hh\r\n`.
pub fn sentence(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}\r\n")
}
