//! Round-robin multicast telemetry.
//!
//! Each datagram carries one sensor in picomq publish framing:
//! `0x50 | topic | 0x00 | value-as-text`.

use crate::config::TelemetryConfig;
use crate::hal::{DatagramSink, Millis, SensorBus};
use crate::sensor::{Reading, SensorBank};
use arrayvec::ArrayString;
use core::fmt::Write;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::net::SocketAddrV4;
use thiserror::Error;
use tracing::{debug, trace};

/// picomq publish message type.
pub const PUBLISH_MARKER: u8 = 80;
pub const TOPIC_ROOT: &str = "celsius/";
pub const TOPIC_SUFFIX: &str = "/temperature";

pub const MAX_DATAGRAM_SIZE: usize = 128;
const MAX_PREFIX_LEN: usize = 32;
// `-f32::MAX` at two decimals is 43 characters.
const MAX_VALUE_LEN: usize = 48;

// marker + prefix + name + suffix + terminator + value
const_assert!(
    MAX_DATAGRAM_SIZE
        >= 1 + MAX_PREFIX_LEN + crate::config::MAX_NAME_LEN + TOPIC_SUFFIX.len() + 1 + MAX_VALUE_LEN
);

pub type DatagramBuffer = Vec<u8, MAX_DATAGRAM_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("datagram does not fit the fixed buffer")]
    Overflow,
    #[error("missing publish marker")]
    MissingMarker,
    #[error("missing topic terminator")]
    MissingTerminator,
    #[error("topic or value is not valid UTF-8")]
    InvalidUtf8,
    #[error("value is not a number")]
    InvalidValue,
}

/// Build one publish datagram for `name`.
pub fn encode_datagram(prefix: &str, name: &str, reading: Reading) -> Result<DatagramBuffer, TelemetryError> {
    let mut value = ArrayString::<MAX_VALUE_LEN>::new();
    match reading {
        Reading::Celsius(v) => write!(value, "{:.2}", v).map_err(|_| TelemetryError::Overflow)?,
        Reading::Absent => value.push_str("nan"),
    }

    let mut datagram = DatagramBuffer::new();
    datagram.push(PUBLISH_MARKER).map_err(|_| TelemetryError::Overflow)?;
    for part in [prefix, name, TOPIC_SUFFIX] {
        datagram
            .extend_from_slice(part.as_bytes())
            .map_err(|()| TelemetryError::Overflow)?;
    }
    datagram.push(0).map_err(|_| TelemetryError::Overflow)?;
    datagram
        .extend_from_slice(value.as_bytes())
        .map_err(|()| TelemetryError::Overflow)?;
    Ok(datagram)
}

/// Decoded publish datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datagram<'a> {
    pub topic: &'a str,
    pub value: Reading,
}

impl<'a> Datagram<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, TelemetryError> {
        let (&marker, rest) = bytes.split_first().ok_or(TelemetryError::MissingMarker)?;
        if marker != PUBLISH_MARKER {
            return Err(TelemetryError::MissingMarker);
        }
        let split = rest.iter().position(|&b| b == 0).ok_or(TelemetryError::MissingTerminator)?;
        let topic = core::str::from_utf8(&rest[..split]).map_err(|_| TelemetryError::InvalidUtf8)?;
        let text = core::str::from_utf8(&rest[split + 1..]).map_err(|_| TelemetryError::InvalidUtf8)?;
        let value = if text.eq_ignore_ascii_case("nan") {
            Reading::Absent
        } else {
            Reading::Celsius(text.trim().parse().map_err(|_| TelemetryError::InvalidValue)?)
        };
        Ok(Self { topic, value })
    }

    /// The sensor name, when the topic has the device's shape.
    pub fn sensor_name(&self) -> Option<&'a str> {
        self.topic
            .strip_prefix(TOPIC_ROOT)?
            .strip_suffix(TOPIC_SUFFIX)?
            .split_once('/')
            .map(|(_, name)| name)
    }
}

/// Round-robin position and publish timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCursor {
    next_index: usize,
    last_publish_at: Millis,
    bank_size: usize,
}

impl PublishCursor {
    pub fn new(bank_size: usize, now: Millis) -> Self {
        Self {
            next_index: 0,
            last_publish_at: now,
            bank_size: bank_size.max(1),
        }
    }

    /// Spacing between publishes so each sensor appears once per interval.
    pub fn slot_ms(&self, publish_interval_ms: Millis) -> Millis {
        publish_interval_ms / self.bank_size as Millis
    }

    pub fn is_due(&self, now: Millis, publish_interval_ms: Millis) -> bool {
        now.saturating_sub(self.last_publish_at) >= self.slot_ms(publish_interval_ms)
    }

    /// Returns the index that was current and moves to the next one.
    pub fn advance(&mut self, now: Millis) -> usize {
        let current = self.next_index;
        self.next_index = (self.next_index + 1) % self.bank_size;
        self.last_publish_at = now;
        current
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn last_publish_at(&self) -> Millis {
        self.last_publish_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryStats {
    pub datagrams_sent: u32,
    pub send_failures: u32,
    pub encode_failures: u32,
}

#[derive(Debug)]
pub struct TelemetryPublisher<D: DatagramSink> {
    sink: D,
    destination: SocketAddrV4,
    topic_prefix: ArrayString<MAX_PREFIX_LEN>,
    publish_interval_ms: Millis,
    cursor: PublishCursor,
    stats: TelemetryStats,
}

impl<D: DatagramSink> TelemetryPublisher<D> {
    pub fn new(sink: D, config: &TelemetryConfig, server_name: &str, bank_size: usize, now: Millis) -> Self {
        let mut topic_prefix = ArrayString::new();
        // Names are bounded by config capacity, so this always fits.
        let _ = write!(topic_prefix, "{}{}/", TOPIC_ROOT, server_name);

        Self {
            sink,
            destination: SocketAddrV4::new(config.group, config.port),
            topic_prefix,
            publish_interval_ms: config.publish_interval_ms,
            cursor: PublishCursor::new(bank_size, now),
            stats: TelemetryStats::default(),
        }
    }

    /// Both gates: the publish slot has passed and the current round has
    /// finished converting.
    pub fn is_due<B: SensorBus>(&self, now: Millis, bank: &SensorBank<B>) -> bool {
        self.cursor.is_due(now, self.publish_interval_ms) && bank.conversion_delay_elapsed(now)
    }

    /// Publish the next sensor if due. Returns the published index.
    pub fn poll<B: SensorBus>(&mut self, now: Millis, bank: &SensorBank<B>) -> Option<usize> {
        if !self.is_due(now, bank) {
            return None;
        }
        Some(self.publish_next(now, bank))
    }

    fn publish_next<B: SensorBus>(&mut self, now: Millis, bank: &SensorBank<B>) -> usize {
        let index = self.cursor.advance(now);
        let name = bank.name(index).unwrap_or_default();

        match encode_datagram(&self.topic_prefix, name, bank.read(index)) {
            Ok(datagram) => match self.sink.send_to(self.destination, &datagram) {
                Ok(()) => {
                    trace!("Published {}{}", self.topic_prefix, name);
                    self.stats.datagrams_sent += 1;
                }
                Err(e) => {
                    debug!("Telemetry datagram dropped: {:?}", e);
                    self.stats.send_failures += 1;
                }
            },
            Err(e) => {
                debug!("Telemetry datagram for {} not built: {}", name, e);
                self.stats.encode_failures += 1;
            }
        }
        index
    }

    pub fn cursor(&self) -> &PublishCursor {
        &self.cursor
    }

    pub fn stats(&self) -> &TelemetryStats {
        &self.stats
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let datagram = encode_datagram("celsius/celsius/", "hall", Reading::Celsius(21.5)).unwrap();
        let mut expected = vec![PUBLISH_MARKER];
        expected.extend_from_slice(b"celsius/celsius/hall/temperature");
        expected.push(0);
        expected.extend_from_slice(b"21.50");
        assert_eq!(&datagram[..], &expected[..]);
    }

    #[test]
    fn test_encode_absent_as_nan() {
        let datagram = encode_datagram("celsius/x/", "1", Reading::Absent).unwrap();
        assert!(datagram.ends_with(b"\0nan"));
    }

    #[test]
    fn test_encode_extreme_values_with_longest_names() {
        let server = "s".repeat(crate::config::MAX_NAME_LEN);
        let name = "n".repeat(crate::config::MAX_NAME_LEN);
        let prefix = format!("{}{}/", TOPIC_ROOT, server);
        for v in [f32::MAX, f32::MIN] {
            let datagram = encode_datagram(&prefix, &name, Reading::Celsius(v)).unwrap();
            assert!(datagram.ends_with(format!("\0{:.2}", v).as_bytes()));
            assert_eq!(Datagram::parse(&datagram).unwrap().value, Reading::Celsius(v));
        }
    }

    #[test]
    fn test_parse_inverts_encode() {
        let datagram = encode_datagram("celsius/celsius/", "attic", Reading::Celsius(-4.25)).unwrap();
        let parsed = Datagram::parse(&datagram).unwrap();
        assert_eq!(parsed.topic, "celsius/celsius/attic/temperature");
        assert_eq!(parsed.value, Reading::Celsius(-4.25));
        assert_eq!(parsed.sensor_name(), Some("attic"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Datagram::parse(b""), Err(TelemetryError::MissingMarker));
        assert_eq!(Datagram::parse(b"Xtopic\x001.0"), Err(TelemetryError::MissingMarker));
        assert_eq!(Datagram::parse(b"Ptopic1.0"), Err(TelemetryError::MissingTerminator));
        assert_eq!(Datagram::parse(b"Ptopic\x00warm"), Err(TelemetryError::InvalidValue));
    }

    #[test]
    fn test_cursor_slot_and_wrap() {
        let mut cursor = PublishCursor::new(3, 0);
        assert_eq!(cursor.slot_ms(3_000), 1_000);
        assert!(!cursor.is_due(999, 3_000));
        assert!(cursor.is_due(1_000, 3_000));

        assert_eq!(cursor.advance(1_000), 0);
        assert_eq!(cursor.advance(2_000), 1);
        assert_eq!(cursor.advance(3_000), 2);
        assert_eq!(cursor.advance(4_000), 0);
        assert_eq!(cursor.last_publish_at(), 4_000);
    }
}
