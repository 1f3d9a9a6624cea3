//! Hardware seams.
//!
//! Each trait is the narrow interface of one external collaborator. The run
//! loop only ever talks to hardware through these, so the same loop drives a
//! board, the host simulator, or scripted test doubles.

use crate::fault::FatalFault;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Milliseconds since boot.
pub type Millis = u64;

/// Bus address of one probe (its data pin on the board).
pub type SensorPin = u8;

pub type MacAddress = [u8; 6];

/// Monotonic time source with a blocking delay.
pub trait Clock {
    fn now_ms(&self) -> Millis;

    fn delay_ms(&mut self, ms: Millis);

    fn elapsed_since(&self, then: Millis) -> Millis {
        self.now_ms().saturating_sub(then)
    }
}

/// Watchdog that must be fed every loop iteration.
pub trait Watchdog {
    fn feed(&mut self, now: Millis);

    /// A hardware watchdog never returns `true` here: it resets the board
    /// instead. Software watchdogs report expiry so the caller can act.
    fn has_fired(&self, now: Millis) -> bool;
}

/// The only recovery primitive: a full device reset.
///
/// Returning from `restart` means the reset was simulated; the caller stops
/// iterating and hands control back to whoever booted the device.
pub trait Restart {
    fn restart(&mut self, cause: &FatalFault);
}

/// One-wire style temperature bus.
pub trait SensorBus {
    /// Ask a probe to start a conversion. Fire-and-forget.
    fn request_temperature(&mut self, pin: SensorPin);

    /// Last converted value in degrees Celsius, `None` on a disconnected
    /// probe or a checksum error.
    fn read(&mut self, pin: SensorPin) -> Option<f32>;

    /// Worst-case time between a conversion request and a valid read.
    fn conversion_delay_ms(&self) -> Millis {
        DS18B20_CONVERSION_DELAY_MS
    }
}

/// 12-bit resolution worst case.
pub const DS18B20_CONVERSION_DELAY_MS: Millis = 750;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// Outcome of one lease maintenance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseEvent {
    Nothing,
    RenewFailed,
    Renewed,
    RebindFailed,
    Rebound,
}

pub trait NetworkLink {
    /// Acquire an address for `mac`. `None` when no lease could be obtained.
    fn begin(&mut self, mac: &MacAddress) -> Option<Ipv4Addr>;

    fn maintain(&mut self) -> LeaseEvent;

    fn link_status(&self) -> LinkStatus;

    fn local_ip(&self) -> Ipv4Addr;
}

/// One accepted request connection.
pub trait Connection {
    type Error: core::fmt::Debug;

    /// True while the peer is connected or unread bytes remain.
    fn connected(&mut self) -> bool;

    /// Non-blocking single byte read; `WouldBlock` when nothing is buffered yet.
    fn read(&mut self) -> nb::Result<u8, Self::Error>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    fn flush(&mut self) -> Result<(), Self::Error>;

    fn stop(&mut self);
}

/// Non-blocking accept of at most one pending connection.
pub trait Listener {
    type Connection: Connection;

    fn accept(&mut self) -> Option<Self::Connection>;
}

/// Unacknowledged datagram transmit.
pub trait DatagramSink {
    type Error: core::fmt::Debug;

    fn send_to(&mut self, destination: SocketAddrV4, payload: &[u8]) -> Result<(), Self::Error>;
}

/// Motion sensor output.
pub trait PresenceInput {
    fn is_active(&mut self) -> bool;
}
