//! Request-line reading and response framing for the HTTP-like channel.
//!
//! Only what the device needs: one method, exact-match routes, headers that
//! are read and thrown away, and a fixed response header block.

use crate::config::RoutePath;
use crate::fault::FatalFault;
use crate::hal::{Clock, Connection, Millis};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, warn};

/// Capacity of the request token buffer. Longer tokens are truncated.
pub const BUFFER_SIZE: usize = 30;

pub const METRICS_PATH: &str = "/metrics";
pub const INDEX_PATH: &str = "/";

const_assert!(BUFFER_SIZE >= METRICS_PATH.len());

/// Target used when raw request/response echo is enabled.
pub const WIRE_TARGET: &str = "celsius::wire";

/// Fixed-capacity token buffer, cleared at the start of every read.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8, BUFFER_SIZE>,
    consumed: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.consumed = 0;
    }

    /// Store `byte` if there is room; the count advances either way.
    pub fn push(&mut self, byte: u8) {
        let _ = self.bytes.push(byte);
        self.consumed += 1;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Characters read before the terminator, stored or dropped.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_truncated(&self) -> bool {
        self.consumed > self.bytes.len()
    }

    pub fn matches(&self, token: &str) -> bool {
        self.as_bytes() == token.as_bytes()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub poll_interval_ms: Millis,
    pub echo: bool,
    /// Absolute time after which a stalled client is abandoned.
    pub deadline: Option<Millis>,
}

// Echoed bytes are logged in pieces of this size.
const ECHO_CHUNK: usize = 64;

/// Raw byte echo, independent of how much of the line fits the buffer.
struct Echo {
    enabled: bool,
    chunk: Vec<u8, ECHO_CHUNK>,
}

impl Echo {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            chunk: Vec::new(),
        }
    }

    fn push(&mut self, byte: u8) {
        if !self.enabled {
            return;
        }
        if self.chunk.is_full() {
            self.flush();
        }
        let _ = self.chunk.push(byte);
    }

    fn flush(&mut self) {
        debug!(target: WIRE_TARGET, "> {}", self.chunk.escape_ascii());
        self.chunk.clear();
    }

    fn finish(mut self) {
        if self.enabled {
            self.flush();
        }
    }
}

/// Read up to `terminator` into `buffer`, dropping `\r` everywhere.
///
/// Blocks while the peer is connected and has not sent the next byte yet,
/// sleeping `poll_interval_ms` between polls. Returns the number of
/// characters read (including those that did not fit); a disconnect before
/// the terminator returns what was read so far.
///
/// A client still silent past `deadline` is stopped and reported as
/// `FatalFault::WatchdogExpired`, the point where a board watchdog resets.
pub fn read_until<C, K>(
    conn: &mut C,
    clock: &mut K,
    buffer: &mut LineBuffer,
    terminator: u8,
    options: ReadOptions,
) -> Result<usize, FatalFault>
where
    C: Connection,
    K: Clock,
{
    buffer.clear();
    let mut echo = Echo::new(options.echo);

    while conn.connected() {
        let byte = match conn.read() {
            Ok(byte) => byte,
            Err(nb::Error::WouldBlock) => {
                if options.deadline.is_some_and(|deadline| clock.now_ms() > deadline) {
                    warn!("Client stalled past the watchdog timeout");
                    conn.stop();
                    echo.finish();
                    return Err(FatalFault::WatchdogExpired);
                }
                clock.delay_ms(options.poll_interval_ms);
                continue;
            }
            Err(nb::Error::Other(e)) => {
                debug!("Read failed: {:?}", e);
                conn.stop();
                break;
            }
        };

        if byte == b'\r' {
            continue;
        }
        if byte == terminator {
            break;
        }
        echo.push(byte);
        buffer.push(byte);
    }

    echo.finish();
    Ok(buffer.consumed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
}

impl Method {
    pub fn parse(token: &LineBuffer) -> Option<Self> {
        token.matches("GET").then_some(Method::Get)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Index,
    Json,
    Metrics,
    /// Headers only.
    Error,
}

/// Exact-match route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    measurements_path: RoutePath,
    metrics_enabled: bool,
}

impl RouteTable {
    pub fn new(measurements_path: RoutePath, metrics_enabled: bool) -> Self {
        Self {
            measurements_path,
            metrics_enabled,
        }
    }

    pub fn resolve(&self, path: &LineBuffer) -> Option<Route> {
        if path.matches(&self.measurements_path) {
            Some(Route::Json)
        } else if self.metrics_enabled && path.matches(METRICS_PATH) {
            Some(Route::Metrics)
        } else if path.matches(INDEX_PATH) {
            Some(Route::Index)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);

    pub fn reason(self) -> &'static str {
        if self.0 < 300 {
            "OK"
        } else {
            "Error"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Html,
    Json,
    PlainText,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Html => "text/html",
            ContentType::Json => "application/json",
            ContentType::PlainText => "text/plain",
        }
    }
}

/// `fmt::Write` over a connection. The first transport error is kept and
/// every later write is skipped.
pub struct ResponseWriter<'a, C: Connection> {
    conn: &'a mut C,
    echo: bool,
    error: Option<C::Error>,
}

impl<'a, C: Connection> ResponseWriter<'a, C> {
    pub fn new(conn: &'a mut C, echo: bool) -> Self {
        Self {
            conn,
            echo,
            error: None,
        }
    }

    pub fn write_headers(
        &mut self,
        status: StatusCode,
        server_name: &str,
        content_type: Option<ContentType>,
    ) -> core::fmt::Result {
        use core::fmt::Write;

        write!(self, "HTTP/1.1 {} {}\r\nServer: {}\r\n", status.0, status.reason(), server_name)?;
        if let Some(content_type) = content_type {
            write!(self, "Content-Type: {}; charset=utf-8\r\n", content_type.mime())?;
        }
        self.write_str("\r\n")
    }

    pub fn error(&self) -> Option<&C::Error> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<C::Error> {
        self.error
    }
}

impl<C: Connection> core::fmt::Write for ResponseWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.error.is_some() {
            return Err(core::fmt::Error);
        }
        if self.echo {
            debug!(target: WIRE_TARGET, "< {}", s);
        }
        self.conn.write_all(s.as_bytes()).map_err(|e| {
            self.error = Some(e);
            core::fmt::Error
        })
    }
}
