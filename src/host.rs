//! std implementations of the hardware seams, for running the device on a
//! regular host.

use crate::hal::{Clock, Connection, DatagramSink, Listener, Millis};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 64;
const WRITE_RETRY_MS: u64 = 1;

/// Milliseconds since construction, backed by `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { boot: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        self.boot.elapsed().as_millis() as Millis
    }

    fn delay_ms(&mut self, ms: Millis) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Non-blocking TCP listener.
#[derive(Debug)]
pub struct HostListener {
    listener: TcpListener,
}

impl HostListener {
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for HostListener {
    type Connection = HostConnection;

    fn accept(&mut self) -> Option<Self::Connection> {
        match self.listener.accept() {
            Ok((stream, peer)) => match HostConnection::new(stream) {
                Ok(conn) => {
                    debug!("Client connected: {}", peer);
                    Some(conn)
                }
                Err(e) => {
                    warn!("Failed to prepare connection from {}: {}", peer, e);
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                None
            }
        }
    }
}

/// Accepted TCP stream with a small read-ahead buffer.
#[derive(Debug)]
pub struct HostConnection {
    stream: TcpStream,
    open: bool,
    chunk: [u8; READ_CHUNK],
    pos: usize,
    len: usize,
}

impl HostConnection {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            open: true,
            chunk: [0; READ_CHUNK],
            pos: 0,
            len: 0,
        })
    }
}

impl Connection for HostConnection {
    type Error = io::Error;

    fn connected(&mut self) -> bool {
        self.open || self.pos < self.len
    }

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if self.pos < self.len {
            let byte = self.chunk[self.pos];
            self.pos += 1;
            return Ok(byte);
        }
        if !self.open {
            return Err(nb::Error::WouldBlock);
        }
        match self.stream.read(&mut self.chunk) {
            Ok(0) => {
                self.open = false;
                Err(nb::Error::WouldBlock)
            }
            Ok(n) => {
                self.pos = 1;
                self.len = n;
                Ok(self.chunk[0])
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(nb::Error::WouldBlock),
            Err(e) => {
                self.open = false;
                Err(nb::Error::Other(e))
            }
        }
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<(), Self::Error> {
        while !data.is_empty() {
            match self.stream.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(WRITE_RETRY_MS));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush()
    }

    fn stop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.open = false;
        self.pos = 0;
        self.len = 0;
    }
}

/// UDP socket used for multicast telemetry.
#[derive(Debug)]
pub struct MulticastSink {
    socket: UdpSocket,
}

impl MulticastSink {
    pub fn bind(ttl: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl DatagramSink for MulticastSink {
    type Error = io::Error;

    fn send_to(&mut self, destination: SocketAddrV4, payload: &[u8]) -> Result<(), Self::Error> {
        self.socket.send_to(payload, destination).map(|_| ())
    }
}
