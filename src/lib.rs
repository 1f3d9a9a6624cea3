//! # Celsius
//!
//! A self-contained temperature controller: a fixed bank of DS18B20-style
//! probes sampled on a single cooperative loop, served over a tiny HTTP-like
//! request channel and broadcast as multicast telemetry.
//!
//! ## Features
//!
//! - **Conversion scheduling**: periodic conversion rounds with a known worst-case delay
//! - **Request serving**: one connection at a time, fixed route table, three body kinds
//! - **Telemetry**: round-robin multicast datagrams, one sensor per publish slot
//! - **Liveness supervision**: link and lease checks, forced restart when wedged
//! - **Embedded-friendly**: fixed-capacity buffers, no allocation in the loop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use celsius::config::DeviceConfig;
//! use celsius::scheduler::{Peripherals, RunLoop};
//!
//! let config = DeviceConfig::primary();
//! let mut device = RunLoop::new(config, peripherals);
//!
//! // Runs until a fatal fault was handed to the restart capability
//! let fault = device.run();
//! ```
//!
//! ## Architecture
//!
//! - [`scheduler`] - Run loop and composition root
//! - [`sensor`] - Sensor bank and cached readings
//! - [`server`] - Request parsing and dispatch
//! - [`telemetry`] - Round-robin telemetry broadcast
//! - [`link`] - Network link and address lease supervision
//! - [`liveness`] - Request liveness policy and software watchdog
//! - [`hal`] - Hardware traits the device is built against

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod fault;
pub mod hal;
pub mod host;
pub mod link;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod render;
pub mod scheduler;
pub mod sensor;
pub mod server;
pub mod sim;
pub mod telemetry;

// Re-export main public types for convenience
pub use config::DeviceConfig;
pub use fault::FatalFault;
pub use scheduler::{Peripherals, Platform, RunLoop};
pub use sensor::{Reading, SensorBank};
