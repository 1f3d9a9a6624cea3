//! Simulated peripherals for the host build.
//!
//! All randomness comes from a seeded linear congruential generator so a
//! simulator run is repeatable.

use crate::config::SensorSpec;
use crate::hal::{LeaseEvent, LinkStatus, MacAddress, NetworkLink, PresenceInput, SensorBus, SensorPin};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, info};

const MAX_PROBES: usize = crate::config::MAX_SENSORS;
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.state >> 33) as u32
    }

    /// Uniform in `[0, 1)`.
    pub fn next_unit(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    pub fn chance(&mut self, percent: f32) -> bool {
        self.next_unit() * 100.0 < percent
    }
}

impl Default for Lcg {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeFaultConfig {
    /// Chance that a read reports a disconnected probe.
    pub absent_percent: f32,
    /// Peak-to-peak noise added to each conversion, in degrees.
    pub noise_c: f32,
}

impl Default for ProbeFaultConfig {
    fn default() -> Self {
        Self {
            absent_percent: 2.0,
            noise_c: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    pin: SensorPin,
    base_c: f32,
    converted: Option<f32>,
    disconnected: bool,
}

/// DS18B20 bank. A probe only has a value after its first conversion.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    probes: Vec<Probe, MAX_PROBES>,
    faults: ProbeFaultConfig,
    rng: Lcg,
}

impl SimulatedBus {
    pub fn new(sensors: &[SensorSpec], faults: ProbeFaultConfig, seed: u64) -> Self {
        let mut rng = Lcg::new(seed);
        let probes = sensors
            .iter()
            .take(MAX_PROBES)
            .map(|spec| Probe {
                pin: spec.pin,
                base_c: 18.0 + rng.next_unit() * 6.0,
                converted: None,
                disconnected: false,
            })
            .collect();
        Self { probes, faults, rng }
    }

    /// Permanently unplug a probe.
    pub fn disconnect(&mut self, pin: SensorPin) {
        if let Some(probe) = self.probes.iter_mut().find(|p| p.pin == pin) {
            probe.disconnected = true;
        }
    }

    pub fn set_base(&mut self, pin: SensorPin, celsius: f32) {
        if let Some(probe) = self.probes.iter_mut().find(|p| p.pin == pin) {
            probe.base_c = celsius;
        }
    }
}

impl SensorBus for SimulatedBus {
    fn request_temperature(&mut self, pin: SensorPin) {
        let noise = (self.rng.next_unit() - 0.5) * self.faults.noise_c;
        if let Some(probe) = self.probes.iter_mut().find(|p| p.pin == pin) {
            // Sensor resolution is 1/16 degree.
            probe.converted = Some(((probe.base_c + noise) * 16.0).round() / 16.0);
        }
    }

    fn read(&mut self, pin: SensorPin) -> Option<f32> {
        let glitch = self.rng.chance(self.faults.absent_percent);
        let probe = self.probes.iter().find(|p| p.pin == pin)?;
        if probe.disconnected || glitch {
            debug!("Probe on pin {} did not answer", pin);
            return None;
        }
        probe.converted
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LinkFaultConfig {
    /// Refuse the lease at boot.
    pub fail_acquisition: bool,
    /// Chance per maintenance call of a failed renew.
    pub renew_failure_percent: f32,
    /// Chance per maintenance call of the cable being pulled.
    pub link_loss_percent: f32,
    /// Maintenance calls between successful renewals; 0 never renews.
    pub renew_every: u32,
}

/// Link with a static lease and injectable failures.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    address: Ipv4Addr,
    faults: LinkFaultConfig,
    rng: Lcg,
    maintain_calls: u32,
    link_lost: bool,
}

impl SimulatedLink {
    pub fn new(address: Ipv4Addr, faults: LinkFaultConfig, seed: u64) -> Self {
        Self {
            address,
            faults,
            rng: Lcg::new(seed),
            maintain_calls: 0,
            link_lost: false,
        }
    }
}

impl NetworkLink for SimulatedLink {
    fn begin(&mut self, mac: &MacAddress) -> Option<Ipv4Addr> {
        info!(
            "Lease request from {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );
        (!self.faults.fail_acquisition).then_some(self.address)
    }

    fn maintain(&mut self) -> LeaseEvent {
        self.maintain_calls = self.maintain_calls.wrapping_add(1);
        // A pulled cable shows up at the next status check.
        if !self.link_lost && self.rng.chance(self.faults.link_loss_percent) {
            self.link_lost = true;
        }
        if self.rng.chance(self.faults.renew_failure_percent) {
            return LeaseEvent::RenewFailed;
        }
        if self.faults.renew_every > 0 && self.maintain_calls % self.faults.renew_every == 0 {
            return LeaseEvent::Renewed;
        }
        LeaseEvent::Nothing
    }

    fn link_status(&self) -> LinkStatus {
        if self.link_lost {
            LinkStatus::Down
        } else {
            LinkStatus::Up
        }
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.address
    }
}

/// Motion that comes and goes in bursts.
#[derive(Debug, Clone)]
pub struct SimulatedPresence {
    rng: Lcg,
    active: bool,
    switch_percent: f32,
}

impl SimulatedPresence {
    pub fn new(switch_percent: f32, seed: u64) -> Self {
        Self {
            rng: Lcg::new(seed),
            active: false,
            switch_percent,
        }
    }
}

impl PresenceInput for SimulatedPresence {
    fn is_active(&mut self) -> bool {
        if self.rng.chance(self.switch_percent) {
            self.active = !self.active;
        }
        self.active
    }
}
