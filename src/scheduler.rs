//! The run loop.
//!
//! One thread, one unbounded iteration. Every iteration feeds the watchdog
//! first, then gives each duty one bounded turn in a fixed order.

use crate::config::DeviceConfig;
use crate::fault::FatalFault;
use crate::hal::{
    Clock, DatagramSink, Listener, Millis, NetworkLink, PresenceInput, Restart, SensorBus, Watchdog,
};
use crate::link::LinkSupervisor;
use crate::liveness::LivenessMonitor;
use crate::presence::PresenceDetector;
use crate::sensor::SensorBank;
use crate::server::{RequestServer, ServeOutcome};
use crate::telemetry::TelemetryPublisher;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// Delay between watchdog checks while waiting to be reset.
const WATCHDOG_SPIN_POLL_MS: Millis = 1;

/// The hardware a device is built from.
pub trait Platform {
    type Clock: Clock;
    type Watchdog: Watchdog;
    type Restart: Restart;
    type Bus: SensorBus;
    type Link: NetworkLink;
    type Listener: Listener;
    type Telemetry: DatagramSink;
    type Presence: PresenceInput;
}

/// Peripheral instances, handed over once at start-up.
pub struct Peripherals<P: Platform> {
    pub clock: P::Clock,
    pub watchdog: P::Watchdog,
    pub restart: P::Restart,
    pub bus: P::Bus,
    pub link: P::Link,
    pub listener: P::Listener,
    pub telemetry: Option<P::Telemetry>,
    pub presence: Option<P::Presence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoopStats {
    pub iterations: u64,
    pub conversion_rounds: u32,
    pub datagrams_published: u32,
    pub requests_served: u32,
}

/// Composition root: owns every component and all mutable device state.
pub struct RunLoop<P: Platform> {
    config: DeviceConfig,
    clock: P::Clock,
    watchdog: P::Watchdog,
    restart: P::Restart,
    bank: SensorBank<P::Bus>,
    link: LinkSupervisor<P::Link>,
    server: RequestServer<P::Listener>,
    publisher: Option<TelemetryPublisher<P::Telemetry>>,
    presence: Option<PresenceDetector<P::Presence>>,
    liveness: LivenessMonitor,
    stats: LoopStats,
}

impl<P: Platform> RunLoop<P> {
    pub fn new(config: DeviceConfig, peripherals: Peripherals<P>) -> Self {
        let Peripherals {
            clock,
            watchdog,
            restart,
            bus,
            link,
            listener,
            telemetry,
            presence,
        } = peripherals;
        let now = clock.now_ms();

        let bank = SensorBank::new(bus, &config.sensors);

        let publisher = match (config.telemetry, telemetry) {
            (Some(settings), Some(sink)) => Some(TelemetryPublisher::new(
                sink,
                &settings,
                &config.server_name,
                bank.len(),
                now,
            )),
            (Some(_), None) => {
                warn!("Telemetry configured but no datagram sink provided");
                None
            }
            (None, _) => None,
        };

        let presence = if config.features.enable_presence {
            if presence.is_none() {
                warn!("Presence enabled but no presence input provided");
            }
            presence.map(|input| PresenceDetector::new(input, config.presence_hold_ms))
        } else {
            None
        };

        Self {
            link: LinkSupervisor::new(link, config.dhcp_retry_delay_ms),
            server: RequestServer::new(listener, &config),
            liveness: LivenessMonitor::new(config.reboot_timeout_ms, now),
            clock,
            watchdog,
            restart,
            bank,
            publisher,
            presence,
            stats: LoopStats::default(),
            config,
        }
    }

    /// Start-up sequence: network, first conversion round, watchdog.
    pub fn boot(&mut self) -> Result<(), FatalFault> {
        info!("{} starting with {} sensors", self.config.server_name, self.bank.len());

        self.link.setup(&self.config.mac, &mut self.clock)?;

        if self.config.reading_update_interval_ms.is_some() {
            self.begin_round();
        }

        self.watchdog.feed(self.clock.now_ms());
        Ok(())
    }

    /// One pass over every duty. `Ok` carries what happened to the request
    /// slot this iteration.
    pub fn iterate(&mut self) -> Result<Option<ServeOutcome>, FatalFault> {
        let now = self.clock.now_ms();
        self.watchdog.feed(now);
        self.stats.iterations += 1;

        if let Some(detector) = self.presence.as_mut() {
            detector.update(now);
        }

        if self.conversion_round_due(now) {
            self.begin_round();
        }
        self.bank.collect(now);

        if let Some(publisher) = self.publisher.as_mut() {
            if publisher.poll(now, &self.bank).is_some() {
                self.stats.datagrams_published += 1;
            }
        }

        self.link.maintain()?;

        let presence = self.presence.as_ref().map(PresenceDetector::is_present);
        let outcome = self.server.serve(&mut self.clock, &mut self.bank, presence)?;
        let served = outcome.is_some_and(|o| o.is_served());
        if served {
            self.stats.requests_served += 1;
        }

        self.liveness.record(self.clock.now_ms(), served)?;
        Ok(outcome)
    }

    /// Boot and iterate until a fatal fault, then escalate it. Returns only
    /// when the restart capability simulated the reset.
    pub fn run(&mut self) -> FatalFault {
        let fault = match self.boot() {
            Ok(()) => loop {
                if let Err(fault) = self.iterate() {
                    break fault;
                }
            },
            Err(fault) => fault,
        };
        self.escalate(fault)
    }

    fn escalate(&mut self, fault: FatalFault) -> FatalFault {
        if fault.awaits_watchdog() {
            error!("{}, waiting for the watchdog", fault);
            // Deliberately no feeding from here on.
            while !self.watchdog.has_fired(self.clock.now_ms()) {
                self.clock.delay_ms(WATCHDOG_SPIN_POLL_MS);
            }
        }
        self.restart.restart(&fault);
        fault
    }

    fn conversion_round_due(&self, now: Millis) -> bool {
        match (self.config.reading_update_interval_ms, self.bank.last_conversion_started_at()) {
            (Some(_), None) => true,
            (Some(interval), Some(started)) => now.saturating_sub(started) >= interval,
            (None, _) => false,
        }
    }

    fn begin_round(&mut self) {
        self.bank.begin_conversion_round(self.clock.now_ms());
        self.stats.conversion_rounds += 1;
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn bank(&self) -> &SensorBank<P::Bus> {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut SensorBank<P::Bus> {
        &mut self.bank
    }

    pub fn server(&self) -> &RequestServer<P::Listener> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut RequestServer<P::Listener> {
        &mut self.server
    }

    pub fn publisher(&self) -> Option<&TelemetryPublisher<P::Telemetry>> {
        self.publisher.as_ref()
    }

    pub fn link(&self) -> &LinkSupervisor<P::Link> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkSupervisor<P::Link> {
        &mut self.link
    }

    pub fn presence(&self) -> Option<&PresenceDetector<P::Presence>> {
        self.presence.as_ref()
    }

    pub fn presence_mut(&mut self) -> Option<&mut PresenceDetector<P::Presence>> {
        self.presence.as_mut()
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn clock(&self) -> &P::Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut P::Clock {
        &mut self.clock
    }

    pub fn watchdog(&self) -> &P::Watchdog {
        &self.watchdog
    }

    pub fn restart_handle(&self) -> &P::Restart {
        &self.restart
    }
}
