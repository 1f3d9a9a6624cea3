use crate::config::{SensorName, SensorSpec, MAX_SENSORS};
use crate::hal::{Millis, SensorBus, SensorPin};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Cached value of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Reading {
    Celsius(f32),
    /// No valid reading yet, a disconnected probe, or a bad checksum.
    #[default]
    Absent,
}

impl Reading {
    /// Non-finite bus values are treated like a failed conversion.
    pub fn from_bus(value: Option<f32>) -> Self {
        match value {
            Some(v) if v.is_finite() => Reading::Celsius(v),
            _ => Reading::Absent,
        }
    }

    pub fn value(&self) -> Option<f32> {
        match self {
            Reading::Celsius(v) => Some(*v),
            Reading::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Reading::Absent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub pin: SensorPin,
    pub name: SensorName,
    pub reading: Reading,
}

/// Fixed bank of probes. Index order is display and publish order.
#[derive(Debug)]
pub struct SensorBank<B: SensorBus> {
    bus: B,
    sensors: Vec<Sensor, MAX_SENSORS>,
    last_conversion_started_at: Option<Millis>,
    conversion_delay_ms: Millis,
    // Set by `begin_conversion_round`, cleared once the cache was refreshed.
    collection_pending: bool,
    rounds_started: u32,
}

impl<B: SensorBus> SensorBank<B> {
    pub fn new(bus: B, specs: &[SensorSpec]) -> Self {
        let conversion_delay_ms = bus.conversion_delay_ms();
        let sensors = specs
            .iter()
            .take(MAX_SENSORS)
            .map(|spec| Sensor {
                pin: spec.pin,
                name: spec.name.clone(),
                reading: Reading::Absent,
            })
            .collect();

        Self {
            bus,
            sensors,
            last_conversion_started_at: None,
            conversion_delay_ms,
            collection_pending: false,
            rounds_started: 0,
        }
    }

    /// Request a conversion from every probe and remember when.
    pub fn begin_conversion_round(&mut self, now: Millis) {
        debug!("Updating readings...");
        for sensor in &self.sensors {
            self.bus.request_temperature(sensor.pin);
        }
        self.last_conversion_started_at = Some(now);
        self.collection_pending = true;
        self.rounds_started = self.rounds_started.wrapping_add(1);
    }

    /// `false` until the first round has been started.
    pub fn conversion_delay_elapsed(&self, now: Millis) -> bool {
        self.remaining_conversion_delay(now) == Some(0)
    }

    /// Time left before the current round may be read, `None` before the
    /// first round.
    pub fn remaining_conversion_delay(&self, now: Millis) -> Option<Millis> {
        self.last_conversion_started_at
            .map(|started| self.conversion_delay_ms.saturating_sub(now.saturating_sub(started)))
    }

    /// Copy the finished round from the bus into the cache. Does nothing when
    /// the round is still converting or was already collected.
    pub fn collect(&mut self, now: Millis) -> bool {
        if !self.collection_pending || !self.conversion_delay_elapsed(now) {
            return false;
        }
        for sensor in self.sensors.iter_mut() {
            sensor.reading = Reading::from_bus(self.bus.read(sensor.pin));
            trace!(sensor = sensor.name.as_str(), reading = ?sensor.reading, "collected");
        }
        self.collection_pending = false;
        true
    }

    pub fn read(&self, index: usize) -> Reading {
        self.sensors.get(index).map_or(Reading::Absent, |s| s.reading)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.sensors.get(index).map(|s| s.name.as_str())
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn last_conversion_started_at(&self) -> Option<Millis> {
        self.last_conversion_started_at
    }

    pub fn conversion_delay_ms(&self) -> Millis {
        self.conversion_delay_ms
    }

    pub fn rounds_started(&self) -> u32 {
        self.rounds_started
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}
