use crate::config::{DeviceConfig, FreshnessPolicy, SensorName};
use crate::fault::FatalFault;
use crate::hal::{Clock, Connection, Listener, Millis, SensorBus};
use crate::protocol::{
    read_until, ContentType, LineBuffer, Method, ReadOptions, ResponseWriter, Route, RouteTable,
    StatusCode,
};
use crate::render::{render_measurements, MeasurementFormat, JSON, PROMETHEUS};
use crate::sensor::SensorBank;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const INDEX_HTML: &str = include_str!("index.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServeOutcome {
    /// A response was written and the connection closed.
    Responded { status: StatusCode, route: Route },
    /// The peer went away before the request was drained; nothing was sent.
    Disconnected,
}

impl ServeOutcome {
    pub fn is_served(&self) -> bool {
        matches!(self, ServeOutcome::Responded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerStats {
    pub connections_accepted: u32,
    pub responses_sent: u32,
    pub bad_requests: u32,
    pub not_found: u32,
    pub disconnected: u32,
    pub write_failures: u32,
    pub stalled: u32,
}

/// Serves at most one connection per call, start to finish.
#[derive(Debug)]
pub struct RequestServer<L: Listener> {
    listener: L,
    routes: RouteTable,
    server_name: SensorName,
    freshness: FreshnessPolicy,
    read_options: ReadOptions,
    read_timeout_ms: Millis,
    response_grace_ms: Millis,
    buffer: LineBuffer,
    stats: ServerStats,
}

impl<L: Listener> RequestServer<L> {
    pub fn new(listener: L, config: &DeviceConfig) -> Self {
        Self {
            listener,
            routes: RouteTable::new(
                config.measurements_path.clone(),
                config.features.enable_metrics_route,
            ),
            server_name: config.server_name.clone(),
            freshness: config.freshness,
            read_options: ReadOptions {
                poll_interval_ms: config.read_poll_interval_ms,
                echo: config.features.echo_raw_bytes,
                deadline: None,
            },
            read_timeout_ms: config.watchdog_timeout_ms,
            response_grace_ms: config.response_grace_ms,
            buffer: LineBuffer::new(),
            stats: ServerStats::default(),
        }
    }

    /// Accept and fully handle one pending connection. `Ok(None)` when
    /// nobody was waiting.
    ///
    /// `presence` is `Some` only when presence detection is enabled; it
    /// selects the nested JSON shape. A client that stays silent for the
    /// watchdog timeout ends the request with `WatchdogExpired`.
    pub fn serve<K, B>(
        &mut self,
        clock: &mut K,
        bank: &mut SensorBank<B>,
        presence: Option<bool>,
    ) -> Result<Option<ServeOutcome>, FatalFault>
    where
        K: Clock,
        B: SensorBus,
    {
        let Some(mut conn) = self.listener.accept() else {
            return Ok(None);
        };
        self.stats.connections_accepted += 1;

        let options = ReadOptions {
            deadline: Some(clock.now_ms().saturating_add(self.read_timeout_ms)),
            ..self.read_options
        };
        let (status, route) = match self.parse_request(&mut conn, clock, options) {
            Ok(parsed) => parsed,
            Err(fault) => {
                self.stats.stalled += 1;
                return Err(fault);
            }
        };

        if !conn.connected() {
            debug!("Client left before the request was complete");
            self.stats.disconnected += 1;
            conn.stop();
            return Ok(Some(ServeOutcome::Disconnected));
        }

        info!("{} -> {}", status.0, route_label(route));
        self.respond(&mut conn, clock, bank, presence, status, route);

        if let Err(e) = conn.flush() {
            debug!("Flush failed: {:?}", e);
        }
        clock.delay_ms(self.response_grace_ms);
        conn.stop();

        self.stats.responses_sent += 1;
        Ok(Some(ServeOutcome::Responded { status, route }))
    }

    // AwaitMethod -> AwaitPath -> ConsumeHeaders
    fn parse_request<C: Connection, K: Clock>(
        &mut self,
        conn: &mut C,
        clock: &mut K,
        options: ReadOptions,
    ) -> Result<(StatusCode, Route), FatalFault> {
        let mut status = StatusCode::OK;
        let mut route = Route::Error;

        read_until(conn, clock, &mut self.buffer, b' ', options)?;
        if Method::parse(&self.buffer).is_some() {
            read_until(conn, clock, &mut self.buffer, b' ', options)?;
            match self.routes.resolve(&self.buffer) {
                Some(resolved) => route = resolved,
                None => {
                    status = StatusCode::NOT_FOUND;
                    self.stats.not_found += 1;
                }
            }
        } else {
            status = StatusCode::BAD_REQUEST;
            self.stats.bad_requests += 1;
        }

        // Drain the remaining header lines regardless of the route.
        while read_until(conn, clock, &mut self.buffer, b'\n', options)? > 0 {}

        Ok((status, route))
    }

    fn respond<C, K, B>(
        &mut self,
        conn: &mut C,
        clock: &mut K,
        bank: &mut SensorBank<B>,
        presence: Option<bool>,
        status: StatusCode,
        route: Route,
    ) where
        C: Connection,
        K: Clock,
        B: SensorBus,
    {
        let echo = self.read_options.echo;
        let result = match route {
            Route::Index => {
                let mut writer = ResponseWriter::new(conn, echo);
                writer
                    .write_headers(status, &self.server_name, Some(ContentType::Html))
                    .and_then(|()| core::fmt::Write::write_str(&mut writer, INDEX_HTML))
            }
            Route::Json => self.respond_measurements(conn, clock, bank, presence, &JSON),
            Route::Metrics => self.respond_measurements(conn, clock, bank, presence, &PROMETHEUS),
            Route::Error => ResponseWriter::new(conn, echo).write_headers(status, &self.server_name, None),
        };

        if result.is_err() {
            warn!("Response to client was cut short");
            self.stats.write_failures += 1;
        }
    }

    fn respond_measurements<C, K, B>(
        &self,
        conn: &mut C,
        clock: &mut K,
        bank: &mut SensorBank<B>,
        presence: Option<bool>,
        format: &MeasurementFormat,
    ) -> core::fmt::Result
    where
        C: Connection,
        K: Clock,
        B: SensorBus,
    {
        self.ensure_fresh(clock, bank);

        let mut writer = ResponseWriter::new(conn, self.read_options.echo);
        writer.write_headers(StatusCode::OK, &self.server_name, Some(format.content_type))?;
        let entries = bank.sensors().iter().map(|s| (s.name.as_str(), s.reading));
        render_measurements(&mut writer, format, presence, entries)
    }

    fn ensure_fresh<K: Clock, B: SensorBus>(&self, clock: &mut K, bank: &mut SensorBank<B>) {
        match self.freshness {
            FreshnessPolicy::AwaitCurrentRound => match bank.remaining_conversion_delay(clock.now_ms()) {
                Some(0) => {}
                Some(remaining) => clock.delay_ms(remaining),
                None => {
                    // No round yet; fall back to paying for one.
                    bank.begin_conversion_round(clock.now_ms());
                    clock.delay_ms(bank.conversion_delay_ms());
                }
            },
            FreshnessPolicy::ConvertPerRequest => {
                bank.begin_conversion_round(clock.now_ms());
                clock.delay_ms(bank.conversion_delay_ms());
            }
        }
        bank.collect(clock.now_ms());
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }
}

fn route_label(route: Route) -> &'static str {
    match route {
        Route::Index => "index",
        Route::Json => "json",
        Route::Metrics => "metrics",
        Route::Error => "error",
    }
}
