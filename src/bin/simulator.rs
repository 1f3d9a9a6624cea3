use celsius::config::DeviceConfig;
use celsius::fault::{FatalFault, ProcessExit, RestartRecorder};
use celsius::hal::Restart;
use celsius::host::{HostListener, MulticastSink, SystemClock};
use celsius::liveness::SoftwareWatchdog;
use celsius::scheduler::{Peripherals, Platform, RunLoop};
use celsius::sim::{LinkFaultConfig, ProbeFaultConfig, SimulatedBus, SimulatedLink, SimulatedPresence};
use clap::{App, Arg};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MULTICAST_TTL: u32 = 1;
const PRESENCE_SWITCH_PERCENT: f32 = 0.05;

struct HostPlatform;

impl Platform for HostPlatform {
    type Clock = SystemClock;
    type Watchdog = SoftwareWatchdog;
    type Restart = HostRestart;
    type Bus = SimulatedBus;
    type Link = SimulatedLink;
    type Listener = HostListener;
    type Telemetry = MulticastSink;
    type Presence = SimulatedPresence;
}

/// `exit` ends the process, `reboot` rebuilds the device in-process.
enum HostRestart {
    Exit(ProcessExit),
    Reboot(RestartRecorder),
}

impl Restart for HostRestart {
    fn restart(&mut self, cause: &FatalFault) {
        match self {
            HostRestart::Exit(exit) => exit.restart(cause),
            HostRestart::Reboot(recorder) => {
                warn!("Simulated reset: {}", cause);
                recorder.restart(cause);
            }
        }
    }
}

struct Options {
    port: u16,
    seed: u64,
    reboot: bool,
    probe_faults: ProbeFaultConfig,
    link_faults: LinkFaultConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("celsius-sim")
        .version("0.1.0")
        .about("Runs the Celsius controller on this host with simulated probes")
        .arg(
            Arg::with_name("preset")
                .long("preset")
                .value_name("PRESET")
                .help("Firmware variant to emulate")
                .takes_value(true)
                .possible_values(&["primary", "presence"])
                .default_value("primary"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON file overriding preset values")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for the request channel, overrides http_port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for simulated probes and link")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("absent-percent")
                .long("absent-percent")
                .value_name("PERCENT")
                .help("Chance that a probe read fails")
                .takes_value(true)
                .default_value("2"),
        )
        .arg(
            Arg::with_name("renew-failure-percent")
                .long("renew-failure-percent")
                .value_name("PERCENT")
                .help("Chance per iteration that the lease renewal fails")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("on-fault")
                .long("on-fault")
                .value_name("ACTION")
                .help("What a device restart does on this host")
                .takes_value(true)
                .possible_values(&["exit", "reboot"])
                .default_value("reboot"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut config = match matches.value_of("preset") {
        Some("presence") => DeviceConfig::presence(),
        _ => DeviceConfig::primary(),
    };
    if let Some(path) = matches.value_of("config") {
        config = config.overlay_file(Path::new(path))?;
    }
    if let Some(port) = matches.value_of("port") {
        config.http_port = port.parse()?;
    }
    config.validate()?;

    let options = Options {
        port: config.http_port,
        seed: matches.value_of("seed").unwrap_or("1").parse()?,
        reboot: matches.value_of("on-fault") != Some("exit"),
        probe_faults: ProbeFaultConfig {
            absent_percent: matches.value_of("absent-percent").unwrap_or("2").parse()?,
            ..ProbeFaultConfig::default()
        },
        link_faults: LinkFaultConfig {
            renew_failure_percent: matches.value_of("renew-failure-percent").unwrap_or("0").parse()?,
            renew_every: 10_000,
            ..LinkFaultConfig::default()
        },
    };

    println!("🌡️  Celsius Controller Simulator");
    println!("================================");

    let mut boots: u64 = 0;
    loop {
        let seed = options.seed.wrapping_add(boots);
        let peripherals = build_peripherals(&config, &options, seed)?;
        info!("Boot #{} ({} on port {})", boots + 1, config.server_name, options.port);

        let mut device: RunLoop<HostPlatform> = RunLoop::new(config.clone(), peripherals);
        // With `--on-fault exit` the process ends inside `run`.
        let fault = device.run();
        drop(device);

        info!("Rebooting after: {}", fault);
        boots += 1;
    }
}

fn build_peripherals(
    config: &DeviceConfig,
    options: &Options,
    seed: u64,
) -> Result<Peripherals<HostPlatform>, Box<dyn std::error::Error>> {
    let listener = HostListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, options.port)))?;

    let telemetry = if config.telemetry.is_some() {
        match MulticastSink::bind(MULTICAST_TTL) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("Telemetry disabled, cannot open UDP socket: {}", e);
                None
            }
        }
    } else {
        None
    };

    let restart = if options.reboot {
        HostRestart::Reboot(RestartRecorder::new())
    } else {
        HostRestart::Exit(ProcessExit::default())
    };

    Ok(Peripherals {
        clock: SystemClock::new(),
        watchdog: SoftwareWatchdog::new(config.watchdog_timeout_ms),
        restart,
        bus: SimulatedBus::new(&config.sensors, options.probe_faults, seed),
        link: SimulatedLink::new(Ipv4Addr::LOCALHOST, options.link_faults, seed),
        listener,
        telemetry,
        presence: config
            .features
            .enable_presence
            .then(|| SimulatedPresence::new(PRESENCE_SWITCH_PERCENT, seed)),
    })
}
