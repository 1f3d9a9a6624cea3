use celsius::protocol::{INDEX_PATH, METRICS_PATH};
use celsius::sensor::Reading;
use celsius::telemetry::{Datagram, MAX_DATAGRAM_SIZE};
use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_JSON_PATH: &str = "/temperature.json";
const DEFAULT_GROUP: &str = "224.0.1.80";
const DEFAULT_GROUP_PORT: &str = "1880";
const REQUEST_TIMEOUT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("celsius")
        .version("0.1.0")
        .about("🌡️  Celsius temperature controller client")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Controller address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Controller request port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "raw"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("index").about("📄 Fetch the status page"))
        .subcommand(
            SubCommand::with_name("json")
                .about("📊 Fetch readings as JSON")
                .arg(
                    Arg::with_name("path")
                        .long("path")
                        .value_name("PATH")
                        .help("Measurements route configured on the device")
                        .takes_value(true)
                        .default_value(DEFAULT_JSON_PATH),
                ),
        )
        .subcommand(SubCommand::with_name("metrics").about("📈 Fetch readings in Prometheus text format"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📡 Listen for multicast telemetry")
                .arg(
                    Arg::with_name("group")
                        .long("group")
                        .value_name("ADDR")
                        .help("Multicast group")
                        .takes_value(true)
                        .default_value(DEFAULT_GROUP),
                )
                .arg(
                    Arg::with_name("group-port")
                        .long("group-port")
                        .value_name("PORT")
                        .help("Multicast port")
                        .takes_value(true)
                        .default_value(DEFAULT_GROUP_PORT),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let raw = matches.value_of("format") == Some("raw");

    match matches.subcommand() {
        ("index", Some(_)) => {
            let response = fetch(host, port, INDEX_PATH).await?;
            print_response(&response, raw, |body| println!("{}", body));
        }
        ("json", Some(sub)) => {
            let path = sub.value_of("path").unwrap_or(DEFAULT_JSON_PATH);
            let response = fetch(host, port, path).await?;
            print_response(&response, raw, print_json_table);
        }
        ("metrics", Some(_)) => {
            let response = fetch(host, port, METRICS_PATH).await?;
            print_response(&response, raw, print_metrics_table);
        }
        ("monitor", Some(sub)) => handle_monitor(sub, raw).await?,
        _ => {
            eprintln!("{} No command given, try --help", "❌".red());
        }
    }

    Ok(())
}

struct HttpResponse {
    status: u16,
    server: Option<String>,
    body: String,
}

async fn fetch(host: &str, port: u16, path: &str) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to controller at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start the host build with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin celsius-sim".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);

    // The controller closes the connection after every response.
    let raw = match tokio::time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), async {
        stream.write_all(request.as_bytes()).await?;
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        Ok::<_, std::io::Error>(buffer)
    })
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            eprintln!("{} Request timed out after {} seconds", "⏰".yellow(), REQUEST_TIMEOUT_SECS);
            return Err("request timeout".into());
        }
    };

    parse_response(&String::from_utf8_lossy(&raw))
}

fn parse_response(text: &str) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or("empty response")?
        .parse()?;
    let server = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("server"))
        .map(|(_, value)| value.trim().to_string());

    Ok(HttpResponse {
        status,
        server,
        body: body.to_string(),
    })
}

fn print_response(response: &HttpResponse, raw: bool, pretty: impl Fn(&str)) {
    if raw {
        print!("{}", response.body);
        return;
    }

    let server = response.server.as_deref().unwrap_or("unknown");
    if response.status >= 300 {
        println!("{} {} answered {}", "❌".red(), server.bright_white(), response.status.to_string().bright_red());
        return;
    }
    println!("{} {} answered {}", "✅".green(), server.bright_white(), response.status.to_string().green());
    pretty(&response.body);
}

fn print_json_table(body: &str) {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{} Body is not JSON: {}", "⚠️".yellow(), e);
            println!("{}", body);
            return;
        }
    };

    if let Some(presence) = value.get("presence").and_then(|p| p.as_bool()) {
        let label = if presence { "present".green() } else { "absent".dimmed() };
        println!("  {:<16} {}", "Presence".bright_white(), label);
    }

    let readings = value.get("temperature").unwrap_or(&value);
    if let Some(map) = readings.as_object() {
        for (name, reading) in map {
            let cell = match reading.as_f64() {
                Some(celsius) => format_celsius(celsius),
                None => "absent".dimmed().to_string(),
            };
            println!("  {:<16} {}", name.bright_white(), cell);
        }
    }
}

fn print_metrics_table(body: &str) {
    for line in body.lines().filter(|l| !l.starts_with('#') && !l.is_empty()) {
        let Some((series, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let cell = match value.parse::<f64>() {
            Ok(v) if v.is_finite() && series.starts_with("temperature") => format_celsius(v),
            Ok(v) if v.is_finite() => v.to_string(),
            _ => "absent".dimmed().to_string(),
        };
        println!("  {:<32} {}", series.bright_white(), cell);
    }
}

fn format_celsius(celsius: f64) -> String {
    let text = format!("{:>7.2} °C", celsius);
    if celsius < 10.0 {
        text.bright_blue().to_string()
    } else if celsius > 28.0 {
        text.bright_red().to_string()
    } else {
        text.green().to_string()
    }
}

async fn handle_monitor(matches: &ArgMatches<'_>, raw: bool) -> Result<(), Box<dyn std::error::Error>> {
    let group: Ipv4Addr = matches.value_of("group").unwrap_or(DEFAULT_GROUP).parse()?;
    let port: u16 = matches.value_of("group-port").unwrap_or(DEFAULT_GROUP_PORT).parse()?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;

    println!("{} Listening on {}:{} (Ctrl+C to stop)", "📡".cyan(), group, port);

    let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buffer).await?;
        match Datagram::parse(&buffer[..len]) {
            Ok(datagram) if raw => println!("{} {}", datagram.topic, render_value(datagram.value)),
            Ok(datagram) => {
                let name = datagram.sensor_name().unwrap_or(datagram.topic);
                let cell = match datagram.value {
                    Reading::Celsius(v) => format_celsius(v as f64),
                    Reading::Absent => "absent".dimmed().to_string(),
                };
                println!("  {:<21} {:<16} {}", from.to_string().dimmed(), name.bright_white(), cell);
            }
            Err(e) => eprintln!("{} Ignoring datagram from {}: {}", "⚠️".yellow(), from, e),
        }
    }
}

fn render_value(reading: Reading) -> String {
    match reading {
        Reading::Celsius(v) => format!("{:.2}", v),
        Reading::Absent => "nan".to_string(),
    }
}
