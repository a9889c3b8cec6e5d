//! WolfTunCtl - Command line tool for inspecting a running WolfTunnel relay
//!
//! Usage:
//!   wolftunctl status    - Show relay totals
//!   wolftunctl clients   - List client sessions
//!   wolftunctl chart     - Show recent throughput samples

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// WolfTunnel Control Tool
#[derive(Parser)]
#[command(name = "wolftunctl")]
#[command(about = "Inspect a running WolfTunnel relay", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolftunnel/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show relay totals
    Status,
    /// List client sessions
    Clients {
        /// Include sessions that have disconnected
        #[arg(short, long)]
        all: bool,
    },
    /// Show the most recent throughput samples
    Chart {
        /// Number of samples to show
        #[arg(short, long, default_value = "20")]
        last: usize,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    uptime_seconds: u64,
    #[serde(default)]
    online_clients: usize,
    #[serde(default)]
    known_clients: usize,
    #[serde(default)]
    rx_total: u64,
    #[serde(default)]
    tx_total: u64,
    #[serde(default)]
    cache_entries: usize,
}

#[derive(Debug, Deserialize)]
struct ClientView {
    address: String,
    #[serde(default)]
    online: bool,
    #[serde(default)]
    online_time: String,
    #[serde(default)]
    offline_time: Option<String>,
    #[serde(default)]
    rx: u64,
    #[serde(default)]
    tx: u64,
}

#[derive(Debug, Deserialize)]
struct ChartSample {
    #[serde(default)]
    transport_bytes: u64,
    #[serde(default)]
    receive_bytes: u64,
    #[serde(default)]
    label: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => endpoint_from_config(&cli.config),
    };

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Clients { all } => list_clients(&endpoint, *all).await,
        Commands::Chart { last } => show_chart(&endpoint, *last).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// API URL from the relay config, falling back to the default bind address
fn endpoint_from_config(path: &Path) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // A wildcard bind is reachable on loopback
    if let Some(port) = addr.strip_prefix("0.0.0.0:") {
        format!("http://127.0.0.1:{}", port)
    } else {
        format!("http://{}", addr)
    }
}

async fn fetch<T: for<'de> Deserialize<'de>>(
    endpoint: &str,
    path: &str,
) -> Result<T, Box<dyn std::error::Error>> {
    let url = format!("{}{}", endpoint, path);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    Ok(response.json().await?)
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stats: StatsResponse = fetch(endpoint, "/stats").await?;

    println!();
    println!("WolfTunnel Relay Status (wolftunctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Protocol:        {}", stats.protocol);
    println!("Uptime:          {}", format_duration(stats.uptime_seconds));
    println!("Clients online:  {} (of {} seen)", stats.online_clients, stats.known_clients);
    println!("Bound addresses: {}", stats.cache_entries);
    println!("To clients:      {}", format_bytes(stats.rx_total));
    println!("From clients:    {}", format_bytes(stats.tx_total));
    println!();

    Ok(())
}

async fn list_clients(endpoint: &str, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let clients: Vec<ClientView> = fetch(endpoint, "/clients").await?;

    println!();
    println!("{:<42} {:<10} {:<12} {:<12} {}", "ADDRESS", "STATUS", "RX", "TX", "SINCE");
    println!("{}", "-".repeat(100));

    for client in clients.iter().filter(|c| all || c.online) {
        let status_padded = format!("{:<10}", if client.online { "Online" } else { "Offline" });
        let status_colored = if client.online {
            format!("\x1b[32m{}\x1b[0m", status_padded)
        } else {
            format!("\x1b[31m{}\x1b[0m", status_padded)
        };
        let since = if client.online {
            client.online_time.as_str()
        } else {
            client.offline_time.as_deref().unwrap_or("-")
        };

        println!(
            "{:<42} {} {:<12} {:<12} {}",
            client.address,
            status_colored,
            format_bytes(client.rx),
            format_bytes(client.tx),
            since
        );
    }
    println!();

    Ok(())
}

async fn show_chart(endpoint: &str, last: usize) -> Result<(), Box<dyn std::error::Error>> {
    let samples: Vec<ChartSample> = fetch(endpoint, "/chart").await?;
    if samples.is_empty() {
        println!("No traffic recorded yet");
        return Ok(());
    }

    println!();
    println!("{:<10} {:>14} {:>14}", "TIME", "FROM CLIENTS", "TO CLIENTS");
    println!("{}", "-".repeat(40));
    let skip = samples.len().saturating_sub(last);
    for sample in samples.iter().skip(skip) {
        println!(
            "{:<10} {:>12}/s {:>12}/s",
            sample.label,
            format_bytes(sample.transport_bytes),
            format_bytes(sample.receive_bytes)
        );
    }
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_duration(seconds: u64) -> String {
    let (days, rest) = (seconds / 86400, seconds % 86400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{}d {:02}h {:02}m", days, hours, minutes)
    } else {
        format!("{:02}h {:02}m {:02}s", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_endpoint_from_wildcard_bind() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[api]\nbind_address = \"0.0.0.0:9090\"\n").unwrap();
        assert_eq!(endpoint_from_config(file.path()), "http://127.0.0.1:9090");
        assert_eq!(
            endpoint_from_config(Path::new("/nonexistent/wolftunnel.toml")),
            "http://127.0.0.1:8080"
        );
    }
}
