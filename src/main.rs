//! WolfTunnel - Address-multiplexed IP tunnel relay
//!
//! Carries raw IP packets between a TUN interface and remote clients over
//! WebSocket or raw TCP frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolftunnel::api::HttpServer;
use wolftunnel::config::{sample_config, DeviceConfig, WolfTunnelConfig};
use wolftunnel::device::TunnelInterface;
use wolftunnel::relay::Relay;

/// WolfTunnel - Address-multiplexed IP tunnel relay
#[derive(Parser)]
#[command(name = "wolftunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolftunnel.toml")]
    config: PathBuf,

    /// Log level (overrides [logging] level)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolftunnel.toml")]
        output: PathBuf,

        /// Pre-shared key (random if omitted)
        #[arg(long)]
        key: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(&cli.config, cli.log_level.as_deref(), cli.quiet).await,
        Commands::Init { output, key, force } => run_init(&output, key, force),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, quiet: bool) {
    let level = if quiet { "error" } else { level };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the relay and serve until Ctrl-C
async fn run_start(config_path: &Path, log_level: Option<&str>, quiet: bool) -> anyhow::Result<()> {
    let config = WolfTunnelConfig::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    init_logging(log_level.unwrap_or(&config.logging.level), quiet);
    tracing::info!("Starting WolfTunnel relay...");

    let tun = match open_device(&config.device) {
        Ok(tun) => tun,
        Err(e) => {
            tracing::error!("Failed to create tunnel device {}: {:#}", config.device.name, e);
            return Err(e);
        }
    };
    tracing::info!("Tunnel device {} ready", tun.name());

    let relay = Relay::new(&config, tun).context("Failed to initialize relay")?;
    let cancel = relay.cancel_token();

    let api = HttpServer::new(
        config.api.clone(),
        config.tunnel.protocol,
        relay.stats(),
        relay.cache(),
    );
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start(api_cancel).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    let result = tokio::select! {
        result = relay.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    relay.shutdown();
    if let Err(e) = api_task.await {
        tracing::warn!("HTTP API task ended abnormally: {}", e);
    }

    if let Err(e) = &result {
        tracing::error!("Relay error: {}", e);
    }
    tracing::info!("WolfTunnel stopped");
    Ok(result?)
}

#[cfg(target_os = "linux")]
fn open_device(config: &DeviceConfig) -> anyhow::Result<Arc<dyn TunnelInterface>> {
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("creating a TUN device requires root (run with sudo)");
    }
    let device = wolftunnel::device::TunDevice::open(config)?;
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_config: &DeviceConfig) -> anyhow::Result<Arc<dyn TunnelInterface>> {
    anyhow::bail!("TUN devices are only supported on Linux")
}

/// Write a sample configuration
fn run_init(output: &Path, key: Option<String>, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let key = key.unwrap_or_else(|| {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    });

    std::fs::write(output, sample_config(&key))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nShare the tunnel key with your clients, then start with:");
    println!("  sudo wolftunnel --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match WolfTunnelConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Protocol:        {}", config.tunnel.protocol);
            println!("  Bind Address:    {}", config.tunnel.bind_address);
            println!(
                "  Codec:           obfuscate={} cipher={} compress={}",
                config.tunnel.obfuscate, config.tunnel.cipher, config.tunnel.compress
            );
            println!("  Client Isolation: {}", config.tunnel.isolate_clients);
            println!("  Device:          {} (mtu {})", config.device.name, config.device.mtu);
            if config.api.enabled {
                println!("  HTTP API:        {}", config.api.bind_address);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
