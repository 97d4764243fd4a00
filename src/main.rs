//! ==============================================================================
//! main.rs - scroll relay entry point
//! ==============================================================================
//!
//! purpose:
//!     relays how fast (and which way) someone scrolls a short-video feed to
//!     a servo/motor on an arduino or esp32.
//!
//! responsibilities:
//!     - parse the cli, load relay.toml, apply env and flag overrides
//!     - initialise tracing
//!     - build the device channel and start its reconnect supervisor
//!     - open the device in the background (bounded retry)
//!     - start the debounced relay and serve http until ctrl-c
//!     - `simulate`: drive a synthetic scroll against a running server
//!
//! architecture:
//!
//!     ┌──────────────┐  POST /api/scroll-metrics  ┌──────────────────────────┐
//!     │   browser    │ ─────────────────────────> │  server.rs (axum)        │
//!     │  (tracker)   │ <───── GET /api, /uploads  │   ├─ metrics.rs (record) │
//!     └──────────────┘                            │   └─ relay.rs (debounce) │
//!                                                 └────────────┬─────────────┘
//!                                                              │ DeviceCommand
//!                                                 ┌────────────┴─────────────┐
//!                                                 │  device.rs               │
//!                                                 │   ├─ serial.rs ── hal.rs │──> usb serial
//!                                                 │   └─ websocket.rs        │──> ws://.../esp32
//!                                                 └──────────────────────────┘
//!
//! relationships:
//!     - uses: config.rs, device.rs, relay.rs, server.rs, tracker.rs
//!
//! ==============================================================================

mod catalog;
mod command;
mod config;
mod dashboard;
mod device;
mod domain;
mod hal;
mod metrics;
mod relay;
mod serial;
mod server;
mod tracker;
mod upload;
mod websocket;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{LoadedConfig, RelayConfig, TransportKind};
use crate::device::{DeviceChannel, TransportError};
use crate::hal::Serial2Provider;
use crate::relay::Relay;
use crate::server::AppState;
use crate::tracker::{SimulateOptions, DEFAULT_THROTTLE};

// ==============================================================================
// command line
// ==============================================================================

#[derive(Parser, Debug)]
#[command(name = "scroll-relay", version, about = "Relay scroll metrics to an Arduino / ESP32")]
struct Cli {
    /// path to relay.toml (default: config/relay.toml or ../config/relay.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run the relay server (default)
    Serve,
    /// scroll through a synthetic feed and post samples to a running server
    Simulate(SimulateArgs),
    /// list serial ports visible to the os
    Ports,
}

/// take precedence over relay.toml and the environment
#[derive(Args, Debug, Default)]
struct Overrides {
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    serial_path: Option<String>,
    #[arg(long, global = true)]
    baud_rate: Option<u32>,
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportKind>,
}

impl Overrides {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.serial_path {
            config.device.serial.path = path.clone();
        }
        if let Some(baud) = self.baud_rate {
            config.device.serial.baud_rate = baud;
        }
        if let Some(transport) = self.transport {
            config.device.transport = transport;
        }
    }
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "http://localhost:3001")]
    url: String,
    #[arg(long, default_value_t = 8)]
    videos: u32,
    /// height of one video container in px
    #[arg(long, default_value_t = 800.0)]
    container_height: f64,
    #[arg(long, default_value_t = 40.0)]
    step_px: f64,
    #[arg(long, default_value_t = 16)]
    step_ms: u64,
    #[arg(long, default_value_t = DEFAULT_THROTTLE.as_millis() as u64)]
    throttle_ms: u64,
}

impl From<SimulateArgs> for SimulateOptions {
    fn from(args: SimulateArgs) -> Self {
        Self {
            url: args.url,
            videos: args.videos,
            container_height: args.container_height,
            step_px: args.step_px,
            step_ms: args.step_ms,
            throttle_ms: args.throttle_ms,
        }
    }
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(cli.config.as_deref(), &cli.overrides).await,
        Command::Simulate(args) => {
            init_logging("info");
            tracker::simulate(&args.into()).await?;
            Ok(())
        }
        Command::Ports => {
            let ports = Serial2Provider::available_ports();
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{}", port.display());
            }
            Ok(())
        }
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_server(config_path: Option<&Path>, overrides: &Overrides) -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Scroll Relay");
    println!("  \"Scroll the feed, move the motor\"");
    println!("===========================================================");

    // step 1: configuration (file < env < flags)
    let LoadedConfig {
        mut config,
        source,
        warnings,
    } = RelayConfig::load_or_default(config_path)?;
    let env_warnings = config.apply_env();
    overrides.apply(&mut config);

    // step 2: logging, now that the level is known
    init_logging(&config.logging.level);
    if let Some(path) = source {
        info!("[CONFIG] loaded {}", path.display());
    }
    for warning in warnings.iter().chain(&env_warnings) {
        warn!("[CONFIG] {}", warning);
    }
    config.log_summary();

    // step 3: device channel + self-healing supervisor
    let channel = DeviceChannel::from_config(&config.device);
    let _supervisor = channel.spawn_supervisor();

    // step 4: open the device in the background so http is up while the port retries
    let opener = channel.clone();
    let transport = config.device.transport;
    tokio::spawn(async move {
        match opener.open().await {
            Ok(()) => info!("[STARTUP] ✓ device transport ready ({})", opener.transport_name()),
            Err(TransportError::Disabled) => info!("[STARTUP] device transport disabled"),
            Err(e) => {
                warn!("[STARTUP] ⚠ device unavailable: {}", e);
                if transport == TransportKind::Serial {
                    let ports: Vec<String> = Serial2Provider::available_ports()
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect();
                    if !ports.is_empty() {
                        info!("[STARTUP] serial ports present: {}", ports.join(", "));
                    }
                }
            }
        }
    });

    // step 5: relay + http
    let relay = Relay::spawn(channel.clone(), config.debounce());
    let state = AppState::new(&config, channel.clone(), relay);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("[STARTUP] ✓ Debug panel: http://localhost:{}/scroll-speeds", config.server.port);
    if transport == TransportKind::Websocket {
        info!("[STARTUP] ESP32s connect to ws://<host>:{}/esp32", config.server.port);
    }
    println!("────────────────────────────────────────────────────────────");

    server::serve(listener, state, shutdown_signal()).await?;

    info!("[SHUTDOWN] closing device channel");
    channel.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[SHUTDOWN] cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[SHUTDOWN] ctrl-c received");
}
