//! OBD-II Agent
//!
//! Command-line host for an ELM327 adapter. Results are printed to stdout
//! as JSON; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! obd-agent ports
//! obd-agent --port /dev/rfcomm0 scan
//! obd-agent send 010C
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obd_protocol::{Discovery, ObdClient, ScannerHandle};
use obd_scan::ScanSessions;
use serde::Serialize;
use settings::{parse_pid, AgentConfig, LogConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

#[derive(Parser, Debug)]
#[command(name = "obd-agent")]
#[command(about = "ELM327 OBD-II adapter discovery and diagnostic scans", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "OBD_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port or device address; overrides the configuration
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Use the fast handshake
    #[arg(long, global = true)]
    fast: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List candidate adapter ports
    Ports,
    /// Connect, run the handshake and print the connection status
    Connect,
    /// Send one raw command and print the reply
    Send {
        /// AT or OBD command, e.g. `ATI` or `010C`
        command: String,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Run a full diagnostic scan
    Scan {
        /// Live PIDs to read, overriding the configuration (e.g. `0C,0D`)
        #[arg(long, value_delimiter = ',')]
        pids: Vec<String>,
    },
}

fn init_logging(log: &LogConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(config: &AgentConfig) -> Result<ObdClient> {
    let mut client = ObdClient::new(config.connect_options());
    let report = client
        .connect(config.endpoint())
        .await
        .context("connecting to the adapter")?;
    if let Some(warning) = &report.warning {
        warn!("{}", warning);
    }
    Ok(client)
}

async fn scan(config: &AgentConfig, pids: Vec<String>) -> Result<()> {
    let mut options = config.scan_options()?;
    if !pids.is_empty() {
        options.live_pids = pids.iter().map(|p| parse_pid(p)).collect::<Result<_>>()?;
    }

    // A failed connection still yields a (failed) scan result
    let mut client = ObdClient::new(config.connect_options());
    if let Err(e) = client.connect(config.endpoint()).await {
        error!("Connection failed: {}", e);
    }
    let scanner = ScannerHandle::new(client);
    let sessions = ScanSessions::new(scanner.clone());
    let id = sessions.start(options).await;

    let session = tokio::select! {
        finished = sessions.wait(id) => finished?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping after the current step");
            sessions.cancel(id).await.ok();
            sessions.wait(id).await?
        }
    };

    scanner.lock().await.disconnect().await;
    print_json(&session.result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if cli.port.is_some() {
        config.port = cli.port.clone();
    }
    if cli.fast {
        config.fast_init = true;
    }
    init_logging(&config.log, cli.verbose)?;

    match cli.command {
        Command::Ports => {
            let endpoints = Discovery::platform().list_endpoints().await;
            info!("Found {} candidate ports", endpoints.len());
            print_json(&endpoints)
        }
        Command::Connect => {
            let mut client = connect(&config).await?;
            let detected = client.detected_protocol().await.ok().flatten();
            info!("Protocol: {:?}", detected);
            let status = client.status();
            client.disconnect().await;
            print_json(&status)
        }
        Command::Send {
            command,
            timeout_ms,
        } => {
            let mut client = connect(&config).await?;
            let response = client
                .send(&command, Duration::from_millis(timeout_ms))
                .await
                .with_context(|| format!("sending {command}"))?;
            client.disconnect().await;
            print_json(&serde_json::json!({
                "command": command,
                "response": response.text,
                "complete": response.complete,
                "elapsed_ms": response.elapsed.as_millis() as u64,
            }))
        }
        Command::Scan { pids } => scan(&config, pids).await,
    }
}
