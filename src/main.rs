mod bridge;
mod config;
mod sink;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pumplink_lib::alerts::{AlertDeduper, AlertKind};
use pumplink_lib::auth::{JpakeAuthenticator, authenticate};
use pumplink_lib::message::MessageKind;
use pumplink_lib::status::decode_response;
use pumplink_lib::{ConnectionState, LimitsHandle, Poller, PumpError, PumpSession};

use bridge::ChunkBridge;
use config::{Config, PumpSection};
use sink::JsonLinesSink;

/// Pairs with and polls an insulin pump through a BLE radio bridge.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "pumplink.toml")]
    config: PathBuf,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a captured response cargo and print it as JSON.
    Decode {
        /// Message kind in snake_case, e.g. current_egv.
        kind: String,
        /// Cargo bytes as hex.
        hex: String,
    },
    /// Run the pairing handshake and exit.
    Pair,
    /// Pair, then poll until interrupted, writing readings as JSON lines.
    /// Alert kinds typed on stdin (e.g. `low`) acknowledge active alerts.
    Poll,
    /// Print the effective configuration.
    CheckConfig,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stdout carries JSON lines, so the console layer uses stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE (chunk hex dumps) with -vv
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let config = Config::load_or_default(&cli.config)?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:?}", e);
        process::exit(2);
    }

    let result = match cli.command {
        Command::Decode { kind, hex } => run_decode(&config, &kind, &hex),
        Command::Pair => run_pair(&config).await,
        Command::Poll => run_poll(config).await,
        Command::CheckConfig => run_check_config(&config),
    };
    if let Err(e) = result {
        error!("{:?}", e);
        process::exit(1);
    }
    Ok(())
}

fn parse_kind(name: &str) -> Result<MessageKind> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| anyhow!("unknown message kind {name:?}"))
}

fn run_decode(config: &Config, kind: &str, cargo_hex: &str) -> Result<()> {
    let kind = parse_kind(kind)?;
    let cargo = hex::decode(cargo_hex.replace([':', ' '], "")).context("cargo is not valid hex")?;
    let Some(decoded) = decode_response(kind, &cargo, &config.safety) else {
        bail!("{kind} cargo of {} bytes did not decode", cargo.len());
    };
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn run_check_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if !shown.pump.pairing_code.is_empty() {
        shown.pump.pairing_code = "******".into();
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}

async fn open_session(pump: &PumpSection) -> Result<(PumpSession<ChunkBridge>, watch::Receiver<ConnectionState>)> {
    if pump.pairing_code.is_empty() {
        bail!("[pump] pairing_code is not set");
    }
    let bridge = ChunkBridge::connect(&pump.bridge_addr)
        .await
        .with_context(|| format!("Failed to connect to bridge at {}", pump.bridge_addr))?;
    let link = bridge.state();
    let session = PumpSession::new(bridge)
        .with_timeout(pump.response_timeout())
        .with_connection_state(link.clone());
    Ok((session, link))
}

async fn run_pair(config: &Config) -> Result<()> {
    let (mut session, _link) = open_session(&config.pump).await?;
    let mut auth = JpakeAuthenticator::new(config.pump.app_id, config.pump.pairing_code.clone());
    authenticate(&mut session, &mut auth).await.context("Pairing failed")?;
    info!(app_id = config.pump.app_id, "paired");
    Ok(())
}

async fn run_poll(config: Config) -> Result<()> {
    let (session, link) = open_session(&config.pump).await?;
    let session = Arc::new(Mutex::new(session));
    let limits = LimitsHandle::new(config.safety);
    let (ready_tx, ready) = watch::channel(ConnectionState::Disconnected);

    let readings =
        Arc::new(JsonLinesSink::open(config.output.readings.as_deref()).context("Failed to open readings output")?);
    let alerts =
        Arc::new(JsonLinesSink::open(config.output.alerts.as_deref()).context("Failed to open alerts output")?);
    let dedup = Arc::new(AlertDeduper::new(config.alerts.dedup_capacity));

    let poller = Poller::new(session.clone(), config.polling.clone(), ready, limits.subscribe())
        .with_sink(readings)
        .with_alert_sink(alerts)
        .with_alerts(config.alerts, dedup.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(acknowledge_alerts(stdin_lines(), dedup, shutdown.clone()));
    let poll_task = tokio::spawn(poller.run(shutdown.clone()));
    let link_task = tokio::spawn(maintain_link(
        session,
        link,
        ready_tx,
        config.pump.clone(),
        shutdown.clone(),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("interrupted, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
    poll_task.await.context("poll task")?;
    link_task.await.context("link task")?
}

/// Lines from stdin. A plain thread, so a pending read never holds up exit.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Acknowledge the alert kind named on each line, e.g. `urgent_low`.
async fn acknowledge_alerts(
    mut lines: mpsc::UnboundedReceiver<String>,
    dedup: Arc<AlertDeduper>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.recv() => line,
        };
        let Some(line) = line else { return };
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        match serde_json::from_value::<AlertKind>(serde_json::Value::String(name.to_string())) {
            Ok(kind) if dedup.acknowledge(kind) => info!(%kind, "alert acknowledged"),
            Ok(kind) => warn!(%kind, "no active alert to acknowledge"),
            Err(_) => warn!(input = name, "unknown alert kind"),
        }
    }
}

/// Authenticate whenever the bridge link comes up and publish readiness to
/// the poller; reconnect after the link drops.
async fn maintain_link(
    session: Arc<Mutex<PumpSession<ChunkBridge>>>,
    mut link: watch::Receiver<ConnectionState>,
    ready: watch::Sender<ConnectionState>,
    pump: PumpSection,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let connected = link.borrow().is_connected();
        if connected {
            let outcome = {
                let mut session = session.lock().await;
                session.reset();
                let mut auth = JpakeAuthenticator::new(pump.app_id, pump.pairing_code.clone());
                authenticate(&mut session, &mut auth).await
            };
            match outcome {
                Ok(()) => {
                    ready.send_replace(ConnectionState::Connected);
                    let dropped = tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        changed = link.wait_for(|state| !state.is_connected()) => changed.is_ok(),
                    };
                    ready.send_replace(ConnectionState::Disconnected);
                    if !dropped {
                        shutdown.cancel();
                        bail!("bridge state channel closed");
                    }
                    warn!("link lost");
                }
                Err(PumpError::Authentication(reason)) => {
                    shutdown.cancel();
                    bail!("pump rejected pairing: {reason}");
                }
                Err(e) => warn!(error = %e, "pairing attempt failed, will retry"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(pump.reconnect_delay()) => {}
        }
        let session = session.lock().await;
        if let Err(e) = session.transport().reconnect().await {
            warn!(addr = %pump.bridge_addr, error = %e, "bridge reconnect failed");
        }
    }
}
