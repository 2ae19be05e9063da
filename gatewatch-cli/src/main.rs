//! Gatewatch CLI
//!
//! Command-line interface for the Gatewatch telemetry relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatewatch_core::relay::ControlCommand;
use gatewatch_core::subscriber::{self, SubscriberConfig};
use gatewatch_core::{Broadcaster, Relay, RelayConfig, SessionRecorder, WsSink};

#[derive(Parser)]
#[command(name = "gatewatch")]
#[command(about = "Gatewatch - real-time start line telemetry relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service
    Run {
        /// Bind address for the fan-out WebSocket listener
        #[arg(short, long)]
        listen: Option<String>,

        /// Upstream position stream endpoint
        #[arg(long)]
        position_endpoint: Option<String>,

        /// Upstream gate metric stream endpoint
        #[arg(long)]
        gate_endpoint: Option<String>,

        /// Session recording directory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Athlete registry JSON file
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Log level
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// List recorded sessions
    Sessions {
        /// Session recording directory
        #[arg(short, long, default_value = "data/session_packs")]
        data_dir: PathBuf,
    },

    /// Export a recorded session as CSV
    Export {
        /// Session id to export
        session_id: String,

        /// Session recording directory
        #[arg(short, long, default_value = "data/session_packs")]
        data_dir: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            listen,
            position_endpoint,
            gate_endpoint,
            data_dir,
            registry,
            log_level,
        } => {
            setup_logging(&log_level)?;

            let mut config = RelayConfig::from_env();
            if let Some(v) = listen {
                config.listen_addr = v;
            }
            if let Some(v) = position_endpoint {
                config.position_endpoint = v;
            }
            if let Some(v) = gate_endpoint {
                config.gate_endpoint = v;
            }
            if let Some(v) = data_dir {
                config.session_data_dir = v;
            }
            if let Some(v) = registry {
                config.athlete_registry_path = v;
            }

            run_relay(config).await?;
        }
        Commands::Sessions { data_dir } => {
            setup_logging("warn")?;
            list_sessions(data_dir)?;
        }
        Commands::Export {
            session_id,
            data_dir,
            output,
        } => {
            setup_logging("warn")?;
            export_session(data_dir, &session_id, output)?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatewatch relay");

    let broadcaster = Arc::new(Mutex::new(Broadcaster::new()));
    let (pos_tx, pos_rx) = mpsc::channel(config.channel_capacity);
    let (gate_tx, gate_rx) = mpsc::channel(config.channel_capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(64);

    let position_handle = subscriber::spawn(
        SubscriberConfig {
            name: "position",
            endpoint: config.position_endpoint.clone(),
            topic: config.position_topic.clone(),
            reconnect_min_s: config.reconnect_min.as_secs_f64(),
            reconnect_max_s: config.reconnect_max.as_secs_f64(),
        },
        pos_tx,
    );
    let gate_handle = subscriber::spawn(
        SubscriberConfig {
            name: "gate",
            endpoint: config.gate_endpoint.clone(),
            topic: config.gate_topic.clone(),
            reconnect_min_s: config.reconnect_min.as_secs_f64(),
            reconnect_max_s: config.reconnect_max.as_secs_f64(),
        },
        gate_tx,
    );

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = config.listen_addr, "Client listener ready");
    let accept_task = tokio::spawn(accept_loop(listener, broadcaster.clone(), ctrl_tx));

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.notify_one();
            }
        });
    }

    let mut relay = Relay::new(config, broadcaster)?;
    relay
        .run(
            pos_rx,
            gate_rx,
            ctrl_rx,
            position_handle.stats(),
            gate_handle.stats(),
            shutdown,
        )
        .await?;

    position_handle.stop().await;
    gate_handle.stop().await;
    accept_task.abort();

    info!("Relay stopped");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    broadcaster: Arc<Mutex<Broadcaster>>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_client(
                    stream,
                    peer,
                    broadcaster.clone(),
                    ctrl_tx.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Mutex<Broadcaster>>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (writer, mut reader) = ws.split();
    let id = broadcaster.lock().await.connect(Box::new(WsSink::new(writer)));
    info!(%peer, sink = id, "Client connected");

    while let Some(Ok(msg)) = reader.next().await {
        match msg {
            Message::Text(text) => match ControlCommand::from_json(&text) {
                Some(cmd) => {
                    if ctrl_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                None => warn!(%peer, "Unrecognized client command"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    broadcaster.lock().await.disconnect(id);
    info!(%peer, sink = id, "Client disconnected");
}

fn list_sessions(data_dir: PathBuf) -> Result<()> {
    let recorder = SessionRecorder::new(data_dir)?;
    let sessions = recorder.list_sessions();

    if sessions.is_empty() {
        println!("No recorded sessions.");
        return Ok(());
    }

    for s in sessions {
        let start = s.start_time_utc.as_deref().unwrap_or("-");
        let duration = s
            .duration_s
            .map(|d| format!("{d:.1}s"))
            .unwrap_or_else(|| "-".to_string());
        let messages = s
            .message_count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let athletes = s
            .athlete_count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let tag = if s.legacy_pack {
            " (legacy)"
        } else if s.errored {
            " (errored)"
        } else {
            ""
        };
        println!("{}  start={start}  duration={duration}  messages={messages}  athletes={athletes}{tag}", s.session_id);
    }

    Ok(())
}

fn export_session(data_dir: PathBuf, session_id: &str, output: Option<PathBuf>) -> Result<()> {
    let recorder = SessionRecorder::new(data_dir)?;
    let csv = recorder.export_csv(session_id)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &csv)?;
            println!("Exported {} to {}", session_id, path.display());
        }
        None => println!("{csv}"),
    }

    Ok(())
}
