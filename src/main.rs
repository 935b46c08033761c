//! Binary entrypoint for the meshclient CLI.
//!
//! Commands:
//! - `init` - write a starter `meshclient.toml` and create the database
//! - `run [--host <h>] [--port <p>]` - connect and log traffic until Ctrl-C or link loss
//! - `nodes [--json]` - list stored nodes, most recently heard first
//! - `messages [--channel <n>] [--since <rfc3339>] [--json]` - list stored messages
//! - `send [--channel <n>] [--wait-ack [--timeout <s>]] TEXT` - broadcast one text message
//!
//! See the library crate docs for module-level details: `meshclient::`.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

use meshclient::client::{MeshClient, RunExit};
use meshclient::config::Config;
use meshclient::model::{AckStatus, ConnectionState};
use meshclient::storage::StateStore;

#[derive(Parser)]
#[command(name = "meshclient")]
#[command(about = "Headless client for Meshtastic mesh radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshclient.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and create the database
    Init,
    /// Connect to a node and log traffic until interrupted
    Run {
        /// Node host name or address (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Node TCP port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List known nodes
    Nodes {
        #[arg(long)]
        json: bool,
    },
    /// List stored messages on a channel
    Messages {
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Only messages at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Broadcast a text message
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Wait for the mesh to acknowledge before exiting
        #[arg(long)]
        wait_ack: bool,
        /// Seconds to wait for the acknowledgement
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        text: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        if Path::new(&cli.config).exists() {
            return Err(anyhow!("{} already exists; not overwriting", cli.config));
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        let config = Config::load(&cli.config).await?;
        let store = StateStore::open(&config.storage.database, config.store_settings())?;
        info!("Initialized database at {}", store.path().display());
        return Ok(());
    }

    let config = load_config(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Run { host, port } => {
            let configured = config.endpoint();
            let host = host.unwrap_or(configured.host);
            let port = port.unwrap_or(configured.port);
            info!("Starting meshclient v{}", env!("CARGO_PKG_VERSION"));
            let mut client = MeshClient::new(config)?;
            client.subscribe_connection_state(|s| match &s.reason {
                Some(reason) => info!("link {} ({})", s.state, reason),
                None => info!("link {}", s.state),
            });
            client.subscribe_nodes(|n| {
                info!(
                    "node {} '{}' battery={:?} snr={:?}",
                    n.id,
                    n.display_name(),
                    n.battery,
                    n.snr
                )
            });
            client.subscribe_channels(|c| {
                if c.is_enabled() {
                    info!("channel {}: {}", c.index, c.display_name())
                }
            });
            client.subscribe_messages(|m| {
                let from = m.from_name.as_deref().unwrap_or(m.from.as_str());
                info!("[ch{}] {} -> {}: {} ({})", m.channel, from, m.to, m.text, m.ack_status)
            });
            client.subscribe_diagnostics(|d| warn!("{}: {}", d.source, d.detail));

            client.connect(&host, port).await?;
            match client.run_until(tokio::signal::ctrl_c()).await {
                RunExit::Shutdown => info!("Interrupted; disconnecting"),
                RunExit::SessionEnded => info!("Link closed"),
            }
            client.disconnect().await?;
            let stats = client.bridge_stats();
            info!(
                "events delivered={} coalesced={} dropped={}",
                stats.delivered, stats.coalesced, stats.dropped_overflow
            );
        }
        Commands::Nodes { json } => {
            let store = StateStore::open(&config.storage.database, config.store_settings())?;
            let nodes = store.list_nodes().collect::<Result<Vec<_>, _>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                for n in &nodes {
                    let heard = n
                        .last_heard
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!("{:<10} {:<24} {}", n.id, n.display_name(), heard);
                }
            }
        }
        Commands::Messages {
            channel,
            since,
            json,
        } => {
            let since = match since {
                Some(s) => DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| anyhow!("invalid --since '{}': {}", s, e))?
                    .with_timezone(&Utc),
                None => DateTime::<Utc>::default(),
            };
            let store = StateStore::open(&config.storage.database, config.store_settings())?;
            let messages = store
                .list_messages(channel, since)
                .collect::<Result<Vec<_>, _>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                for m in &messages {
                    println!(
                        "{} {:<16} {:<14} {}",
                        m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        m.from_name.as_deref().unwrap_or(m.from.as_str()),
                        m.ack_status,
                        m.text
                    );
                }
            }
        }
        Commands::Send {
            host,
            port,
            channel,
            wait_ack,
            timeout,
            text,
        } => {
            let configured = config.endpoint();
            let host = host.unwrap_or(configured.host);
            let port = port.unwrap_or(configured.port);
            let mut client = MeshClient::new(config)?;
            client.connect(&host, port).await?;
            let sent = client.send_message(channel, &text).await?;
            println!("{}", sent.id);

            if wait_ack {
                let deadline = Instant::now() + Duration::from_secs(timeout);
                let mut status = AckStatus::Unacknowledged;
                while Instant::now() < deadline && client.status().state != ConnectionState::Disconnected {
                    client.tick(Duration::from_millis(250)).await?;
                    if let Some(m) = client.store().message(&sent.id)? {
                        status = m.ack_status;
                        if status == AckStatus::Acknowledged {
                            break;
                        }
                    }
                }
                println!("{}", status);
            }
            client.disconnect().await?;
        }
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
async fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        Config::load(path).await
    } else {
        Ok(Config::default())
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let file = config.as_ref().and_then(|c| c.logging.file.clone());
    let opened = file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    if let Some(f) = opened {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Tee to the console only when someone is watching it
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
