//! IRC bot daemon - Main binary

use clap::{Parser, Subcommand};
use ircbot_core::{Config, ConnectionId, Engine, EventKind, ServerConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// IRC bot daemon - a multi-connection IRC client engine
#[derive(Parser)]
#[command(name = "ircbotd")]
#[command(about = "A multi-connection IRC client engine in Rust")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Test configuration and exit
    #[arg(long)]
    test_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(command) = cli.command {
        match command {
            Commands::Config { output } => {
                generate_config(&output)?;
                return Ok(());
            }
            Commands::Version => {
                println!("ircbotd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
        }
    }

    info!("Loading configuration from {:?}", cli.config);
    let config = Config::from_file(&cli.config)?;

    if cli.test_config {
        info!("Configuration is valid");
        return Ok(());
    }
    if config.servers.is_empty() {
        anyhow::bail!("no servers configured");
    }

    let mut engine = Engine::new();
    let mut channels: HashMap<ConnectionId, Vec<String>> = HashMap::new();
    for server in &config.servers {
        let id = engine.connect(server.to_settings());
        info!(
            "Connecting to {}:{} as {} (connection {})",
            server.host, server.port, server.nickname, id
        );
        channels.insert(id, server.channels.clone());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                for id in channels.keys() {
                    let _ = engine.quit(*id, Some("Shutting down"));
                }
                break;
            }
            event = engine.next_event() => {
                let Some(event) = event else { break };
                handle_event(&engine, &channels, event.connection, event.kind);
            }
        }
    }

    Ok(())
}

fn handle_event(
    engine: &Engine,
    channels: &HashMap<ConnectionId, Vec<String>>,
    id: ConnectionId,
    kind: EventKind,
) {
    match kind {
        EventKind::Connected { address, port } => {
            info!("[{}] connected to {}:{}", id, address, port);
            for channel in channels.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Err(e) = engine.join_channel(id, channel, None) {
                    warn!("[{}] failed to join {}: {}", id, channel, e);
                }
            }
        }
        EventKind::Disconnected {
            reason,
            address,
            port,
        } => {
            warn!("[{}] disconnected from {}:{}: {}", id, address, port, reason);
        }
        EventKind::ConnectAttempt { address, port } => {
            info!("[{}] connecting to {}:{}", id, address, port);
        }
        EventKind::ConnectAttemptFailed {
            reason,
            address,
            port,
        } => {
            warn!("[{}] connect to {}:{} failed: {}", id, address, port, reason);
        }
        EventKind::JoinedChannel { channel } => {
            info!("[{}] joined {}", id, channel);
        }
        EventKind::LeftChannel { reason, channel } => {
            info!("[{}] left {}: {}", id, channel, reason);
        }
        EventKind::KickedFromChannel {
            reason,
            kicker,
            channel,
            ..
        } => {
            warn!("[{}] kicked from {} by {}: {}", id, channel, kicker, reason);
        }
        EventKind::InvitedToChannel { user, channel, .. } => {
            info!("[{}] invited to {} by {}", id, channel, user);
        }
        EventKind::UserSaid {
            text, user, target, ..
        } => {
            info!("[{}] {} -> {}: {}", id, user, target, text);
        }
        EventKind::UserNotice {
            text, user, target, ..
        } => {
            info!("[{}] notice from {} -> {}: {}", id, user, target, text);
        }
        EventKind::RawLine { line } => {
            debug!("[{}] << {}", id, line);
        }
        other => {
            debug!("[{}] {:?}", id, other);
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    Ok(())
}

/// Generate a configuration file with one sample server entry
fn generate_config(output: &PathBuf) -> anyhow::Result<()> {
    let config = Config {
        servers: vec![ServerConfig::default()],
    };
    config.to_file(output)?;
    println!("Generated default configuration file: {:?}", output);
    Ok(())
}
