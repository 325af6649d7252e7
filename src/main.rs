//! CLI entry point for peerline.
//!
//! This binary provides a command-line interface for the peerline library:
//! running a chat node, dialling a peer, scanning the LAN, hosting a relay
//! and managing configuration files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use peerline::{
    network::sort_records,
    transport::{ConnectionOptions, PeerConnection},
    utils::{PeerlineConfig, DEFAULT_CONFIG_FILE},
    Node, PresenceBeacon, RelayServer,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

/// Peerline - serverless peer-to-peer text chat
#[derive(Parser)]
#[command(name = "peerline")]
#[command(about = "Peer-to-peer text chat with LAN discovery and an optional relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node: accept connections and print what peers send
    Listen {
        /// Display name to announce
        #[arg(short, long)]
        name: Option<String>,
        /// Inbox port (0 = OS-assigned)
        #[arg(short, long)]
        port: Option<u16>,
        /// Also announce through the configured relay
        #[arg(short, long)]
        global: bool,
    },
    /// Connect to a peer and chat over stdin/stdout
    Chat {
        /// Peer host or address
        host: String,
        /// Peer inbox port
        port: u16,
        /// Display name for this session
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Listen for LAN beacons and list the peers heard
    Peers {
        /// Seconds to listen
        #[arg(short, long, default_value = "6")]
        timeout: u64,
    },
    /// Run the relay server until Ctrl-C
    Relay {
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = PeerlineConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command {
        Commands::Listen { name, port, global } => handle_listen_command(name, port, global, config).await,
        Commands::Chat { host, port, name } => handle_chat_command(host, port, name, config).await,
        Commands::Peers { timeout } => handle_peers_command(timeout, config).await,
        Commands::Relay { host, port } => handle_relay_command(host, port, config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

async fn handle_listen_command(
    name: Option<String>,
    port: Option<u16>,
    global: bool,
    mut config: PeerlineConfig,
) -> Result<()> {
    // Override config with command line options
    if let Some(name) = name {
        config.identity.display_name = name;
    }
    if let Some(port) = port {
        config.network.listen_port = port;
    }
    if global {
        config.global.enabled = true;
    }

    let node = Node::new(config)?;
    let port = node.start().await.context("starting node")?;
    println!("✓ Listening as '{}' on port {}", node.name(), port);
    println!("  Type a line to send it to every connection, /peers, /connect <host> <port> or /quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = node.next_event() => match event {
                Some(event) => println!("{event}"),
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !handle_node_input(&node, line.trim_end()).await {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_node_input(node: &Node, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("/quit") => return false,
        Some("/peers") => {
            let mut peers = node.lan_peers();
            peers.extend(node.global_peers());
            sort_records(&mut peers);
            if peers.is_empty() {
                println!("No peers discovered yet");
            }
            for peer in peers {
                println!("  - {} ({}:{})", peer.name, peer.address, peer.port);
            }
        }
        Some("/connect") => match (words.next(), words.next().and_then(|p| p.parse::<u16>().ok())) {
            (Some(host), Some(port)) => {
                let (id, connected) = node.connect(host, port, None).await;
                if connected {
                    println!("✓ Connection #{id} open");
                }
            }
            _ => println!("Usage: /connect <host> <port>"),
        },
        _ if line.is_empty() => {}
        _ => {
            if node.broadcast(line).await == 0 {
                println!("No open connections");
            }
        }
    }
    true
}

async fn handle_chat_command(host: String, port: u16, name: Option<String>, config: PeerlineConfig) -> Result<()> {
    let name = name.unwrap_or_else(|| config.identity.display_name.clone());
    info!("Chatting as '{}'", name);

    let connection = PeerConnection::new(ConnectionOptions::from(&config.network));
    let connected = connection.connect(&host, port).await;
    connection.poll_received(|item| println!("{item}"));
    if !connected {
        anyhow::bail!("could not reach {host}:{port}");
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            item = connection.recv() => match item {
                Some(item) => {
                    println!("{item}");
                    if item.is_disconnect() {
                        break;
                    }
                }
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim_end() == "/quit" => break,
                Some(line) => connection.send(line.trim_end()).await,
                None => stdin_open = false,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    connection.close().await;
    connection.poll_received(|item| println!("{item}"));
    Ok(())
}

async fn handle_peers_command(timeout: u64, config: PeerlineConfig) -> Result<()> {
    println!("Discovering peers for {timeout}s...");

    let beacon = PresenceBeacon::new(config.beacon.clone());
    // Port 0 is rejected by every receiver, so the scan itself stays invisible.
    beacon.start(&config.identity.display_name, 0).await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {}
        _ = signal::ctrl_c() => warn!("Interrupted"),
    }

    let peers = beacon.get_active_peers();
    beacon.stop(config.network.join_timeout()).await;

    if peers.is_empty() {
        println!("No peers found");
    } else {
        println!("✓ Found {} peer(s)", peers.len());
        for peer in peers {
            println!("  - {} ({}:{})", peer.name, peer.address, peer.port);
        }
    }
    Ok(())
}

async fn handle_relay_command(host: Option<String>, port: Option<u16>, mut config: PeerlineConfig) -> Result<()> {
    if let Some(host) = host {
        config.relay.bind_host = host;
    }
    if let Some(port) = port {
        config.relay.port = port;
    }

    let server = RelayServer::bind(&config.relay).await?;
    println!("✓ Relay listening on http://{}", server.local_addr());

    server
        .serve_until(async {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &PeerlineConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = PeerlineConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                PeerlineConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let table: toml::Table = toml::from_str(&config_str)?;
                let value = table
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown section: {}", section_name))?;
                println!("[{section_name}]");
                println!("{}", toml::to_string_pretty(value)?);
            } else {
                println!("{config_str}");
            }
        }
    }
    Ok(())
}
