//! CLI entry point for the peer courier.
//!
//! This binary provides a command-line interface for the courier library,
//! supporting identity management, configuration, contacts and an
//! interactive chat session over TCP.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use peer_courier::{
    app::{Node, NodeEvent, NodeHandle},
    storage::{ChatLog, FileStore, IdentityDirectory, Sender},
    transfer::guess_mime,
    utils::{MessengerConfig, StorageConfig, DEFAULT_CONFIG_FILE},
    TcpTransport, UserProfile,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use uuid::Uuid;

/// Peer Courier - authenticated peer-to-peer chat and file transfer
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "Peer-to-peer chat with signed messages and encrypted envelopes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
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

    /// Data directory for keys, chats and received files
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect identity keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Show the local profile
    Profile {
        /// Display format (json, pretty)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Manage the contact list
    Contacts {
        #[command(subcommand)]
        action: ContactCommands,
    },
    /// Run an interactive chat session
    Run {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Peer address book entries as ID=ADDR
        #[arg(short, long, value_parser = parse_peer)]
        peer: Vec<(String, SocketAddr)>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity
    Generate {
        /// Account name; also the peer id
        #[arg(short, long)]
        username: Option<String>,
        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current public keys
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
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

#[derive(Subcommand)]
enum ContactCommands {
    /// Add a contact by peer id or phone number
    Add {
        /// Peer id, or digits for a phone contact
        id: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List contacts
    List,
}

fn parse_peer(value: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got '{value}'"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{addr}': {e}"))?;
    Ok((id.to_string(), addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet)?;

    // Load configuration
    let mut config = MessengerConfig::load(cli.config.as_deref())?;

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage = StorageConfig::rooted_at(data_dir);
    }

    // Ensure directories exist
    config.ensure_directories()?;

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Profile { format } => handle_profile_command(&format, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Contacts { action } => handle_contact_commands(action, &config),
        Commands::Run { listen, peer } => handle_run_command(listen, peer, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn handle_key_commands(action: KeyCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        KeyCommands::Generate {
            username,
            name,
            force,
        } => {
            let keys_dir = &config.storage.keys_dir;
            if UserProfile::exists_in(keys_dir) && !force {
                return Err(anyhow::anyhow!(
                    "Identity already exists. Use --force to overwrite."
                ));
            }

            let username = username.unwrap_or_else(|| config.identity.username.clone());
            let display_name = name.unwrap_or_else(|| config.identity.display_name.clone());
            info!("Generating new identity for '{}'", username);
            let profile = UserProfile::new(username, display_name);
            profile.save(keys_dir)?;

            println!("✓ Identity generated successfully");
            println!("  Username: {}", profile.username());
            println!("  Name: {}", profile.display_name());
            println!("  Saved to: {}", keys_dir.display());
        }
        KeyCommands::Show { format } => {
            let profile = UserProfile::load(&config.storage.keys_dir)?;
            let signing = profile.keypair.public_key_bytes();
            let agreement = profile.agreement.public_key_bytes();

            let encode = |bytes: &[u8]| match format.as_str() {
                "hex" => Ok(hex::encode(bytes)),
                "base64" => Ok(general_purpose::STANDARD.encode(bytes)),
                _ => Err(anyhow::anyhow!("Unsupported format: {}", format)),
            };
            println!("Signing key:   {}", encode(&signing)?);
            println!("Agreement key: {}", encode(&agreement)?);
        }
    }
    Ok(())
}

fn handle_profile_command(format: &str, config: &MessengerConfig) -> Result<()> {
    let profile = UserProfile::load(&config.storage.keys_dir)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&profile.record)?);
        }
        "pretty" => {
            println!("User Profile");
            println!("============");
            println!("Username: {}", profile.username());
            println!("Name: {}", profile.display_name());
            println!(
                "Created: {}",
                profile.record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("Public Key: {}", profile.record.public_key);
        }
        _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
    }

    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            match section {
                Some(section_name) => {
                    let table: toml::Value = toml::from_str(&config_str)?;
                    let value = table.get(&section_name).ok_or_else(|| {
                        anyhow::anyhow!("No section '{}' in configuration", section_name)
                    })?;
                    println!("[{}]", section_name);
                    println!("{}", toml::to_string_pretty(value)?);
                }
                None => println!("{}", config_str),
            }
        }
    }
    Ok(())
}

fn handle_contact_commands(action: ContactCommands, config: &MessengerConfig) -> Result<()> {
    let profile = UserProfile::load(&config.storage.keys_dir)?;
    let mut store = FileStore::open(&config.storage.store_dir)?;
    let mut chat_log = ChatLog::load(&store, profile.username())?;

    match action {
        ContactCommands::Add { id, name } => {
            match chat_log.add_contact(&id, name.as_deref(), profile.username())? {
                Some(contact) => {
                    let mut directory = IdentityDirectory::load(&store)?;
                    directory.add_manual(&contact.id);
                    directory.save(&mut store)?;
                    chat_log.save(&mut store)?;
                    println!("✓ Added {} ({})", contact.name, contact.id);
                }
                None => println!("Contact already exists"),
            }
        }
        ContactCommands::List => {
            if chat_log.contacts().is_empty() {
                println!("No contacts");
            }
            for contact in chat_log.contacts() {
                println!(
                    "{:<20} {:<20} {} {}",
                    contact.id, contact.name, contact.last_message_time, contact.last_message
                );
            }
        }
    }
    Ok(())
}

async fn handle_run_command(
    listen: Option<SocketAddr>,
    peers: Vec<(String, SocketAddr)>,
    mut config: MessengerConfig,
) -> Result<()> {
    // Override config with command line options
    if let Some(listen) = listen {
        config.network.listen_address = listen;
    }
    config.network.peers.extend(peers);

    let profile = UserProfile::load_or_create(
        &config.storage.keys_dir,
        &config.identity.username,
        &config.identity.display_name,
    )?;

    info!("Starting peer courier as {}", profile);
    info!("Listening on {}", config.network.listen_address);
    info!("Known peers: {:?}", config.network.peers.keys().collect::<Vec<_>>());

    let (transport, transport_events) = TcpTransport::new(
        config.network.listen_address,
        config.network.peers.clone(),
        Duration::from_secs(config.network.connect_timeout_secs),
    );
    let store = FileStore::open(&config.storage.store_dir)?;
    let (node, handle) = Node::new(&config, profile, transport, transport_events, Box::new(store))?;

    let events = handle.subscribe();
    tokio::spawn(print_events(events));
    let node_task = tokio::spawn(node.run());

    println!("Type /help for commands.");

    tokio::select! {
        result = interactive_loop(&handle) => {
            if let Err(e) = result {
                error!("Input error: {}", e);
            }
        }
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for CTRL+C: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gracefully...");
    handle.shutdown();
    match node_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("Node task failed: {}", e)),
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<NodeEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            NodeEvent::Registered { local_id } => println!("* Registered as {local_id}"),
            NodeEvent::RegistrationFailed { reason, retrying } => {
                println!("* Registration failed: {reason}{}", if retrying { " (retrying)" } else { "" });
            }
            NodeEvent::StatusChanged { peer_id, status } => println!("* {peer_id} is {status}"),
            NodeEvent::HandshakeReceived { .. } => {}
            NodeEvent::ContactAdded { contact } => {
                println!("* New contact {} ({})", contact.name, contact.id);
            }
            NodeEvent::MessageReceived { peer_id, message } => {
                let mark = if message.is_verified { "✓" } else { "?" };
                println!("[{}] {} {}: {}", message.time, mark, peer_id, message.text);
            }
            NodeEvent::MessageDeleted { peer_id, message_id } => {
                println!("* {peer_id} deleted message {message_id}");
            }
            NodeEvent::FileReceived { peer_id, message } => {
                println!(
                    "[{}] {} sent file '{}' ({})",
                    message.time,
                    peer_id,
                    message.file_name.unwrap_or_default(),
                    message.file_url.unwrap_or_default()
                );
            }
            NodeEvent::TransferFailed {
                peer_id, reason, ..
            } => println!("* File from {peer_id} failed: {reason}"),
        }
    }
}

const HELP: &str = "\
/connect <peer>          connect to a peer
/focus <peer>            open a chat (plain lines are sent to it)
/msg <peer> <text>       send a message
/file <peer> <path>      send a file
/delete <peer> <id>      delete one of your messages
/history <peer>          show the chat history
/contacts                list contacts
/add <id> [name]         add a contact
/status [peer]           show connection status
/quit                    exit";

async fn interactive_loop(handle: &NodeHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut focus: Option<String> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('/') {
            match &focus {
                Some(peer_id) => report(handle.send_message(peer_id, line).await.map(|_| ())),
                None => println!("No chat focused; use /focus <peer>"),
            }
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        let command = parts.next().unwrap_or_default();
        let first = parts.next();
        let rest = parts.next();

        match (command, first, rest) {
            ("/quit", _, _) => break,
            ("/help", _, _) => println!("{HELP}"),
            ("/connect", Some(peer_id), _) => {
                report(handle.connect(peer_id).await.map(|s| println!("{peer_id}: {s}")));
            }
            ("/focus", Some(peer_id), _) => {
                focus = Some(peer_id.to_string());
                report(handle.focus(Some(peer_id)).await.map(|_| ()));
                print_history(handle, peer_id).await;
            }
            ("/msg", Some(peer_id), Some(text)) => {
                report(handle.send_message(peer_id, text).await.map(|_| ()));
            }
            ("/file", Some(peer_id), Some(path)) => {
                if let Err(e) = send_file(handle, peer_id, Path::new(path)).await {
                    println!("Error: {e}");
                }
            }
            ("/delete", Some(peer_id), Some(id)) => match Uuid::parse_str(id) {
                Ok(id) => match handle.delete_message(peer_id, id).await {
                    Ok(true) => println!("✓ Deleted"),
                    Ok(false) => println!("No message {id} of yours in chat with {peer_id}"),
                    Err(e) => println!("Error: {e}"),
                },
                Err(e) => println!("Invalid message id: {e}"),
            },
            ("/history", Some(peer_id), _) => print_history(handle, peer_id).await,
            ("/contacts", _, _) => match handle.contacts().await {
                Ok(contacts) => {
                    for contact in contacts {
                        println!("{} ({}): {}", contact.name, contact.id, contact.last_message);
                    }
                }
                Err(e) => println!("Error: {e}"),
            },
            ("/add", Some(id), name) => match handle.add_contact(id, name).await {
                Ok(Some(contact)) => println!("✓ Added {} ({})", contact.name, contact.id),
                Ok(None) => println!("Contact already exists"),
                Err(e) => println!("Error: {e}"),
            },
            ("/status", Some(peer_id), _) => match handle.connection(peer_id).await {
                Ok(Some(info)) => println!(
                    "{}: {} (standby channels: {})",
                    info.peer_id, info.status, info.standby
                ),
                Ok(None) => println!("{peer_id}: disconnected"),
                Err(e) => println!("Error: {e}"),
            },
            ("/status", None, _) => match handle.stats().await {
                Ok(stats) => {
                    println!("Local id: {}", stats.local_id);
                    println!(
                        "Peers: {} connected, {} connecting, {} errored",
                        stats.connections.connected,
                        stats.connections.connecting,
                        stats.connections.errored
                    );
                    println!(
                        "Frames: {} sent, {} received, {} rejected",
                        stats.connections.frames_sent,
                        stats.connections.frames_received,
                        stats.connections.frames_rejected
                    );
                    println!("Contacts: {}", stats.contacts);
                    println!("Uptime: {}s", stats.uptime.num_seconds());
                }
                Err(e) => println!("Error: {e}"),
            },
            _ => println!("Unknown command; /help lists commands"),
        }
    }
    Ok(())
}

async fn send_file(handle: &NodeHandle, peer_id: &str, path: &Path) -> Result<()> {
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("Not a file: {}", path.display()))?;
    let file_id = handle
        .send_file(peer_id, &file_name, guess_mime(&file_name), data)
        .await?;
    println!("✓ Sent '{}' ({})", file_name, file_id);
    Ok(())
}

async fn print_history(handle: &NodeHandle, peer_id: &str) {
    let history = match handle.history(peer_id).await {
        Ok(history) => history,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    for message in history {
        let who = match &message.sender {
            Sender::Me => "me",
            Sender::Peer(id) => id.as_str(),
        };
        let body = if message.deleted {
            "(deleted)".to_string()
        } else if let Some(name) = &message.file_name {
            format!("[file] {name}")
        } else {
            message.text.clone()
        };
        println!("[{}] {} {}: {}  ({})", message.time, if message.is_verified { "✓" } else { "?" }, who, body, message.id);
    }
}

fn report(result: peer_courier::Result<()>) {
    if let Err(e) = result {
        match e.user_hint() {
            Some(hint) => println!("{hint} ({e})"),
            None => println!("Error: {e}"),
        }
    }
}
