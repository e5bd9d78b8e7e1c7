//! Glink Node -- serverless LAN chat.
//!
//! Usage:
//!   glink-node                      # Run with default config
//!   glink-node --config path.toml   # Run with custom config
//!   glink-node identity             # Show node identity
//!   glink-node chats                # List chats
//!   glink-node history <cid>        # Print a chat's messages

use std::sync::Arc;

use clap::{Parser, Subcommand};
use glink_node::config::NodeConfig;
use glink_node::{expand_tilde, load_or_create_identity, start_node, NodeOptions};
use glink_storage::{SqliteStorage, Storage};
use glink_sync::UiEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "glink-node", about = "Serverless LAN chat node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.glink/config.toml")]
    config: String,

    /// Display name (stored on first use)
    #[arg(short, long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node identity
    Identity,
    /// List chats, most recently active first
    Chats,
    /// Print the messages of a chat
    History {
        /// Chat id
        cid: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glink_node=info,glink_sync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    let db_path = expand_tilde(&cfg.node.database);
    let storage = SqliteStorage::open(&db_path)?;
    let name = cli.name.as_deref().or(cfg.node.name.as_deref());
    let own = load_or_create_identity(&storage, name)?;

    match cli.command {
        Some(Commands::Identity) => {
            println!("Node ID: {}", own.uid);
            println!("Name: {}", own.name);
            println!("Database: {}", db_path.display());
        }
        Some(Commands::Chats) => {
            let chats = storage.list_chats()?;
            println!("{}", serde_json::to_string_pretty(&chats)?);
        }
        Some(Commands::History { cid }) => {
            for msg in storage.chat_messages(&cid)? {
                let author = storage.name_by_uid(&msg.uid)?.unwrap_or(msg.uid.clone());
                println!("[{}#{}] {}: {}", cid, msg.index, author, msg.text);
            }
        }
        Some(Commands::Run) | None => {
            tracing::info!(db = %db_path.display(), version = env!("CARGO_PKG_VERSION"), "starting glink-node");
            run_node(Arc::new(storage), own, &cfg).await?;
        }
    }

    Ok(())
}

/// Line-oriented front end on stdin/stdout.
///
///   /use <cid>   select the chat that plain lines go to
///   !conn <name> connect to a discovered peer and open a chat
///   !candidates  list discovered peers
///   <text>       send to the selected chat
async fn run_node(
    storage: Arc<dyn Storage>,
    own: glink_storage::UserLightInfo,
    cfg: &NodeConfig,
) -> anyhow::Result<()> {
    let options = NodeOptions::from_config(cfg)?;
    let node = start_node(storage.clone(), own, options).await?;
    println!(
        "{} ({}) listening on {}",
        node.own.name,
        node.own.uid,
        node.listener_address()
    );

    let mut ui = node.subscribe_ui();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<String> = storage.list_chats()?.first().map(|c| c.cid.clone());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(cid) = line.strip_prefix("/use ") {
                    current = Some(cid.trim().to_string());
                    println!("now in chat {}", cid.trim());
                    continue;
                }
                let cid = current.clone().unwrap_or_default();
                if cid.is_empty() && !line.starts_with(glink_protocol::COMMAND_SENTINEL) {
                    println!("no chat selected; /use <cid> or !conn <name>");
                    continue;
                }
                node.send(&cid, line).await?;
            }
            event = ui.recv() => {
                match event {
                    Ok(UiEvent::ChatUpdate { info, .. }) if current.is_none() => {
                        current = Some(info.cid.clone());
                        render(&UiEvent::ChatUpdate { info, new_uids: Vec::new() });
                    }
                    Ok(event) => render(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ui lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown().await;
    Ok(())
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::NewMessage(m) => println!("[{}#{}] {}: {}", m.cid, m.index, m.uid, m.text),
        UiEvent::MessageBatch(batch) => {
            for m in batch {
                println!("[{}#{}] {}: {}", m.cid, m.index, m.uid, m.text);
            }
        }
        UiEvent::ChatUpdate { info, new_uids } => {
            println!(
                "chat {} \"{}\" members: {}",
                info.cid,
                info.name,
                info.participants.join(", ")
            );
            if !new_uids.is_empty() {
                println!("  joined: {}", new_uids.join(", "));
            }
        }
        UiEvent::Candidates(list) => {
            for c in list {
                println!("candidate {} ({}) at {}", c.name, c.uid, c.endpoint);
            }
        }
        UiEvent::CommandRejected { command, reason } => println!("!{command}: {reason}"),
        UiEvent::InviteExpired { cid, peer } => println!("invite to {peer} for {cid} expired"),
    }
}
