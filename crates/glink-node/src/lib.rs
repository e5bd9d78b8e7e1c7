//! Glink Node -- library crate for the serverless LAN chat node.
//!
//! Wires discovery, the connection manager and the sync loop together.
//! Re-exports the modules so integration tests and the binary can drive
//! a node in-process.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod sync_task;

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glink_protocol::{Cid, ConnectInfo, NodeAnnounce};
use glink_storage::{Storage, UserLightInfo};
use glink_sync::{SyncConfig, SyncEngine, UiEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::discovery::{DedupPolicy, Discovery};
use crate::sync_task::UiCommand;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Own identity from storage; generated and persisted on first start.
/// `name` is stored when given, or when the database has no name yet.
pub fn load_or_create_identity(
    storage: &dyn Storage,
    name: Option<&str>,
) -> anyhow::Result<UserLightInfo> {
    let own = match storage.own_info()? {
        Some(own) => own,
        None => {
            let uid = glink_sync::generate_id();
            storage.set_own_uid(&uid)?;
            tracing::info!(%uid, "generated node identity");
            UserLightInfo {
                uid,
                name: String::new(),
            }
        }
    };

    let name = match name {
        Some(name) => name.to_string(),
        None if own.name.is_empty() => default_name(&own.uid),
        None => return Ok(own),
    };
    if name != own.name {
        storage.set_own_name(&name)?;
    }
    Ok(UserLightInfo { name, ..own })
}

fn default_name(uid: &str) -> String {
    format!("node-{}", uid.chars().take(8).collect::<String>())
}

/// Discovery settings for [`start_node`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub group: SocketAddrV4,
    pub interval: Duration,
    pub dedup: DedupPolicy,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    /// `None` runs without multicast; peers can still be fed in through
    /// [`RunningNode::announce`].
    pub discovery: Option<DiscoveryOptions>,
}

impl NodeOptions {
    pub fn from_config(cfg: &config::NodeConfig) -> anyhow::Result<Self> {
        let discovery = if cfg.discovery.enabled {
            Some(DiscoveryOptions {
                group: cfg.discovery.multicast_addr()?,
                interval: cfg.discovery.announce_interval(),
                dedup: cfg.discovery.dedup,
            })
        } else {
            None
        };
        Ok(Self {
            connection: cfg.connection_config(),
            sync: cfg.sync_config(),
            discovery,
        })
    }
}

/// Handles to a started node.
pub struct RunningNode {
    pub own: UserLightInfo,
    pub storage: Arc<dyn Storage>,
    pub connections: ConnectionManager,
    commands: mpsc::Sender<UiCommand>,
    announces: mpsc::Sender<NodeAnnounce>,
    ui_events: broadcast::Sender<UiEvent>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningNode {
    pub fn listener_address(&self) -> String {
        self.connections.listener_address()
    }

    /// Our announcement, as discovery broadcasts it.
    pub fn node_announce(&self) -> NodeAnnounce {
        NodeAnnounce {
            uid: self.own.uid.clone(),
            name: self.own.name.clone(),
            endpoint: self.listener_address(),
        }
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events.subscribe()
    }

    /// Submit chat text or a `!` command.
    pub async fn send(&self, cid: &str, text: &str) -> anyhow::Result<()> {
        self.commands
            .send(UiCommand::Send {
                cid: Cid::from(cid),
                text: text.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("sync loop is not running"))
    }

    /// Feed an announcement to the engine as if discovery had received it.
    pub async fn announce(&self, announce: NodeAnnounce) -> anyhow::Result<()> {
        self.announces
            .send(announce)
            .await
            .map_err(|_| anyhow::anyhow!("sync loop is not running"))
    }

    /// Stop every loop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Start the connection manager, the sync loop and (optionally) discovery.
pub async fn start_node(
    storage: Arc<dyn Storage>,
    own: UserLightInfo,
    options: NodeOptions,
) -> anyhow::Result<RunningNode> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (network_tx, network_rx) = mpsc::channel(256);
    let (announce_tx, announce_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(64);
    let (ui_tx, _) = broadcast::channel::<UiEvent>(256);

    let hello = ConnectInfo {
        my_uid: own.uid.clone(),
        my_name: own.name.clone(),
    };
    let (connections, accept_handle) =
        ConnectionManager::start(hello, options.connection, network_tx, shutdown_tx.clone())
            .await?;
    let mut handles = vec![accept_handle];

    if let Some(disc) = &options.discovery {
        let discovery = Discovery::new(
            NodeAnnounce {
                uid: own.uid.clone(),
                name: own.name.clone(),
                endpoint: connections.listener_address(),
            },
            disc.dedup,
        );
        let handle = discovery::spawn_discovery(
            discovery,
            disc.group,
            disc.interval,
            announce_tx.clone(),
            &shutdown_tx,
        )?;
        handles.push(handle.recv);
        handles.push(handle.announce);
    }

    let engine = SyncEngine::new(own.clone(), storage.clone(), options.sync);
    let sync_handle = {
        let conns = connections.clone();
        let ui_tx = ui_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            sync_task::run_sync_loop(
                engine,
                conns,
                announce_rx,
                network_rx,
                command_rx,
                ui_tx,
                shutdown,
            )
            .await;
        })
    };
    handles.push(sync_handle);

    tracing::info!(
        uid = %own.uid,
        name = %own.name,
        listen = %connections.listener_address(),
        discovery = options.discovery.is_some(),
        "node started"
    );

    Ok(RunningNode {
        own,
        storage,
        connections,
        commands: command_tx,
        announces: announce_tx,
        ui_events: ui_tx,
        shutdown_tx,
        handles,
    })
}
