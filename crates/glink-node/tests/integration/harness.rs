//! Test harness for in-process glink-node integration tests.
//!
//! TestNode runs a real node (TCP listener, sync loop, SQLite file in a
//! temp dir) without multicast discovery.

use std::sync::Arc;
use std::time::Duration;

use glink_node::connection::ConnectionConfig;
use glink_node::{load_or_create_identity, start_node, NodeOptions, RunningNode};
use glink_protocol::{ChatInfo, ChatMessage};
use glink_storage::{SqliteStorage, Storage};
use glink_sync::{SyncConfig, UiEvent};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `check` every 50 ms until it holds, or fail after `timeout`.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub struct TestNode {
    pub node: RunningNode,
    pub storage: Arc<SqliteStorage>,
    ui: broadcast::Receiver<UiEvent>,
    dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(name: &str) -> anyhow::Result<Self> {
        Self::start_in(tempfile::tempdir()?, name).await
    }

    /// Start on an existing data dir (restart with the same identity and history).
    pub async fn start_in(dir: tempfile::TempDir, name: &str) -> anyhow::Result<Self> {
        let storage = Arc::new(SqliteStorage::open(&dir.path().join("glink.db"))?);
        let own = load_or_create_identity(&*storage, Some(name))?;
        let options = NodeOptions {
            connection: ConnectionConfig {
                listen_host: "127.0.0.1".into(),
                handshake_timeout: Duration::from_secs(2),
                read_timeout: None,
                write_timeout: Duration::from_secs(5),
            },
            sync: SyncConfig {
                invite_timeout_secs: 5,
                anti_entropy_interval_secs: 0,
            },
            discovery: None,
        };
        let node = start_node(storage.clone(), own, options).await?;
        let ui = node.subscribe_ui();
        Ok(Self {
            node,
            storage,
            ui,
            dir,
        })
    }

    pub fn uid(&self) -> String {
        self.node.own.uid.clone()
    }

    pub fn name(&self) -> String {
        self.node.own.name.clone()
    }

    /// Deliver our announcement to `other`, as multicast would.
    pub async fn announce_to(&self, other: &TestNode) -> anyhow::Result<()> {
        other.node.announce(self.node.node_announce()).await
    }

    pub async fn send(&self, cid: &str, text: &str) -> anyhow::Result<()> {
        self.node.send(cid, text).await
    }

    /// Record `other` as an already known peer.
    pub fn remember(&self, other: &TestNode) {
        self.storage
            .save_new_uid(&other.uid(), &other.name(), Some(&other.node.listener_address()))
            .unwrap();
    }

    pub fn seed_chat(&self, cid: &str, participants: &[&TestNode]) {
        let chat = ChatInfo {
            cid: cid.into(),
            name: cid.into(),
            participants: participants.iter().map(|n| n.uid()).collect(),
            group: true,
        };
        self.storage.save_new_chat(&chat).unwrap();
    }

    pub fn seed_messages(&self, cid: &str, author: &TestNode, indices: std::ops::RangeInclusive<u32>) {
        for index in indices {
            self.storage
                .save_message(&ChatMessage {
                    uid: author.uid(),
                    cid: cid.into(),
                    index,
                    text: format!("{}#{index}", author.name()),
                })
                .unwrap();
        }
    }

    pub fn chats(&self) -> Vec<ChatInfo> {
        self.storage.list_chats().unwrap()
    }

    pub fn messages(&self, cid: &str) -> Vec<ChatMessage> {
        self.storage.chat_messages(cid).unwrap()
    }

    pub async fn wait_message_count(&self, cid: &str, n: usize) -> anyhow::Result<()> {
        let storage = self.storage.clone();
        wait_until(&format!("{n} messages in {cid}"), WAIT, || {
            storage.chat_messages(cid).map(|m| m.len()).unwrap_or(0) >= n
        })
        .await
    }

    pub async fn wait_connected(&self, other: &TestNode) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.node.connections.is_connected(&other.uid()).await {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{} never connected to {}", self.name(), other.name());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    pub async fn wait_disconnected(&self, uid: &str) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.node.connections.is_connected(uid).await {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{} still connected to {uid}", self.name());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Let the sync loop see the Disconnected event too
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    /// Next UI event matching `pred`.
    pub async fn wait_event<F>(&mut self, mut pred: F) -> anyhow::Result<UiEvent>
    where
        F: FnMut(&UiEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.ui.recv()).await {
                Ok(Ok(event)) if pred(&event) => return Ok(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => anyhow::bail!("ui channel closed"),
                Err(_) => anyhow::bail!("timeout waiting for ui event"),
            }
        }
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }

    /// Stop the node and keep its data dir for a restart.
    pub async fn stop(self) -> tempfile::TempDir {
        self.node.shutdown().await;
        self.dir
    }
}
