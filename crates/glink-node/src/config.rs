//! Configuration types for glink-node.
//! Parsed from ~/.glink/config.toml.

use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;

use crate::discovery::DedupPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_database")]
    pub database: String,
    /// Display name, used when the database has none yet.
    pub name: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            database: default_database(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_multicast_addr")]
    pub multicast_addr: String,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default)]
    pub dedup: DedupPolicy,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast_addr: default_multicast_addr(),
            announce_interval_ms: default_announce_interval_ms(),
            dedup: DedupPolicy::default(),
        }
    }
}

impl DiscoverySection {
    pub fn multicast_addr(&self) -> anyhow::Result<SocketAddrV4> {
        let addr: SocketAddrV4 = self.multicast_addr.parse()?;
        if !addr.ip().is_multicast() {
            anyhow::bail!("{} is not a multicast address", addr.ip());
        }
        Ok(addr)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 0 disables the read deadline.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// 0 disables the periodic round.
    #[serde(default = "default_anti_entropy_interval_secs")]
    pub anti_entropy_interval_secs: u64,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            anti_entropy_interval_secs: default_anti_entropy_interval_secs(),
            invite_timeout_secs: default_invite_timeout_secs(),
        }
    }
}

// Default value functions
fn default_database() -> String {
    "~/.glink/glink.db".into()
}
fn default_enabled() -> bool {
    true
}
fn default_multicast_addr() -> String {
    glink_protocol::DEFAULT_DISCOVERY_ADDR.into()
}
fn default_announce_interval_ms() -> u64 {
    glink_protocol::ANNOUNCE_INTERVAL_MS
}
fn default_listen_host() -> String {
    "0.0.0.0".into()
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    180
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_anti_entropy_interval_secs() -> u64 {
    glink_sync::DEFAULT_ANTI_ENTROPY_INTERVAL_SECS
}
fn default_invite_timeout_secs() -> u64 {
    glink_sync::DEFAULT_INVITE_TIMEOUT_SECS
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn sync_config(&self) -> glink_sync::SyncConfig {
        glink_sync::SyncConfig {
            invite_timeout_secs: self.sync.invite_timeout_secs,
            anti_entropy_interval_secs: self.sync.anti_entropy_interval_secs,
        }
    }

    pub fn connection_config(&self) -> crate::connection::ConnectionConfig {
        crate::connection::ConnectionConfig {
            listen_host: self.network.listen_host.clone(),
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs.max(1)),
            read_timeout: match self.network.read_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            write_timeout: Duration::from_secs(self.network.write_timeout_secs.max(1)),
        }
    }
}
