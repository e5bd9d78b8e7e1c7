//! Glink Sync -- chat synchronisation engine.
//!
//! Pure protocol logic, no I/O: the engine consumes discovery, connection
//! and user events and returns the ordered actions the runtime must carry
//! out. Storage is the only collaborator it calls directly.
//!
//! Anti-entropy is pull-based:
//!   WatchedCids -> HaveCidInfo -> MessagesRequest -> ChatMessagePack
//! and only the per-(chat, author) deficit is ever fetched.

use std::collections::HashMap;

use glink_protocol::{ChatInfo, ChatMessage, ChatsClock, Cid, NodeAnnounce, Uid};
use glink_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};

pub mod engine;

pub use engine::{Action, SyncEngine};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("no sequence index left in chat {0}")]
    SequenceExhausted(Cid),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Default time an invite may stay unanswered.
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 30;

/// Default period of the anti-entropy round over live connections.
pub const DEFAULT_ANTI_ENTROPY_INTERVAL_SECS: u64 = 60;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub invite_timeout_secs: u64,
    /// 0 disables the periodic round (connect-time rounds still run).
    pub anti_entropy_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: DEFAULT_INVITE_TIMEOUT_SECS,
            anti_entropy_interval_secs: DEFAULT_ANTI_ENTROPY_INTERVAL_SECS,
        }
    }
}

/// Progress of one chat-invite handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Peer discovered, no connection yet.
    Candidate,
    /// Socket established.
    Connected,
    /// InviteForJoin sent or received.
    Invited,
    /// JoinChat exchanged. Terminal.
    Joined,
}

/// Events for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    NewMessage(ChatMessage),
    /// Messages newly stored from one ChatMessagePack.
    MessageBatch(Vec<ChatMessage>),
    ChatUpdate {
        info: ChatInfo,
        new_uids: Vec<Uid>,
    },
    Candidates(Vec<NodeAnnounce>),
    CommandRejected {
        command: String,
        reason: String,
    },
    InviteExpired {
        cid: Cid,
        peer: Uid,
    },
}

/// Local commands entered with the `!` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `!conn <name>`: connect to a candidate and invite it to a new chat.
    Connect(String),
    /// `!candidates`: list discovered, not yet connected peers.
    Candidates,
}

impl Command {
    /// Parse the text following the sentinel.
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let mut parts = input.trim().splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).unwrap_or_default();
        match verb {
            "conn" if !arg.is_empty() => Ok(Command::Connect(arg.to_string())),
            "conn" => Err("usage: !conn <name>".into()),
            "candidates" => Ok(Command::Candidates),
            "" => Err("empty command".into()),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Build the MessagesRequest cursors from a local and a remote clock.
///
/// `local` is the requester's gap-free prefix per (chat, author), `remote`
/// the peer's max clock. Where the remote value is ahead, the local value is
/// the cursor (0 when the author is unknown locally). Pairs without a
/// deficit are omitted, and so are chats left empty.
pub fn generate_messages_request(local: &ChatsClock, remote: &ChatsClock) -> ChatsClock {
    let mut deficit = ChatsClock::new();
    for (cid, remote_clock) in remote {
        let local_clock = local.get(cid);
        for (uid, &remote_max) in remote_clock {
            let local_max = local_clock
                .and_then(|c| c.get(uid))
                .copied()
                .unwrap_or(0);
            if remote_max > local_max {
                deficit
                    .entry(cid.clone())
                    .or_default()
                    .insert(uid.clone(), local_max);
            }
        }
    }
    deficit
}

/// Last assigned index per chat for the local author.
///
/// Loaded lazily from storage on first use per chat, then only ever raised.
#[derive(Debug, Default)]
pub struct SequenceCounters {
    last: HashMap<Cid, u32>,
}

impl SequenceCounters {
    /// Next index to assign in `cid`; does not reserve it.
    pub fn peek_next(
        &mut self,
        storage: &dyn Storage,
        own_uid: &str,
        cid: &str,
    ) -> Result<u32> {
        let last = match self.last.get(cid) {
            Some(&last) => last,
            None => {
                let last = storage.last_index(cid, own_uid)?;
                self.last.insert(cid.to_string(), last);
                last
            }
        };
        last.checked_add(1)
            .ok_or_else(|| SyncError::SequenceExhausted(cid.to_string()))
    }

    /// Record `index` as used. Never lowers a counter.
    pub fn commit(&mut self, cid: &str, index: u32) {
        let entry = self.last.entry(cid.to_string()).or_insert(0);
        *entry = (*entry).max(index);
    }

    /// Raise a cached counter after an own message came back from the network.
    /// Uncached chats load the stored value on first use anyway.
    pub fn observe(&mut self, cid: &str, index: u32) {
        if let Some(last) = self.last.get_mut(cid) {
            *last = (*last).max(index);
        }
    }
}

/// Fresh opaque identifier: 16 random bytes, hex encoded.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
