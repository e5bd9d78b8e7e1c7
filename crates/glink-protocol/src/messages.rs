//! Wire message types and the type-id registry.
//!
//! Field names serialise in PascalCase so payloads stay readable next to the
//! numeric type ids in the frame header. Registry ids are additive only: new
//! kinds take the next free id, existing ids are never renumbered.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ChatsClock, Cid, ProtocolError, Uid};

// ============================================================================
// Discovery / connection
// ============================================================================

/// Periodic multicast announcement of a node's identity and TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeAnnounce {
    pub uid: Uid,
    pub name: String,
    pub endpoint: String,
}

/// First frame on every TCP connection; binds the socket to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectInfo {
    pub my_uid: Uid,
    pub my_name: String,
}

// ============================================================================
// Chat membership
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatInfo {
    pub cid: Cid,
    pub name: String,
    pub participants: Vec<Uid>,
    pub group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InviteForJoin {
    pub from: Uid,
    pub to: Uid,
    pub chat: ChatInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinChat {
    pub from: Uid,
    pub to: Uid,
    pub cid: Cid,
}

// ============================================================================
// Chat messages
// ============================================================================

/// A chat message. `(uid, cid, index)` identifies it uniquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    /// Author.
    pub uid: Uid,
    pub cid: Cid,
    /// Per-(author, chat) sequence number, starting at 1.
    pub index: u32,
    pub text: String,
}

// ============================================================================
// Reconciliation (anti-entropy)
// ============================================================================

/// Step 1: the chats the sender wants to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatchedCids {
    pub from: Uid,
    pub to: Uid,
    pub cids: Vec<Cid>,
}

/// Step 2: the responder's vector clock for the requested chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HaveCidInfo {
    pub from: Uid,
    pub to: Uid,
    pub chats_vector_clock: ChatsClock,
}

/// Step 3: per-(chat, author) resume cursors; everything above each cursor is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessagesRequest {
    pub from: Uid,
    pub to: Uid,
    pub vector_clock_from: ChatsClock,
}

/// Step 4: the batch answering a MessagesRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessagePack {
    pub from: Uid,
    pub to: Uid,
    pub messages: Vec<ChatMessage>,
}

// ============================================================================
// Registry
// ============================================================================

/// A value that can travel in a frame: it has a registry id.
pub trait WireMessage: Serialize + DeserializeOwned + Into<Message> {
    const TYPE: MessageType;
}

macro_rules! registry {
    ($($name:ident = $id:literal),+ $(,)?) => {
        /// Logical message kinds and their numeric wire ids.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MessageType {
            $($name = $id,)+
        }

        impl MessageType {
            pub fn id(self) -> u16 {
                self as u16
            }

            pub fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(MessageType::$name),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)+
                }
            }
        }

        /// Every message kind the protocol carries. Decoding a frame yields
        /// this type directly, so dispatch on it is exhaustive.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $($name($name),)+
        }

        $(
            impl WireMessage for $name {
                const TYPE: MessageType = MessageType::$name;
            }

            impl From<$name> for Message {
                fn from(msg: $name) -> Self {
                    Message::$name(msg)
                }
            }
        )+

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Message::$name(_) => MessageType::$name,)+
                }
            }

            /// Serialise the inner value (no header).
            pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
                match self {
                    $(Message::$name(msg) => serde_json::to_vec(msg).map_err(ProtocolError::Encode),)+
                }
            }

            /// Parse a payload as the kind named by `msg_type`.
            pub fn from_payload(msg_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
                match msg_type {
                    $(MessageType::$name => crate::decode_payload::<$name>(payload).map(Message::$name),)+
                }
            }
        }
    };
}

registry! {
    NodeAnnounce = 1,
    InviteForJoin = 2,
    JoinChat = 3,
    ChatMessage = 4,
    ConnectInfo = 5,
    WatchedCids = 6,
    HaveCidInfo = 7,
    MessagesRequest = 8,
    ChatMessagePack = 9,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        MessageType::from_id(id).ok_or(ProtocolError::UnknownType(id))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}
