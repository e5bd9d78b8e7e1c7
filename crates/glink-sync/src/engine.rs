//! Sync engine -- invite handshake, sequence numbering, anti-entropy.
//!
//! Every handler returns the actions to execute, in order. A storage error
//! abandons the current step: it is logged and no action is produced.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glink_protocol::{
    ChatInfo, ChatMessage, ChatMessagePack, Cid, HaveCidInfo, InviteForJoin, JoinChat, Message,
    MessagesRequest, NodeAnnounce, Uid, WatchedCids, COMMAND_SENTINEL,
};
use glink_storage::{Storage, UserLightInfo, UserRow};

use crate::{
    generate_id, generate_messages_request, Command, HandshakeState, SequenceCounters,
    SyncConfig, UiEvent,
};

/// Work the runtime carries out on behalf of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Dial `endpoint` and register the connection under `uid`.
    Connect { uid: Uid, endpoint: String },
    SendTo { uid: Uid, message: Message },
    /// Send to every live connection.
    Broadcast(Message),
    Notify(UiEvent),
}

#[derive(Debug)]
struct Handshake {
    peer: Uid,
    state: HandshakeState,
    since: Instant,
}

pub struct SyncEngine {
    own: UserLightInfo,
    storage: Arc<dyn Storage>,
    config: SyncConfig,
    counters: SequenceCounters,
    /// Discovered, not yet connected peers keyed by display name.
    candidates: BTreeMap<String, NodeAnnounce>,
    handshakes: HashMap<Cid, Handshake>,
    connected: BTreeSet<Uid>,
}

impl SyncEngine {
    pub fn new(own: UserLightInfo, storage: Arc<dyn Storage>, config: SyncConfig) -> Self {
        Self {
            own,
            storage,
            config,
            counters: SequenceCounters::default(),
            candidates: BTreeMap::new(),
            handshakes: HashMap::new(),
            connected: BTreeSet::new(),
        }
    }

    pub fn own(&self) -> &UserLightInfo {
        &self.own
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_connected(&self, uid: &str) -> bool {
        self.connected.contains(uid)
    }

    /// State of the invite handshake for `cid`, if one was started or answered here.
    pub fn handshake(&self, cid: &str) -> Option<HandshakeState> {
        self.handshakes.get(cid).map(|h| h.state)
    }

    /// Where the handshake with a peer that has no chat yet stands.
    pub fn peer_state(&self, uid: &str) -> Option<HandshakeState> {
        if self.connected.contains(uid) {
            Some(HandshakeState::Connected)
        } else if self.candidates.values().any(|c| c.uid == uid) {
            Some(HandshakeState::Candidate)
        } else {
            None
        }
    }

    pub fn candidates(&self) -> Vec<NodeAnnounce> {
        self.candidates.values().cloned().collect()
    }

    // ========================================================================
    // User input
    // ========================================================================

    /// Send `text` to chat `cid`, or run it as a command when it starts with `!`.
    pub fn send_user_message(&mut self, cid: &str, text: &str) -> Vec<Action> {
        if let Some(command) = text.strip_prefix(COMMAND_SENTINEL) {
            return self.run_command(command);
        }

        let index = match self
            .counters
            .peek_next(self.storage.as_ref(), &self.own.uid, cid)
        {
            Ok(index) => index,
            Err(e) => {
                tracing::error!(%cid, error = %e, "sync: cannot assign an index");
                return Vec::new();
            }
        };

        let msg = ChatMessage {
            uid: self.own.uid.clone(),
            cid: cid.to_string(),
            index,
            text: text.to_string(),
        };

        // Stored before it goes on the wire
        if let Err(e) = self.storage.save_message(&msg) {
            tracing::error!(%cid, index, error = %e, "sync: failed to persist outgoing message");
            return Vec::new();
        }
        self.counters.commit(cid, index);

        tracing::debug!(%cid, index, "sync: message sent");
        vec![
            Action::Broadcast(msg.clone().into()),
            Action::Notify(UiEvent::NewMessage(msg)),
        ]
    }

    pub fn get_messages(&self, cid: &str) -> glink_storage::Result<Vec<ChatMessage>> {
        self.storage.chat_messages(cid)
    }

    pub fn chats(&self) -> glink_storage::Result<Vec<ChatInfo>> {
        self.storage.list_chats()
    }

    pub fn users(&self) -> glink_storage::Result<Vec<UserRow>> {
        self.storage.list_users()
    }

    /// Display name for `uid`, falling back to the uid itself.
    pub fn name_of(&self, uid: &str) -> String {
        if uid == self.own.uid {
            return self.own.name.clone();
        }
        match self.storage.name_by_uid(uid) {
            Ok(Some(name)) => name,
            Ok(None) => uid.to_string(),
            Err(e) => {
                tracing::warn!(peer = %uid, error = %e, "sync: name lookup failed");
                uid.to_string()
            }
        }
    }

    fn run_command(&mut self, input: &str) -> Vec<Action> {
        match Command::parse(input) {
            Ok(Command::Connect(name)) => self.invite_candidate(&name),
            Ok(Command::Candidates) => vec![Action::Notify(UiEvent::Candidates(self.candidates()))],
            Err(reason) => {
                tracing::warn!(command = %input, %reason, "sync: command rejected");
                vec![reject(input, reason)]
            }
        }
    }

    /// Initiator side of the invite handshake.
    fn invite_candidate(&mut self, name: &str) -> Vec<Action> {
        let Some(candidate) = self.candidates.get(name).cloned() else {
            return vec![reject(
                &format!("conn {name}"),
                format!("no candidate named '{name}'"),
            )];
        };

        let chat = ChatInfo {
            cid: generate_id(),
            name: candidate.name.clone(),
            participants: vec![self.own.uid.clone()],
            group: false,
        };
        if let Err(e) = self.storage.save_new_chat(&chat) {
            tracing::error!(cid = %chat.cid, error = %e, "sync: failed to create chat");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.connected.contains(&candidate.uid) {
            actions.push(Action::Connect {
                uid: candidate.uid.clone(),
                endpoint: candidate.endpoint.clone(),
            });
        }
        actions.push(Action::SendTo {
            uid: candidate.uid.clone(),
            message: InviteForJoin {
                from: self.own.uid.clone(),
                to: candidate.uid.clone(),
                chat: chat.clone(),
            }
            .into(),
        });
        actions.push(Action::Notify(UiEvent::ChatUpdate {
            info: chat.clone(),
            new_uids: vec![self.own.uid.clone()],
        }));

        self.candidates.remove(name);
        self.handshakes.insert(
            chat.cid.clone(),
            Handshake {
                peer: candidate.uid.clone(),
                state: HandshakeState::Invited,
                since: Instant::now(),
            },
        );
        tracing::info!(cid = %chat.cid, peer = %candidate.uid, "sync: invite sent");
        actions
    }

    // ========================================================================
    // Discovery / connection lifecycle
    // ========================================================================

    /// A peer announced itself. Known peers are dialled, new ones become candidates.
    pub fn on_discovery(&mut self, announce: &NodeAnnounce) -> Vec<Action> {
        if announce.uid == self.own.uid {
            return Vec::new();
        }

        let known = match self.storage.is_known_uid(&announce.uid) {
            Ok(known) => known,
            Err(e) => {
                tracing::error!(peer = %announce.uid, error = %e, "sync: user lookup failed");
                return Vec::new();
            }
        };
        if let Err(e) =
            self.storage
                .save_new_uid(&announce.uid, &announce.name, Some(&announce.endpoint))
        {
            tracing::error!(peer = %announce.uid, error = %e, "sync: failed to save peer");
            return Vec::new();
        }

        if known {
            if self.connected.contains(&announce.uid) {
                return Vec::new();
            }
            tracing::info!(peer = %announce.uid, endpoint = %announce.endpoint, "sync: reconnecting known peer");
            return vec![Action::Connect {
                uid: announce.uid.clone(),
                endpoint: announce.endpoint.clone(),
            }];
        }

        tracing::info!(peer = %announce.uid, name = %announce.name, "sync: new candidate");
        self.candidates
            .insert(announce.name.clone(), announce.clone());
        vec![Action::Notify(UiEvent::Candidates(self.candidates()))]
    }

    /// A connection became usable. Starts a reconciliation round towards the peer.
    /// `name` comes from the peer's ConnectInfo on inbound links.
    pub fn on_connected(&mut self, uid: &str, name: Option<&str>) -> Vec<Action> {
        self.connected.insert(uid.to_string());
        self.candidates.retain(|_, c| c.uid != uid);
        if let Some(name) = name {
            if let Err(e) = self.storage.save_new_uid(uid, name, None) {
                tracing::warn!(peer = %uid, error = %e, "sync: failed to record connected peer");
            }
        }
        self.watch_request(uid).into_iter().collect()
    }

    pub fn on_disconnected(&mut self, uid: &str) {
        self.connected.remove(uid);
    }

    /// Periodic anti-entropy round over every live connection.
    pub fn anti_entropy_round(&self) -> Vec<Action> {
        self.connected
            .iter()
            .filter_map(|uid| self.watch_request(uid))
            .collect()
    }

    /// Expire invites that were not answered in time.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let timeout = Duration::from_secs(self.config.invite_timeout_secs);
        let expired: Vec<Cid> = self
            .handshakes
            .iter()
            .filter(|(_, h)| {
                h.state == HandshakeState::Invited && now.saturating_duration_since(h.since) >= timeout
            })
            .map(|(cid, _)| cid.clone())
            .collect();

        let mut actions = Vec::new();
        for cid in expired {
            if let Some(h) = self.handshakes.remove(&cid) {
                tracing::warn!(%cid, peer = %h.peer, "sync: invite expired");
                actions.push(Action::Notify(UiEvent::InviteExpired { cid, peer: h.peer }));
            }
        }
        actions
    }

    fn watch_request(&self, uid: &str) -> Option<Action> {
        let cids: Vec<Cid> = match self.storage.list_chats() {
            Ok(chats) => chats.into_iter().map(|c| c.cid).collect(),
            Err(e) => {
                tracing::error!(peer = %uid, error = %e, "sync: failed to list chats");
                return None;
            }
        };
        if cids.is_empty() {
            return None;
        }
        Some(Action::SendTo {
            uid: uid.to_string(),
            message: WatchedCids {
                from: self.own.uid.clone(),
                to: uid.to_string(),
                cids,
            }
            .into(),
        })
    }

    // ========================================================================
    // Network messages
    // ========================================================================

    /// Dispatch a message received on the connection registered for `from`.
    pub fn on_message(&mut self, from: &str, message: Message) -> Vec<Action> {
        let result = match message {
            Message::ChatMessage(msg) => self.on_chat_message(msg),
            Message::InviteForJoin(invite) => self.on_invite(from, invite),
            Message::JoinChat(join) => self.on_join(from, join),
            Message::WatchedCids(watched) => self.on_watched_cids(from, watched),
            Message::HaveCidInfo(have) => self.on_have_cid_info(from, have),
            Message::MessagesRequest(request) => self.on_messages_request(from, request),
            Message::ChatMessagePack(pack) => self.on_message_pack(pack),
            other @ (Message::NodeAnnounce(_) | Message::ConnectInfo(_)) => {
                tracing::warn!(peer = %from, kind = %other.message_type(), "sync: unexpected message on established connection");
                Ok(Vec::new())
            }
        };
        result.unwrap_or_else(|e| {
            tracing::error!(peer = %from, error = %e, "sync: step abandoned");
            Vec::new()
        })
    }

    /// Store a message if it is new. Returns whether it was stored.
    fn apply_message(&mut self, msg: &ChatMessage) -> glink_storage::Result<bool> {
        if self.storage.chat_info(&msg.cid)?.is_none() {
            tracing::debug!(cid = %msg.cid, author = %msg.uid, "sync: message for unknown chat dropped");
            return Ok(false);
        }
        let stored = self.storage.save_message(msg)?;
        if stored && msg.uid == self.own.uid {
            self.counters.observe(&msg.cid, msg.index);
        }
        Ok(stored)
    }

    fn on_chat_message(&mut self, msg: ChatMessage) -> glink_storage::Result<Vec<Action>> {
        if self.apply_message(&msg)? {
            Ok(vec![Action::Notify(UiEvent::NewMessage(msg))])
        } else {
            Ok(Vec::new())
        }
    }

    /// Responder side of the invite handshake.
    fn on_invite(&mut self, from: &str, invite: InviteForJoin) -> glink_storage::Result<Vec<Action>> {
        if invite.to != self.own.uid {
            tracing::warn!(peer = %from, to = %invite.to, "sync: invite addressed to another node");
            return Ok(Vec::new());
        }

        let mut chat = invite.chat;
        if !chat.group {
            chat.name = self.name_of(&invite.from);
        }
        self.storage.save_new_chat(&chat)?;
        self.storage.add_participant(&chat.cid, &self.own.uid)?;
        let info = self.storage.chat_info(&chat.cid)?.unwrap_or(chat);

        self.handshakes.insert(
            info.cid.clone(),
            Handshake {
                peer: invite.from.clone(),
                state: HandshakeState::Joined,
                since: Instant::now(),
            },
        );
        tracing::info!(cid = %info.cid, peer = %invite.from, "sync: joined chat");

        Ok(vec![
            Action::SendTo {
                uid: from.to_string(),
                message: JoinChat {
                    from: self.own.uid.clone(),
                    to: invite.from,
                    cid: info.cid.clone(),
                }
                .into(),
            },
            Action::Notify(UiEvent::ChatUpdate {
                info,
                new_uids: vec![self.own.uid.clone()],
            }),
        ])
    }

    fn on_join(&mut self, from: &str, join: JoinChat) -> glink_storage::Result<Vec<Action>> {
        let added = self.storage.add_participant(&join.cid, &join.from)?;
        let Some(info) = self.storage.chat_info(&join.cid)? else {
            return Ok(Vec::new());
        };

        if let Some(h) = self.handshakes.get_mut(&join.cid) {
            h.state = HandshakeState::Joined;
        }
        tracing::info!(cid = %join.cid, peer = %from, added, "sync: peer joined chat");

        let new_uids = if added { vec![join.from] } else { Vec::new() };
        Ok(vec![Action::Notify(UiEvent::ChatUpdate { info, new_uids })])
    }

    fn on_watched_cids(&self, from: &str, watched: WatchedCids) -> glink_storage::Result<Vec<Action>> {
        let clock = self.storage.vector_clock(&watched.cids)?;
        tracing::debug!(peer = %from, chats = watched.cids.len(), "sync: answering watched cids");
        Ok(vec![Action::SendTo {
            uid: from.to_string(),
            message: HaveCidInfo {
                from: self.own.uid.clone(),
                to: from.to_string(),
                chats_vector_clock: clock,
            }
            .into(),
        }])
    }

    fn on_have_cid_info(&self, from: &str, have: HaveCidInfo) -> glink_storage::Result<Vec<Action>> {
        let cids: Vec<Cid> = have.chats_vector_clock.keys().cloned().collect();
        // Resume after the gap-free prefix so holes below our max get filled
        let local = self.storage.contiguous_clock(&cids)?;
        let deficit = generate_messages_request(&local, &have.chats_vector_clock);
        if deficit.is_empty() {
            tracing::debug!(peer = %from, "sync: in sync");
            return Ok(Vec::new());
        }

        tracing::debug!(peer = %from, chats = deficit.len(), "sync: requesting deficit");
        Ok(vec![Action::SendTo {
            uid: from.to_string(),
            message: MessagesRequest {
                from: self.own.uid.clone(),
                to: from.to_string(),
                vector_clock_from: deficit,
            }
            .into(),
        }])
    }

    fn on_messages_request(
        &self,
        from: &str,
        request: MessagesRequest,
    ) -> glink_storage::Result<Vec<Action>> {
        let messages = self.storage.messages_after(&request.vector_clock_from)?;
        tracing::debug!(peer = %from, count = messages.len(), "sync: sending message pack");
        Ok(vec![Action::SendTo {
            uid: from.to_string(),
            message: ChatMessagePack {
                from: self.own.uid.clone(),
                to: from.to_string(),
                messages,
            }
            .into(),
        }])
    }

    fn on_message_pack(&mut self, pack: ChatMessagePack) -> glink_storage::Result<Vec<Action>> {
        let mut stored = Vec::new();
        for msg in pack.messages {
            if self.apply_message(&msg)? {
                stored.push(msg);
            }
        }
        if stored.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(peer = %pack.from, count = stored.len(), "sync: caught up");
        Ok(vec![Action::Notify(UiEvent::MessageBatch(stored))])
    }
}

fn reject(command: &str, reason: String) -> Action {
    Action::Notify(UiEvent::CommandRejected {
        command: command.trim().to_string(),
        reason,
    })
}
