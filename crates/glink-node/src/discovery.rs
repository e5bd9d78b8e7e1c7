//! LAN discovery -- multicast NodeAnnounce beacons.
//!
//! Two loops share nothing but the shutdown signal: the announce loop
//! re-sends our NodeAnnounce at a fixed interval, the receive loop decodes
//! datagrams, drops our own and already-seen announcements, and forwards
//! the rest to the engine.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use glink_protocol::{encode_message, Frame, Message, NodeAnnounce, Uid, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// How repeated announcements are recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DedupPolicy {
    /// One event per datagram source address. A peer that comes back on a
    /// new address is reported again, one that keeps its address is not.
    #[default]
    #[serde(rename = "address")]
    SourceAddress,
    /// One event per PeerId, plus one whenever its advertised endpoint changes.
    #[serde(rename = "peer")]
    PeerId,
}

/// Discovery state for one node.
#[derive(Debug)]
pub struct Discovery {
    own: NodeAnnounce,
    policy: DedupPolicy,
    seen_addrs: HashSet<SocketAddr>,
    seen_peers: HashMap<Uid, String>,
}

impl Discovery {
    pub fn new(own: NodeAnnounce, policy: DedupPolicy) -> Self {
        Self {
            own,
            policy,
            seen_addrs: HashSet::new(),
            seen_peers: HashMap::new(),
        }
    }

    pub fn own(&self) -> &NodeAnnounce {
        &self.own
    }

    /// Our announcement as a datagram.
    pub fn announce_datagram(&self) -> glink_protocol::Result<Vec<u8>> {
        Ok(encode_message(&self.own)?.to_bytes())
    }

    /// Decode one datagram. Returns an announcement only for a peer not seen
    /// before under the current policy.
    pub fn handle_datagram(&mut self, src: SocketAddr, data: &[u8]) -> Option<NodeAnnounce> {
        let announce = match Frame::parse(data) {
            Ok(Message::NodeAnnounce(announce)) => announce,
            Ok(other) => {
                tracing::warn!(%src, kind = %other.message_type(), "discovery: unexpected datagram kind");
                return None;
            }
            Err(e) => {
                tracing::warn!(%src, error = %e, "discovery: dropping malformed datagram");
                return None;
            }
        };

        if announce.uid == self.own.uid {
            return None;
        }

        let is_new = match self.policy {
            DedupPolicy::SourceAddress => self.seen_addrs.insert(src),
            DedupPolicy::PeerId => {
                let previous = self
                    .seen_peers
                    .insert(announce.uid.clone(), announce.endpoint.clone());
                previous.as_ref() != Some(&announce.endpoint)
            }
        };
        if !is_new {
            return None;
        }

        tracing::info!(peer = %announce.uid, name = %announce.name, endpoint = %announce.endpoint, %src, "discovery: peer found");
        Some(announce)
    }
}

/// Bind the multicast group for receiving. The port is shared, so several
/// nodes on one host each get a copy of every announcement.
pub fn bind_multicast(group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Socket used for sending announcements (ephemeral port, TTL 1).
pub fn bind_sender() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Handles of the two discovery loops.
pub struct DiscoveryHandle {
    pub recv: JoinHandle<()>,
    pub announce: JoinHandle<()>,
}

/// Start both loops. Both stop on the shutdown signal; dropping their
/// sockets is the teardown.
pub fn spawn_discovery(
    discovery: Discovery,
    group: SocketAddrV4,
    interval: Duration,
    events: mpsc::Sender<NodeAnnounce>,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<DiscoveryHandle> {
    let recv_socket = bind_multicast(group)?;
    let send_socket = bind_sender()?;
    let datagram = discovery.announce_datagram()?;
    tracing::info!(%group, uid = %discovery.own().uid, "discovery: started");

    let announce = tokio::spawn(run_announce_loop(
        send_socket,
        datagram,
        SocketAddr::V4(group),
        interval,
        shutdown.subscribe(),
    ));
    let recv = tokio::spawn(run_recv_loop(
        recv_socket,
        discovery,
        events,
        shutdown.subscribe(),
    ));
    Ok(DiscoveryHandle { recv, announce })
}

async fn run_announce_loop(
    socket: UdpSocket,
    datagram: Vec<u8>,
    dest: SocketAddr,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&datagram, dest).await {
                    tracing::debug!(%dest, error = %e, "discovery: announce failed");
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("discovery: announce loop stopped");
                return;
            }
        }
    }
}

async fn run_recv_loop(
    socket: UdpSocket,
    mut discovery: Discovery,
    events: mpsc::Sender<NodeAnnounce>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, src)) => {
                        if let Some(announce) = discovery.handle_datagram(src, &buf[..n]) {
                            if events.send(announce).await.is_err() {
                                tracing::debug!("discovery: event channel closed");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery: recv failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("discovery: recv loop stopped");
                return;
            }
        }
    }
}
