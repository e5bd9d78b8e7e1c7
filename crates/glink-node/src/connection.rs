//! Connection manager -- live TCP links keyed by PeerId.
//!
//! Every connection starts with a ConnectInfo frame from the dialer. After
//! that both sides run one decode loop per connection that turns frames
//! into [`NetworkEvent`]s for the engine. Writers are shared behind a mutex
//! so the engine can send while decode loops register and deregister.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use glink_protocol::{ConnectInfo, Message, MessageCodec, ProtocolError, Uid};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("dial {endpoint} failed: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no connection registered for peer {0}")]
    UnknownPeer(Uid),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("write to {0} timed out, link closed")]
    WriteTimeout(Uid),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub listen_host: String,
    /// Deadline for dialling and for the first (ConnectInfo) frame.
    pub handshake_timeout: Duration,
    /// Idle deadline per connection. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing one frame. A link that misses it is closed.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".into(),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(180)),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Events from the connection layer to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// An inbound connection was registered. Outbound links are reported
    /// by the return value of [`ConnectionManager::make_new_connection_to`].
    Connected { uid: Uid, name: String },
    Disconnected {
        uid: Uid,
    },
    Message {
        from: Uid,
        message: Message,
    },
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct PeerConnection {
    id: u64,
    /// PeerId of the side that opened the connection.
    dialer: Uid,
    writer: Arc<Mutex<Writer>>,
    close: Arc<Notify>,
}

struct Inner {
    own: ConnectInfo,
    config: ConnectionConfig,
    listener_addr: SocketAddr,
    peers: Mutex<HashMap<Uid, PeerConnection>>,
    next_id: AtomicU64,
    events: mpsc::Sender<NetworkEvent>,
    shutdown: broadcast::Sender<()>,
}

/// Registration handed to a decode loop.
struct Registered {
    id: u64,
    writer: Arc<Mutex<Writer>>,
    close: Arc<Notify>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Bind the listener on an ephemeral port and spawn the accept loop.
    pub async fn start(
        own: ConnectInfo,
        config: ConnectionConfig,
        events: mpsc::Sender<NetworkEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let listener = TcpListener::bind((config.listen_host.as_str(), 0)).await?;
        let bound = listener.local_addr()?;
        let listener_addr = advertised_address(bound);

        let manager = Self {
            inner: Arc::new(Inner {
                own,
                config,
                listener_addr,
                peers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                shutdown,
            }),
        };
        tracing::info!(%bound, advertised = %listener_addr, "conn: listening");

        let accept = tokio::spawn(manager.clone().run_accept_loop(listener));
        Ok((manager, accept))
    }

    /// Address other peers should dial, as advertised in NodeAnnounce.
    /// Never a wildcard address.
    pub fn listener_address(&self) -> String {
        self.inner.listener_addr.to_string()
    }

    pub fn own_uid(&self) -> &str {
        &self.inner.own.my_uid
    }

    pub async fn connected_peers(&self) -> Vec<Uid> {
        let mut peers: Vec<Uid> = self.inner.peers.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn is_connected(&self, uid: &str) -> bool {
        self.inner.peers.lock().await.contains_key(uid)
    }

    /// Dial `endpoint`, introduce ourselves and register the link under `uid`.
    /// No retry. Returns `false` when a preferred link to `uid` already
    /// exists and the new one was dropped.
    ///
    /// No `Connected` event is emitted for the new link; the caller is
    /// usually the consumer of that event channel.
    pub async fn make_new_connection_to(&self, uid: &str, endpoint: &str) -> Result<bool> {
        let dial = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            TcpStream::connect(endpoint),
        )
        .await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectionError::Dial {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectionError::Dial {
                    endpoint: endpoint.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();

        // ConnectInfo goes out before anything else can be queued on this writer
        let hello = Message::from(self.inner.own.clone()).encode()?.to_bytes();
        write_half.write_all(&hello).await?;

        let own_uid = self.inner.own.my_uid.clone();
        let Some(registered) = self
            .register(uid, &own_uid, Box::new(write_half))
            .await
        else {
            tracing::debug!(peer = %uid, "conn: keeping existing link, outbound dropped");
            return Ok(false);
        };

        tracing::info!(peer = %uid, %endpoint, id = registered.id, "conn: connected (outbound)");
        self.spawn_read_loop(
            uid.to_string(),
            FramedRead::new(read_half, MessageCodec),
            registered,
        );
        Ok(true)
    }

    pub async fn send_to(&self, uid: &str, message: &Message) -> Result<()> {
        let bytes = message.encode()?.to_bytes();
        let (writer, close) = {
            let peers = self.inner.peers.lock().await;
            peers
                .get(uid)
                .map(|p| (p.writer.clone(), p.close.clone()))
                .ok_or_else(|| ConnectionError::UnknownPeer(uid.to_string()))?
        };
        self.write_frame(uid, &writer, &close, &bytes).await?;
        tracing::trace!(peer = %uid, kind = %message.message_type(), "conn: sent");
        Ok(())
    }

    /// Encode once and write to every registered connection. A failed write
    /// is logged and does not stop delivery to the others. Returns the
    /// number of peers that accepted the frame.
    pub async fn send_to_all(&self, message: &Message) -> Result<usize> {
        let bytes = message.encode()?.to_bytes();
        let targets: Vec<(Uid, Arc<Mutex<Writer>>, Arc<Notify>)> = {
            let peers = self.inner.peers.lock().await;
            peers
                .iter()
                .map(|(uid, p)| (uid.clone(), p.writer.clone(), p.close.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = 0;
        for (uid, writer, close) in targets {
            match self.write_frame(&uid, &writer, &close, &bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(peer = %uid, error = %e, "conn: broadcast write failed");
                }
            }
        }
        if failed > 0 {
            tracing::warn!(delivered, failed, kind = %message.message_type(), "conn: broadcast partially delivered");
        }
        Ok(delivered)
    }

    /// Write one frame under the write deadline. On expiry the link is asked
    /// to close; its decode loop then deregisters it and reports it gone.
    async fn write_frame(
        &self,
        uid: &str,
        writer: &Mutex<Writer>,
        close: &Notify,
        bytes: &[u8],
    ) -> Result<()> {
        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.inner.config.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(peer = %uid, "conn: write deadline expired, closing link");
                close.notify_one();
                Err(ConnectionError::WriteTimeout(uid.to_string()))
            }
        }
    }

    /// Close the link to `uid`, if any.
    pub async fn disconnect(&self, uid: &str) {
        if let Some(peer) = self.inner.peers.lock().await.get(uid) {
            peer.close.notify_one();
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a link. When a link to `uid` already exists, the one opened
    /// by the smaller PeerId survives (on both ends); between two links
    /// opened by the same side the newer one wins. Returns `None` if the new
    /// link lost.
    async fn register(&self, uid: &str, dialer: &str, writer: Writer) -> Option<Registered> {
        let mut peers = self.inner.peers.lock().await;
        if let Some(existing) = peers.get(uid) {
            if existing.dialer.as_str() < dialer {
                return None;
            }
            tracing::debug!(peer = %uid, replaced = existing.id, "conn: replacing link");
            existing.close.notify_one();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let writer = Arc::new(Mutex::new(writer));
        let close = Arc::new(Notify::new());
        peers.insert(
            uid.to_string(),
            PeerConnection {
                id,
                dialer: dialer.to_string(),
                writer: writer.clone(),
                close: close.clone(),
            },
        );
        tracing::debug!(peer = %uid, id, pool_size = peers.len(), "conn: registered");
        Some(Registered { id, writer, close })
    }

    /// Remove the registration for `uid` only if it is still link `id`.
    async fn deregister(&self, uid: &str, id: u64) -> bool {
        let mut peers = self.inner.peers.lock().await;
        match peers.get(uid) {
            Some(p) if p.id == id => {
                peers.remove(uid);
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Loops
    // ========================================================================

    async fn run_accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(self.clone().handle_inbound(stream, addr));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "conn: accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("conn: accept loop stopped");
                    return;
                }
            }
        }
    }

    /// Read the ConnectInfo frame, then register and serve the link.
    async fn handle_inbound(self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut framed = FramedRead::new(read_half, MessageCodec);

        let hello = match self.read_connect_info(&mut framed).await {
            Ok(hello) => hello,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "conn: inbound handshake failed");
                return;
            }
        };

        let Some(registered) = self
            .register(&hello.my_uid, &hello.my_uid, Box::new(write_half))
            .await
        else {
            tracing::debug!(peer = %hello.my_uid, %addr, "conn: keeping existing link, inbound dropped");
            return;
        };

        tracing::info!(peer = %hello.my_uid, name = %hello.my_name, %addr, id = registered.id, "conn: connected (inbound)");
        let _ = self
            .inner
            .events
            .send(NetworkEvent::Connected {
                uid: hello.my_uid.clone(),
                name: hello.my_name,
            })
            .await;
        self.spawn_read_loop(hello.my_uid, framed, registered);
    }

    async fn read_connect_info<R>(
        &self,
        framed: &mut FramedRead<R, MessageCodec>,
    ) -> Result<ConnectInfo>
    where
        R: AsyncRead + Unpin,
    {
        let first = tokio::time::timeout(self.inner.config.handshake_timeout, framed.next())
            .await
            .map_err(|_| ConnectionError::Handshake("timed out waiting for ConnectInfo".into()))?;
        match first {
            Some(Ok(Message::ConnectInfo(hello))) => {
                if hello.my_uid == self.inner.own.my_uid {
                    return Err(ConnectionError::Handshake("connection from self".into()));
                }
                Ok(hello)
            }
            Some(Ok(other)) => Err(ConnectionError::Handshake(format!(
                "expected ConnectInfo, got {}",
                other.message_type()
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(ConnectionError::Handshake(
                "closed before ConnectInfo".into(),
            )),
        }
    }

    fn spawn_read_loop<R>(&self, uid: Uid, framed: FramedRead<R, MessageCodec>, registered: Registered)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(self.clone().run_read_loop(uid, framed, registered));
    }

    /// Decode frames until EOF, a decode error, the read deadline, a close
    /// request or shutdown. Short reads and unknown kinds end the link.
    async fn run_read_loop<R>(
        self,
        uid: Uid,
        mut framed: FramedRead<R, MessageCodec>,
        registered: Registered,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let read_timeout = self.inner.config.read_timeout;

        loop {
            let next = tokio::select! {
                next = next_frame(&mut framed, read_timeout) => next,
                _ = registered.close.notified() => {
                    tracing::debug!(peer = %uid, id = registered.id, "conn: closing");
                    break;
                }
                _ = shutdown.recv() => break,
            };

            match next {
                Some(Some(Ok(message))) => {
                    tracing::debug!(peer = %uid, kind = %message.message_type(), "conn: received");
                    let event = NetworkEvent::Message {
                        from: uid.clone(),
                        message,
                    };
                    if self.inner.events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Some(Err(e))) => {
                    tracing::warn!(peer = %uid, error = %e, "conn: decode failed, dropping link");
                    break;
                }
                Some(None) => {
                    tracing::info!(peer = %uid, "conn: closed by peer");
                    break;
                }
                None => {
                    tracing::warn!(peer = %uid, "conn: read deadline expired");
                    break;
                }
            }
        }

        let _ = registered.writer.lock().await.shutdown().await;
        if self.deregister(&uid, registered.id).await {
            tracing::info!(peer = %uid, id = registered.id, "conn: disconnected");
            let _ = self
                .inner
                .events
                .send(NetworkEvent::Disconnected { uid })
                .await;
        }
    }
}

/// Address to advertise for a listener bound at `bound`. A wildcard bind is
/// replaced by the interface address that routes towards the discovery group,
/// or loopback when there is none.
pub fn advertised_address(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = lan_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, bound.port())
}

/// Source address the kernel picks for the discovery group. Connecting a
/// UDP socket sends nothing.
fn lan_address() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(glink_protocol::DEFAULT_DISCOVERY_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Next frame, or `None` if the deadline passed first.
async fn next_frame<R>(
    framed: &mut FramedRead<R, MessageCodec>,
    deadline: Option<Duration>,
) -> Option<Option<std::result::Result<Message, ProtocolError>>>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, framed.next()).await.ok(),
        None => Some(framed.next().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glink_protocol::{ChatMessage, FrameHeader, MessageType};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    /// Writer that never makes progress.
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Writer whose every write fails.
    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn hello(uid: &str) -> ConnectInfo {
        ConnectInfo {
            my_uid: uid.into(),
            my_name: format!("name-{uid}"),
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn manager(uid: &str) -> (ConnectionManager, mpsc::Receiver<NetworkEvent>, broadcast::Sender<()>) {
        let (tx, rx) = mpsc::channel(64);
        let (shutdown, _) = broadcast::channel(1);
        let (mgr, _accept) = ConnectionManager::start(hello(uid), fast_config(), tx, shutdown.clone())
            .await
            .unwrap();
        (mgr, rx, shutdown)
    }

    async fn next_event(rx: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn chat_message() -> Message {
        ChatMessage {
            uid: "a".into(),
            cid: "c".into(),
            index: 1,
            text: "hello".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_send_to_all_survives_failed_write() {
        let (mgr, _rx, _shutdown) = manager("me").await;
        let (good_local, mut good_remote) = tokio::io::duplex(4096);

        mgr.register("broken", "me", Box::new(BrokenWriter)).await.unwrap();
        mgr.register("good", "me", Box::new(good_local)).await.unwrap();

        let msg = chat_message();
        let delivered = mgr.send_to_all(&msg).await.unwrap();
        assert_eq!(delivered, 1);

        let expected = msg.encode().unwrap().to_bytes();
        let mut buf = vec![0u8; expected.len()];
        good_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_deadline() {
        let (mgr, _rx, _shutdown) = manager("me").await;
        let (good_local, mut good_remote) = tokio::io::duplex(4096);
        let stalled = mgr.register("stalled", "me", Box::new(StalledWriter)).await.unwrap();
        mgr.register("good", "me", Box::new(good_local)).await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(3),
            mgr.send_to("stalled", &chat_message()),
        )
        .await
        .expect("send_to must not hang")
        .unwrap_err();
        assert!(matches!(err, ConnectionError::WriteTimeout(uid) if uid == "stalled"));
        // The link was told to close
        tokio::time::timeout(Duration::from_secs(1), stalled.close.notified())
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(3), mgr.send_to_all(&chat_message()))
            .await
            .expect("send_to_all must not hang")
            .unwrap();
        assert_eq!(delivered, 1);
        let expected = chat_message().encode().unwrap().to_bytes();
        let mut buf = vec![0u8; expected.len()];
        good_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_dial_does_not_wait_on_full_event_channel() {
        // Nobody drains the dialer's inbox
        let (tx, _rx) = mpsc::channel(1);
        tx.send(NetworkEvent::Disconnected { uid: "filler".into() })
            .await
            .unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let (a, _accept) = ConnectionManager::start(hello("a"), fast_config(), tx, shutdown.clone())
            .await
            .unwrap();
        let (b, _b_rx, _sb) = manager("b").await;

        let dialled = tokio::time::timeout(
            Duration::from_secs(3),
            a.make_new_connection_to("b", &b.listener_address()),
        )
        .await
        .expect("dial blocked on the event channel");
        assert!(dialled.unwrap());
        assert!(a.is_connected("b").await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (mgr, _rx, _shutdown) = manager("me").await;
        let err = mgr.send_to("ghost", &chat_message()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownPeer(uid) if uid == "ghost"));
    }

    #[tokio::test]
    async fn test_wildcard_listener_is_dialable() {
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        let config = ConnectionConfig {
            listen_host: "0.0.0.0".into(),
            ..fast_config()
        };
        let (wild, _accept) = ConnectionManager::start(hello("wild"), config, tx, shutdown.clone())
            .await
            .unwrap();
        let advertised: SocketAddr = wild.listener_address().parse().unwrap();
        assert!(!advertised.ip().is_unspecified());
        assert_ne!(advertised.port(), 0);

        let (dialer, _drx, _ds) = manager("dialer").await;
        assert!(dialer
            .make_new_connection_to("wild", &wild.listener_address())
            .await
            .unwrap());
        assert!(matches!(
            next_event(&mut rx).await,
            NetworkEvent::Connected { uid, .. } if uid == "dialer"
        ));

        let bound: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(advertised_address(bound), bound);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let (mgr, _rx, _shutdown) = manager("me").await;
        // Bind then drop to get a port with nothing listening
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = mgr
            .make_new_connection_to("x", &format!("127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Dial { .. }));
        assert!(!mgr.is_connected("x").await);
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (a, mut a_rx, _sa) = manager("a").await;
        let (b, mut b_rx, _sb) = manager("b").await;

        assert!(a.make_new_connection_to("b", &b.listener_address()).await.unwrap());
        assert!(a.is_connected("b").await);
        assert_eq!(
            next_event(&mut b_rx).await,
            NetworkEvent::Connected {
                uid: "a".into(),
                name: "name-a".into(),
            }
        );

        b.send_to("a", &chat_message()).await.unwrap();
        assert_eq!(
            next_event(&mut a_rx).await,
            NetworkEvent::Message {
                from: "b".into(),
                message: chat_message()
            }
        );

        a.disconnect("b").await;
        assert_eq!(
            next_event(&mut a_rx).await,
            NetworkEvent::Disconnected { uid: "b".into() }
        );
        assert_eq!(
            next_event(&mut b_rx).await,
            NetworkEvent::Disconnected { uid: "a".into() }
        );
    }

    #[tokio::test]
    async fn test_bad_first_frame_rejected() {
        let (mgr, mut rx, _shutdown) = manager("me").await;

        // Wrong kind as first frame: closed without an event
        let mut stream = TcpStream::connect(mgr.listener_address()).await.unwrap();
        stream
            .write_all(&chat_message().encode().unwrap().to_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // Accept loop still serves well-behaved clients
        let mut good = TcpStream::connect(mgr.listener_address()).await.unwrap();
        good.write_all(&Message::from(hello("peer")).encode().unwrap().to_bytes())
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            NetworkEvent::Connected { uid, .. } if uid == "peer"
        ));
    }

    #[tokio::test]
    async fn test_short_payload_drops_link() {
        let (mgr, mut rx, _shutdown) = manager("me").await;
        let mut stream = TcpStream::connect(mgr.listener_address()).await.unwrap();
        stream
            .write_all(&Message::from(hello("peer")).encode().unwrap().to_bytes())
            .await
            .unwrap();
        assert!(matches!(next_event(&mut rx).await, NetworkEvent::Connected { .. }));

        // Header announces a 5-byte ChatMessage payload, only 3 bytes follow
        let header = FrameHeader {
            payload_size: 5,
            msg_type: MessageType::ChatMessage.id(),
        };
        assert_eq!(header.encode(), [0x05, 0, 0, 0, 0x04, 0]);
        stream.write_all(&header.encode()).await.unwrap();
        stream.write_all(b"{\"U").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            NetworkEvent::Disconnected { uid: "peer".into() }
        );
        assert!(!mgr.is_connected("peer").await);
    }

    #[tokio::test]
    async fn test_duplicate_link_tie_break() {
        let (mgr, _rx, _shutdown) = manager("m").await;

        // Link to "z" dialled by "m" (smaller) beats one dialled by "z"
        assert!(mgr.register("z", "m", Box::new(BrokenWriter)).await.is_some());
        assert!(mgr.register("z", "z", Box::new(BrokenWriter)).await.is_none());

        // Link to "a" dialled by "a" beats our own dial
        let first = mgr.register("a", "m", Box::new(BrokenWriter)).await.unwrap();
        let second = mgr.register("a", "a", Box::new(BrokenWriter)).await.unwrap();
        assert_ne!(first.id, second.id);

        // The replaced link cannot deregister the live one
        assert!(!mgr.deregister("a", first.id).await);
        assert!(mgr.is_connected("a").await);
        assert!(mgr.deregister("a", second.id).await);
        assert_eq!(mgr.connected_peers().await, vec!["z".to_string()]);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        let config = ConnectionConfig {
            read_timeout: Some(Duration::from_millis(200)),
            ..fast_config()
        };
        let (mgr, _accept) = ConnectionManager::start(hello("me"), config, tx, shutdown.clone())
            .await
            .unwrap();

        let mut stream = TcpStream::connect(mgr.listener_address()).await.unwrap();
        stream
            .write_all(&Message::from(hello("quiet")).encode().unwrap().to_bytes())
            .await
            .unwrap();
        assert!(matches!(next_event(&mut rx).await, NetworkEvent::Connected { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            NetworkEvent::Disconnected { uid: "quiet".into() }
        );
    }
}
