//! Mesh medium port and its LAN implementation
//!
//! `MeshLink` is the capability the mesh transport consumes: start/stop a
//! medium, send opaque frames best-effort or reliably, and report peer
//! session transitions plus inbound frames as `LinkEvent`s.
//!
//! `UdpMeshLink` implements it on a local network:
//! - unreliable frames are UDP broadcast datagrams
//!   (`"GT" | sender nonce u64 BE | frame`)
//! - reliable frames go over one ordered TCP stream per peer
//!   (`len u32 BE | frame`)
//! - a peer is discovered by its first datagram and dropped after
//!   `PEER_SILENCE_TIMEOUT` of silence

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::util::rate_limit::InboundFrameLimiter;
use crate::util::time::PEER_SILENCE_TIMEOUT;

/// Datagram magic prefix
const MAGIC: &[u8; 2] = b"GT";

/// Datagram header: magic + nonce
const HEADER_LEN: usize = 2 + 8;

/// Largest frame accepted on either path
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Per-peer reliable send queue depth
const WRITER_QUEUE: usize = 64;

/// Pause after a failed datagram receive
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Consecutive receive failures before the datagram loop gives up
const MAX_RECV_ERRORS: u32 = 50;

/// Delivery mode for an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Best effort, latest wins
    Unreliable,
    /// Ordered, no loss while the session lives
    Reliable,
}

/// Peer session state on the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events a medium reports to the mesh transport
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Session { peer: String, state: SessionState },
    Frame { peer: String, frame: Bytes },
}

/// Ad-hoc peer medium
pub trait MeshLink: Send + Sync {
    /// Begin advertising/discovering. Failures are reported, not retried.
    fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError>;

    /// Fire-and-forget send; failures are swallowed
    fn send(&self, frame: Bytes, delivery: Delivery);

    /// Disconnect all peers and stop the medium
    fn stop(&self);
}

/// Medium errors
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to bind mesh socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Mesh link already running")]
    AlreadyRunning,
}

/// LAN medium settings
#[derive(Debug, Clone)]
pub struct UdpMeshLinkConfig {
    pub port: u16,
    pub broadcast: Ipv4Addr,
}

struct PeerSession {
    last_heard: Instant,
    writer: Option<mpsc::Sender<Bytes>>,
}

/// Tasks owned by a running link. Finished handles are pruned on every
/// spawn so stream churn does not accumulate them.
#[derive(Clone, Default)]
struct LinkTasks(Arc<Mutex<Vec<JoinHandle<()>>>>);

impl LinkTasks {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.0.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    fn abort_all(&self) {
        for task in self.0.lock().drain(..) {
            task.abort();
        }
    }
}

/// Consecutive receive failures on the datagram socket
#[derive(Debug, Default)]
struct RecvErrors {
    streak: u32,
}

impl RecvErrors {
    /// Record a failure; `None` once the socket should be given up on
    fn failed(&mut self) -> Option<Duration> {
        self.streak += 1;
        (self.streak < MAX_RECV_ERRORS).then_some(RECV_ERROR_PAUSE)
    }

    fn succeeded(&mut self) {
        self.streak = 0;
    }
}

struct Running {
    udp: Arc<UdpSocket>,
    peers: Arc<DashMap<IpAddr, PeerSession>>,
    tasks: LinkTasks,
}

/// UDP broadcast + TCP medium for a shared local network
pub struct UdpMeshLink {
    config: UdpMeshLinkConfig,
    nonce: u64,
    limiter: InboundFrameLimiter,
    running: Mutex<Option<Running>>,
}

impl UdpMeshLink {
    pub fn new(config: UdpMeshLinkConfig) -> Self {
        Self {
            config,
            nonce: rand::random(),
            limiter: InboundFrameLimiter::new(),
            running: Mutex::new(None),
        }
    }

    fn bind(&self) -> Result<(UdpSocket, TcpListener), LinkError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));

        let udp = std::net::UdpSocket::bind(addr).map_err(LinkError::Bind)?;
        udp.set_broadcast(true).map_err(LinkError::Bind)?;
        udp.set_nonblocking(true).map_err(LinkError::Bind)?;
        let udp = UdpSocket::from_std(udp).map_err(LinkError::Bind)?;

        let tcp = std::net::TcpListener::bind(addr).map_err(LinkError::Bind)?;
        tcp.set_nonblocking(true).map_err(LinkError::Bind)?;
        let tcp = TcpListener::from_std(tcp).map_err(LinkError::Bind)?;

        Ok((udp, tcp))
    }

    fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::from((self.config.broadcast, self.config.port))
    }
}

impl MeshLink for UdpMeshLink {
    fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(LinkError::AlreadyRunning);
        }

        let (udp, tcp) = self.bind()?;
        let udp = Arc::new(udp);
        let peers: Arc<DashMap<IpAddr, PeerSession>> = Arc::new(DashMap::new());
        let tasks = LinkTasks::default();

        tasks.spawn(datagram_loop(
            udp.clone(),
            self.nonce,
            peers.clone(),
            self.limiter.clone(),
            events.clone(),
        ));
        tasks.spawn(accept_loop(
            tcp,
            self.limiter.clone(),
            tasks.clone(),
            events.clone(),
        ));
        tasks.spawn(sweep_loop(peers.clone(), self.limiter.clone(), events));

        info!(port = self.config.port, "Mesh link started");
        *running = Some(Running { udp, peers, tasks });
        Ok(())
    }

    fn send(&self, frame: Bytes, delivery: Delivery) {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return;
        };

        match delivery {
            Delivery::Unreliable => {
                let mut datagram = BytesMut::with_capacity(HEADER_LEN + frame.len());
                datagram.put_slice(MAGIC);
                datagram.put_u64(self.nonce);
                datagram.put_slice(&frame);
                if let Err(e) = running.udp.try_send_to(&datagram, self.broadcast_addr()) {
                    debug!(error = %e, "Mesh datagram send failed");
                }
            }
            Delivery::Reliable => {
                for mut peer in running.peers.iter_mut() {
                    let ip = *peer.key();
                    let writer = match &peer.writer {
                        Some(tx) if !tx.is_closed() => tx.clone(),
                        _ => {
                            let (tx, rx) = mpsc::channel(WRITER_QUEUE);
                            let addr = SocketAddr::new(ip, self.config.port);
                            running.tasks.spawn(stream_writer(addr, rx));
                            peer.writer = Some(tx.clone());
                            tx
                        }
                    };
                    if writer.try_send(frame.clone()).is_err() {
                        debug!(peer = %ip, "Reliable queue full, frame dropped");
                    }
                }
            }
        }
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.tasks.abort_all();
        running.peers.clear();
        info!(port = self.config.port, "Mesh link stopped");
    }
}

/// Receive broadcast datagrams, track peers, forward frames
async fn datagram_loop(
    udp: Arc<UdpSocket>,
    own_nonce: u64,
    peers: Arc<DashMap<IpAddr, PeerSession>>,
    limiter: InboundFrameLimiter,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let mut errors = RecvErrors::default();
    loop {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => {
                errors.succeeded();
                received
            }
            Err(e) => match errors.failed() {
                Some(pause) => {
                    debug!(error = %e, "Mesh datagram receive failed");
                    tokio::time::sleep(pause).await;
                    continue;
                }
                None => {
                    warn!(error = %e, "Mesh datagram socket keeps failing, receive loop stopped");
                    return;
                }
            },
        };

        let datagram = &buf[..len];
        if len <= HEADER_LEN || &datagram[..2] != MAGIC {
            continue;
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&datagram[2..HEADER_LEN]);
        if u64::from_be_bytes(nonce) == own_nonce {
            continue;
        }
        if !limiter.check(from.ip()) {
            continue;
        }

        let peer = from.ip().to_string();
        let is_new = match peers.entry(from.ip()) {
            Entry::Occupied(mut session) => {
                session.get_mut().last_heard = Instant::now();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(PeerSession {
                    last_heard: Instant::now(),
                    writer: None,
                });
                true
            }
        };
        if is_new {
            info!(peer = %peer, "Mesh peer discovered");
            let session = LinkEvent::Session {
                peer: peer.clone(),
                state: SessionState::Connected,
            };
            if events.send(session).await.is_err() {
                return;
            }
        }

        let frame = Bytes::copy_from_slice(&datagram[HEADER_LEN..]);
        if events.send(LinkEvent::Frame { peer, frame }).await.is_err() {
            return;
        }
    }
}

/// Accept reliable streams from peers
async fn accept_loop(
    listener: TcpListener,
    limiter: InboundFrameLimiter,
    tasks: LinkTasks,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                debug!(peer = %from, "Reliable mesh stream accepted");
                tasks.spawn(stream_reader(stream, from, limiter.clone(), events.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Mesh stream accept failed");
                tokio::time::sleep(RECV_ERROR_PAUSE).await;
            }
        }
    }
}

/// Read length-prefixed frames from one peer stream
async fn stream_reader(
    mut stream: TcpStream,
    from: SocketAddr,
    limiter: InboundFrameLimiter,
    events: mpsc::Sender<LinkEvent>,
) {
    let peer = from.ip().to_string();
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        if len == 0 || len > MAX_FRAME_LEN {
            warn!(peer = %peer, len, "Bad mesh frame length, closing stream");
            break;
        }
        let mut frame = vec![0u8; len];
        if stream.read_exact(&mut frame).await.is_err() {
            break;
        }
        if !limiter.check(from.ip()) {
            continue;
        }
        let event = LinkEvent::Frame {
            peer: peer.clone(),
            frame: Bytes::from(frame),
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
    debug!(peer = %peer, "Reliable mesh stream closed");
}

/// Dial a peer and write queued frames in order
async fn stream_writer(addr: SocketAddr, mut frames: mpsc::Receiver<Bytes>) {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %addr, error = %e, "Reliable mesh dial failed");
            return;
        }
    };

    while let Some(frame) = frames.recv().await {
        let written = async {
            stream.write_u32(frame.len() as u32).await?;
            stream.write_all(&frame).await
        }
        .await;
        if let Err(e) = written {
            debug!(peer = %addr, error = %e, "Reliable mesh write failed");
            return;
        }
    }
}

/// Report peers that went silent
async fn sweep_loop(
    peers: Arc<DashMap<IpAddr, PeerSession>>,
    limiter: InboundFrameLimiter,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;

        let silent: Vec<IpAddr> = peers
            .iter()
            .filter(|entry| entry.value().last_heard.elapsed() > PEER_SILENCE_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();

        for ip in silent {
            peers.remove(&ip);
            info!(peer = %ip, "Mesh peer went silent");
            let event = LinkEvent::Session {
                peer: ip.to_string(),
                state: SessionState::Disconnected,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
        limiter.forget_idle();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> UdpMeshLink {
        UdpMeshLink::new(UdpMeshLinkConfig {
            port: 0,
            broadcast: Ipv4Addr::LOCALHOST,
        })
    }

    #[tokio::test]
    async fn second_start_is_rejected_until_stopped() {
        let link = ephemeral();
        let (tx, _rx) = mpsc::channel(8);

        tokio_test::assert_ok!(link.start(tx.clone()));
        assert!(matches!(link.start(tx.clone()), Err(LinkError::AlreadyRunning)));

        link.stop();
        link.stop();
        tokio_test::assert_ok!(link.start(tx));
        link.stop();
    }

    #[tokio::test]
    async fn send_while_stopped_is_a_no_op() {
        let link = ephemeral();
        link.send(Bytes::from_static(b"frame"), Delivery::Unreliable);
        link.send(Bytes::from_static(b"frame"), Delivery::Reliable);
    }

    const OWN_NONCE: u64 = 0x0101;
    const PEER_NONCE: u64 = 0x0202;

    fn datagram(nonce: u64, frame: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_slice(MAGIC);
        out.put_u64(nonce);
        out.put_slice(frame);
        out.to_vec()
    }

    async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("events open")
    }

    fn frame_of(event: LinkEvent) -> Bytes {
        match event {
            LinkEvent::Frame { frame, .. } => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn datagrams_open_a_session_and_skip_our_own() {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let target = udp.local_addr().unwrap();
        let peers = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(datagram_loop(
            udp,
            OWN_NONCE,
            peers.clone(),
            InboundFrameLimiter::new(),
            tx,
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&datagram(OWN_NONCE, b"echo"), target).await.unwrap();
        sender.send_to(b"XX-not-a-mesh-datagram", target).await.unwrap();
        sender.send_to(&datagram(PEER_NONCE, b"hello"), target).await.unwrap();
        sender.send_to(&datagram(PEER_NONCE, b"again"), target).await.unwrap();

        match next_event(&mut rx).await {
            LinkEvent::Session { peer, state } => {
                assert_eq!(peer, "127.0.0.1");
                assert_eq!(state, SessionState::Connected);
            }
            other => panic!("expected a session event, got {other:?}"),
        }
        assert_eq!(frame_of(next_event(&mut rx).await), Bytes::from_static(b"hello"));
        // A known peer does not reconnect
        assert_eq!(frame_of(next_event(&mut rx).await), Bytes::from_static(b"again"));
        assert_eq!(peers.len(), 1);

        task.abort();
    }

    #[tokio::test]
    async fn reliable_frames_arrive_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        tokio::spawn(stream_writer(addr, frames_rx));

        let (stream, from) = listener.accept().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(stream_reader(stream, from, InboundFrameLimiter::new(), tx));

        for frame in [&b"one"[..], b"two", b"three"] {
            frames_tx.send(Bytes::copy_from_slice(frame)).await.unwrap();
        }
        for expected in [&b"one"[..], b"two", b"three"] {
            match next_event(&mut rx).await {
                LinkEvent::Frame { peer, frame } => {
                    assert_eq!(peer, "127.0.0.1");
                    assert_eq!(frame.as_ref(), expected);
                }
                other => panic!("expected a frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn bad_frame_lengths_close_the_stream() {
        for len in [0u32, (MAX_FRAME_LEN + 1) as u32] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (stream, from) = listener.accept().await.unwrap();
            let (tx, mut rx) = mpsc::channel(8);
            let reader = tokio::spawn(stream_reader(stream, from, InboundFrameLimiter::new(), tx));

            let mut bytes = BytesMut::new();
            bytes.put_u32(len);
            bytes.put_u32(2);
            bytes.put_slice(b"ok");
            client.write_all(&bytes).await.unwrap();

            tokio::time::timeout(Duration::from_secs(2), reader)
                .await
                .expect("reader exits")
                .unwrap();
            assert!(rx.try_recv().is_err(), "no frame after length {len}");
        }
    }

    #[tokio::test]
    async fn silent_peers_are_disconnected() {
        let peers = Arc::new(DashMap::new());
        let quiet: IpAddr = Ipv4Addr::new(10, 0, 0, 9).into();
        let chatty: IpAddr = Ipv4Addr::new(10, 0, 0, 8).into();
        let long_ago = Instant::now()
            .checked_sub(PEER_SILENCE_TIMEOUT + Duration::from_secs(1))
            .unwrap();
        peers.insert(quiet, PeerSession { last_heard: long_ago, writer: None });
        peers.insert(chatty, PeerSession { last_heard: Instant::now(), writer: None });

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(sweep_loop(peers.clone(), InboundFrameLimiter::new(), tx));

        match next_event(&mut rx).await {
            LinkEvent::Session { peer, state } => {
                assert_eq!(peer, "10.0.0.9");
                assert_eq!(state, SessionState::Disconnected);
            }
            other => panic!("expected a session event, got {other:?}"),
        }
        assert!(!peers.contains_key(&quiet));
        assert!(peers.contains_key(&chatty));
        task.abort();
    }

    #[tokio::test]
    async fn finished_tasks_are_pruned_on_spawn() {
        let tasks = LinkTasks::default();
        for _ in 0..20 {
            tasks.spawn(async {});
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        tasks.spawn(std::future::pending::<()>());
        assert_eq!(tasks.0.lock().len(), 1);
        tasks.abort_all();
        assert!(tasks.0.lock().is_empty());
    }

    #[test]
    fn receive_errors_pause_then_give_up() {
        let mut errors = RecvErrors::default();
        for _ in 1..MAX_RECV_ERRORS {
            assert_eq!(errors.failed(), Some(RECV_ERROR_PAUSE));
        }
        assert_eq!(errors.failed(), None);

        errors.succeeded();
        assert_eq!(errors.failed(), Some(RECV_ERROR_PAUSE));
    }
}
