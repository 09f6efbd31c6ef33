//! Length-prefixed JSON gossip transport over TCP.
//!
//! Each connection gets a dedicated outbound queue; writes never block the
//! read side. At enqueue time every message is run through the installed
//! scenario filter and stamped with a send-at instant; the write task
//! delivers messages in queue order, sleeping until each one's send-at
//! time, so per-peer FIFO ordering survives randomised per-message delay.
//! Inbound messages are forwarded, tagged with the sending peer's node id,
//! onto a single channel the node scheduler drains. Inbound block gossip is
//! deduplicated against a bounded recent-hash set so a cyclic topology
//! doesn't loop messages forever; re-flooding is the scheduler's call, made
//! only once the chain store accepts a block, via
//! [`Transport::broadcast_except`] (source suppression: a block is never
//! echoed back to the peer it came from).

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::net::message::{Message, ScoreSummary};
use crate::scenario::{NoScenario, ScenarioFilter};
use crate::time::now_ms;

/// Distinct recent hashes remembered per squared node count; sizes the
/// duplicate-suppression set.
const RECENT_DEPTH: usize = 64;
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(2);
const PING_INTERVAL: Duration = Duration::from_secs(2);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
/// How often a live connection re-advertises the local tip. A `Hello` is
/// also sent at connect; the periodic repeat is what lets two sides of a
/// healed partition notice each other's chains without reconnecting.
const HELLO_INTERVAL: Duration = Duration::from_secs(2);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// A write stalled longer than this drops the message and closes the
/// connection; the reconnect path takes over from there.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_MALFORMED_FRAMES: u32 = 3;

/// `size >= node_count^2 * recent_depth`, so duplicate suppression stays
/// effective as the network grows.
pub fn seen_set_capacity(node_count: usize) -> usize {
    node_count.max(1).pow(2) * RECENT_DEPTH
}

/// Reads one length-prefixed JSON message from `reader`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, NetError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 16 * 1024 * 1024 {
        return Err(NetError::MalformedFrame(format!(
            "frame length {len} exceeds maximum"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| NetError::MalformedFrame(e.to_string()))
}

/// Writes one length-prefixed JSON message to `writer`.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), NetError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg).map_err(|e| NetError::MalformedFrame(e.to_string()))?;
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Bounded FIFO set used to suppress re-broadcasting a block hash we've
/// already seen.
struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    /// Returns `true` if this is the first time `hash` has been seen.
    fn insert(&mut self, hash: String) -> bool {
        if self.members.contains(&hash) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(hash.clone());
        self.members.insert(hash);
        true
    }
}

/// Outbound queue of the most recent live connection to a peer. A pair of
/// nodes that dial each other ends up with two live connections; whichever
/// registered last carries the application traffic, and a stale handle is
/// only evicted by the connection that owns it.
struct PeerHandle {
    sender: mpsc::UnboundedSender<(tokio::time::Instant, Message)>,
}

/// This node's locally known tip, advertised in `Hello` messages.
struct LocalTip {
    hash: String,
    score: ScoreSummary,
}

/// Gossip transport for a single node.
pub struct Transport {
    node_id: u64,
    peers: Mutex<std::collections::HashMap<u64, PeerHandle>>,
    seen: Mutex<SeenSet>,
    inbound_tx: mpsc::UnboundedSender<(u64, Message)>,
    local_tip: Mutex<Option<LocalTip>>,
    scenario: Mutex<Box<dyn ScenarioFilter>>,
    started_at: Instant,
}

impl Transport {
    /// Creates a transport and returns the receiving half of its inbound
    /// message channel, which the caller (node scheduler) should drain.
    /// `node_count` sizes the duplicate-suppression set.
    pub fn new(
        node_id: u64,
        node_count: usize,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<(u64, Message)>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = std::sync::Arc::new(Self {
            node_id,
            peers: Mutex::new(std::collections::HashMap::new()),
            seen: Mutex::new(SeenSet::new(seen_set_capacity(node_count))),
            inbound_tx,
            local_tip: Mutex::new(None),
            scenario: Mutex::new(Box::new(NoScenario)),
            started_at: Instant::now(),
        });
        (transport, inbound_rx)
    }

    /// Records this node's current tip so future `Hello` messages
    /// advertise it.
    pub fn set_local_tip(&self, hash: String, score: ScoreSummary) {
        *self.local_tip.lock().unwrap() = Some(LocalTip { hash, score });
    }

    /// Installs the network scenario filter applied to every message this
    /// node enqueues to a peer from now on.
    pub fn set_scenario(&self, scenario: Box<dyn ScenarioFilter>) {
        *self.scenario.lock().unwrap() = scenario;
    }

    /// Runs the installed scenario filter for the `(self, peer_id)` hop.
    /// `None` means the message is dropped (partitioned). The scenario sees
    /// time as milliseconds since this transport was created, not wall
    /// clock, so `heal_at_ms`-style parameters are relative to the run's
    /// start the way the config describes them.
    fn scenario_delay(&self, peer_id: u64) -> Option<Duration> {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        self.scenario
            .lock()
            .unwrap()
            .delay_for(self.node_id, peer_id, elapsed_ms)
    }

    /// Filters `msg` through the scenario and, unless dropped, pushes it
    /// onto `peer_id`'s outbound queue stamped with its send-at instant.
    fn enqueue(&self, peer_id: u64, msg: Message) {
        let Some(delay) = self.scenario_delay(peer_id) else {
            return;
        };
        if let Some(peer) = self.peers.lock().unwrap().get(&peer_id) {
            let _ = peer.sender.send((tokio::time::Instant::now() + delay, msg));
        }
    }

    /// The `Hello` this node currently advertises.
    fn local_hello(&self) -> Message {
        match self.local_tip.lock().unwrap().as_ref() {
            Some(tip) => Message::Hello {
                node_id: self.node_id,
                tip_hash: Some(tip.hash.clone()),
                tip_score: Some(tip.score),
            },
            None => Message::Hello {
                node_id: self.node_id,
                tip_hash: None,
                tip_score: None,
            },
        }
    }

    /// Binds `addr` and spawns a background task accepting inbound peer
    /// connections for the lifetime of the returned `JoinHandle`.
    pub async fn listen(
        self: std::sync::Arc<Self>,
        addr: &str,
    ) -> Result<tokio::task::JoinHandle<()>, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "accepted inbound connection");
                        let this = std::sync::Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = this.handle_connection(stream).await {
                                tracing::warn!(%err, "inbound connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Dials `addr` and keeps reconnecting with exponential backoff until
    /// the transport is dropped. Intended to be spawned once per
    /// configured peer.
    pub async fn dial_with_retry(self: std::sync::Arc<Self>, peer_id: u64, addr: String) {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;
        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    backoff = RECONNECT_INITIAL_BACKOFF;
                    if let Err(err) = self.handle_connection(stream).await {
                        tracing::warn!(peer_id, %err, "connection to peer dropped");
                    }
                }
                Err(err) => {
                    tracing::debug!(peer_id, %addr, %err, "dial failed, retrying");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
        }
    }

    /// Handles one established connection in either direction: sends our
    /// `Hello` directly (before the peer is known to the scenario filter),
    /// reads the peer's `Hello` to learn its node id, registers an outbound
    /// queue for it, then pumps reads and writes until the connection
    /// closes (idle beyond the `Ping`/`Pong` liveness timeout, or after
    /// three consecutive malformed frames).
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), NetError> {
        stream.set_nodelay(true).ok();
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, &self.local_hello()).await?;

        let hello = read_frame(&mut read_half).await?;
        let peer_id = match &hello {
            Message::Hello { node_id, .. } => *node_id,
            other => {
                return Err(NetError::MalformedFrame(format!(
                    "expected Hello, got {other:?}"
                )))
            }
        };
        crate::logging::events::peer_connected(self.node_id, peer_id);

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<(tokio::time::Instant, Message)>();
        self.peers.lock().unwrap().insert(
            peer_id,
            PeerHandle {
                sender: conn_tx.clone(),
            },
        );

        // Hand the handshake Hello to the scheduler so it can start a
        // catch-up if the peer's advertised tip is unknown.
        let _ = self.inbound_tx.send((peer_id, hello));

        let write_task = tokio::spawn(async move {
            while let Some((send_at, msg)) = conn_rx.recv().await {
                tokio::time::sleep_until(send_at).await;
                match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut write_half, &msg)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        });

        // Liveness and tip advertisement stay connection-local: a ping
        // answered on a different connection would say nothing about this
        // one's health.
        let send_local = |msg: Message| {
            if let Some(delay) = self.scenario_delay(peer_id) {
                let _ = conn_tx.send((tokio::time::Instant::now() + delay, msg));
            }
        };

        let mut last_pong = now_ms();
        let mut last_ping_sent = now_ms();
        let mut last_hello_sent = now_ms();
        let mut malformed_streak: u32 = 0;

        let result = loop {
            if now_ms().saturating_sub(last_pong) > PONG_TIMEOUT.as_millis() as u64 {
                break Err(NetError::Closed);
            }
            if now_ms().saturating_sub(last_ping_sent) > PING_INTERVAL.as_millis() as u64 {
                send_local(Message::Ping { timestamp: now_ms() });
                last_ping_sent = now_ms();
            }
            if now_ms().saturating_sub(last_hello_sent) > HELLO_INTERVAL.as_millis() as u64 {
                send_local(self.local_hello());
                last_hello_sent = now_ms();
            }

            match tokio::time::timeout(READ_POLL_INTERVAL, read_frame(&mut read_half)).await {
                Err(_elapsed) => continue,
                Ok(Ok(Message::Block { block })) => {
                    malformed_streak = 0;
                    self.forward_if_new(block, peer_id);
                }
                Ok(Ok(Message::Blocks { blocks })) => {
                    // Catch-up responses are forwarded but not re-flooded;
                    // only fresh single-block gossip propagates.
                    malformed_streak = 0;
                    for block in blocks {
                        let is_new = self.seen.lock().unwrap().insert(block.hash.clone());
                        if is_new {
                            let _ = self.inbound_tx.send((peer_id, Message::Block { block }));
                        }
                    }
                }
                Ok(Ok(Message::Ping { timestamp })) => {
                    malformed_streak = 0;
                    send_local(Message::Pong { timestamp });
                }
                Ok(Ok(Message::Pong { .. })) => {
                    malformed_streak = 0;
                    last_pong = now_ms();
                }
                Ok(Ok(msg)) => {
                    malformed_streak = 0;
                    let _ = self.inbound_tx.send((peer_id, msg));
                }
                // Socket-level failure (reset, EOF): close at once and let
                // the reconnect path take over. Malformed frames are more
                // forgiving: the peer may just have sent one bad message.
                Ok(Err(err @ NetError::Io(_))) => break Err(err),
                Ok(Err(err)) => {
                    malformed_streak += 1;
                    tracing::warn!(peer_id, %err, malformed_streak, "dropping malformed frame");
                    if malformed_streak >= MAX_CONSECUTIVE_MALFORMED_FRAMES {
                        break Err(err);
                    }
                }
            }
        };

        {
            let mut peers = self.peers.lock().unwrap();
            let owned = peers
                .get(&peer_id)
                .is_some_and(|h| h.sender.same_channel(&conn_tx));
            if owned {
                peers.remove(&peer_id);
            }
        }
        crate::logging::events::peer_disconnected(self.node_id, peer_id);
        write_task.abort();
        result
    }

    /// Forwards a block received from `from_peer` to the scheduler, unless
    /// it's a duplicate. Re-broadcast is not decided here: an invalid block
    /// must never be flooded, and only the chain store can tell.
    fn forward_if_new(&self, block: crate::types::Block, from_peer: u64) {
        let is_new = self.seen.lock().unwrap().insert(block.hash.clone());
        if !is_new {
            return;
        }
        let _ = self.inbound_tx.send((from_peer, Message::Block { block }));
    }

    /// Sends `msg` to a single known peer, silently dropping it if the
    /// peer is not currently connected or the scenario filter partitions
    /// this hop.
    pub fn send_to(&self, peer_id: u64, msg: Message) {
        self.enqueue(peer_id, msg);
    }

    /// Floods `msg` to every connected peer, subject to the scenario
    /// filter on each hop.
    pub fn broadcast(&self, msg: Message) {
        let peer_ids: Vec<u64> = self.peers.lock().unwrap().keys().copied().collect();
        for peer_id in peer_ids {
            self.enqueue(peer_id, msg.clone());
        }
    }

    /// Floods `msg` to every connected peer except `exclude` (source
    /// suppression: never echo a block back to the peer that sent it).
    pub fn broadcast_except(&self, msg: Message, exclude: u64) {
        let peer_ids: Vec<u64> = self.peers.lock().unwrap().keys().copied().collect();
        for peer_id in peer_ids {
            if peer_id != exclude {
                self.enqueue(peer_id, msg.clone());
            }
        }
    }

    /// Marks `hash` as seen without broadcasting, used when a block was
    /// produced locally so a later inbound copy is recognised as a dup.
    pub fn mark_seen(&self, hash: &str) -> bool {
        self.seen.lock().unwrap().insert(hash.to_string())
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}
