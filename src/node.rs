use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom as _;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::NetError;
use crate::id::{BroadcastTag, PeerId, PEER_ID_LEN};
use crate::packet::Packet;
use crate::routing::{Peer, RoutingTable};
use crate::transport::Transport;

/// How long `join` waits for each entry node to answer.
const ENTRY_NODE_TIMEOUT: Duration = Duration::from_millis(200);
/// Receive granularity of the run loop; bounds stop latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// Wire opcodes. Each datagram carries zero or more back-to-back messages
/// sharing one opcode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    None = 0,
    Ping = 1,
    Pong = 2,
    Handshake = 3,
    HandshakeReply = 4,
    Lookup = 5,
    LookupReply = 6,
    Route = 7,
    Broadcast = 8,
    Message = 9,
    Disconnect = 10,
}

impl TryFrom<u8> for Opcode {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::None),
            1 => Ok(Opcode::Ping),
            2 => Ok(Opcode::Pong),
            3 => Ok(Opcode::Handshake),
            4 => Ok(Opcode::HandshakeReply),
            5 => Ok(Opcode::Lookup),
            6 => Ok(Opcode::LookupReply),
            7 => Ok(Opcode::Route),
            8 => Ok(Opcode::Broadcast),
            9 => Ok(Opcode::Message),
            10 => Ok(Opcode::Disconnect),
            _ => Err(NetError::InvalidOpcode(value)),
        }
    }
}

/// A message handed to subscribers: who sent it and what it said.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: PeerId,
    pub text: String,
}

/// A node in the overlay: owns the routing table, the broadcast dedup set,
/// and the transport handle, and drives the opcode state machine.
///
/// All receives funnel through one mutex-guarded buffer, so `join`'s
/// bounded polls and the `run` loop can never read the transport
/// concurrently. Locks are never held across an await.
pub struct PeerNode<T: Transport> {
    transport: T,
    table: RwLock<RoutingTable>,
    seen_broadcasts: RwLock<HashSet<BroadcastTag>>,
    entry_nodes: Vec<SocketAddr>,
    delivery_tx: broadcast::Sender<Delivery>,
    read_buf: Mutex<Vec<u8>>,
    stop_tx: watch::Sender<bool>,
}

impl<T: Transport> PeerNode<T> {
    /// Creates a node with a freshly generated identifier bound to the
    /// transport's local endpoint.
    pub fn new(transport: T, entry_nodes: Vec<SocketAddr>) -> Result<Self, NetError> {
        let local_addr = transport.local_addr()?;
        let local = Peer::new(PeerId::generate(), local_addr);
        info!("listening on {} with id {}", local_addr, local.id);

        let (delivery_tx, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            transport,
            table: RwLock::new(RoutingTable::new(local)),
            seen_broadcasts: RwLock::new(HashSet::new()),
            entry_nodes,
            delivery_tx,
            read_buf: Mutex::new(Vec::new()),
            stop_tx,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.table.read().local().id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.table.read().local().addr
    }

    /// Snapshot of the routing table, local peer first.
    pub fn peers(&self) -> Vec<Peer> {
        self.table.read().peers().to_vec()
    }

    /// True once the routing table holds at least one remote peer.
    pub fn is_connected(&self) -> bool {
        self.table.read().remote_count() > 0
    }

    /// Subscribes to messages delivered to this node (direct and
    /// broadcast).
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.delivery_tx.subscribe()
    }

    /// Bootstraps into the overlay: tries the configured entry nodes in
    /// random order until one handshake succeeds, then probes every bit
    /// level of the identifier space to spread the routing table.
    pub async fn join(&self) -> Result<(), NetError> {
        let mut order = self.entry_nodes.clone();
        order.shuffle(&mut rand::rng());

        let local_addr = self.local_addr();
        let local_id = self.local_id();

        for entry in order {
            if entry == local_addr {
                continue;
            }
            let mut packet = Packet::new();
            packet.put_u8(Opcode::Handshake as u8);
            packet.put_uid(&local_id);

            debug!("trying entry node {}", entry);
            if let Err(err) = self.transport.send(packet.as_slice(), entry).await {
                warn!("entry node {} send failed: {}", entry, err);
                continue;
            }
            if let Err(err) = self.poll_once(ENTRY_NODE_TIMEOUT).await {
                warn!("entry node {} receive failed: {}", entry, err);
            }
            if self.is_connected() {
                break;
            }
        }

        if !self.is_connected() {
            return Err(NetError::NoEntryNode);
        }

        // Probe for peers differing from us at each bit position, most
        // significant first, independent of entry-node proximity. Probes
        // are fire-and-forget: a failed send never unwinds a join that
        // already reached the overlay.
        for level in (0..PEER_ID_LEN as u32 * 8).rev() {
            let target = self.table.read().lookup_target(level);
            if let Err(err) = self.lookup(target).await {
                debug!("lookup at level {} failed: {}", level, err);
            }
        }

        Ok(())
    }

    /// Receive loop: dispatches datagrams until [`stop`](Self::stop) is
    /// called. Per-packet errors are logged, never fatal.
    pub async fn run(&self) -> Result<(), NetError> {
        let mut stop_rx = self.stop_tx.subscribe();
        while !*stop_rx.borrow() {
            let mut buf = self.read_buf.lock().await;
            // Only the bounded receive races the stop signal: a datagram
            // already read is dispatched to completion, replies and
            // forwards included, before the loop re-checks it.
            let received = tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                received = timeout(POLL_TIMEOUT, self.transport.recv(&mut buf)) => received,
            };
            match received {
                Err(_) => {}
                Ok(Ok((len, from))) => self.process_datagram(&buf[..len], from).await,
                Ok(Err(NetError::Disconnect)) => debug!("transport reset, continuing"),
                Ok(Err(err)) => warn!("receive error: {}", err),
            }
        }
        Ok(())
    }

    /// Signals the run loop to exit; in-flight datagram processing is not
    /// interrupted.
    pub fn stop(&self) {
        // send_replace: the signal must not be lost when the run loop has
        // not subscribed yet.
        self.stop_tx.send_replace(true);
    }

    /// Floods a message to the overlay with a fresh one-time tag.
    pub async fn broadcast(&self, text: &str) -> Result<(), NetError> {
        let tag = BroadcastTag::generate();

        let mut packet = Packet::new();
        packet.put_u8(Opcode::Broadcast as u8);
        packet.put_uid(&self.local_id());
        packet.put_uid(&tag);
        packet.put_str(text);

        self.seen_broadcasts.write().insert(tag);

        let targets: Vec<SocketAddr> = self.table.read().remotes().map(|p| p.addr).collect();
        for addr in targets {
            if let Err(err) = self.transport.send(packet.as_slice(), addr).await {
                warn!("broadcast to {} failed: {}", addr, err);
            }
        }
        Ok(())
    }

    /// Sends a direct message toward `destination`, relaying through the
    /// nearest known peer when no direct route exists.
    pub async fn send(&self, text: &str, destination: PeerId) -> Result<(), NetError> {
        let mut packet = Packet::new();
        packet.put_u8(Opcode::Message as u8);
        packet.put_str(text);
        self.send_packet(&packet, destination).await
    }

    /// Announces departure to every known peer.
    pub async fn disconnect(&self) -> Result<(), NetError> {
        let mut packet = Packet::new();
        packet.put_u8(Opcode::Disconnect as u8);

        let targets: Vec<SocketAddr> = self.table.read().remotes().map(|p| p.addr).collect();
        for addr in targets {
            if let Err(err) = self.transport.send(packet.as_slice(), addr).await {
                warn!("disconnect to {} failed: {}", addr, err);
            }
        }
        Ok(())
    }

    /// Issues a LOOKUP toward `target` through the nearest known peer,
    /// recording that first hop as the relay for the reply path.
    async fn lookup(&self, target: PeerId) -> Result<(), NetError> {
        let relay = {
            let table = self.table.read();
            let local_id = table.local().id;
            table.next_hop(&target, &local_id)
        };
        // Alone in the network: nothing to ask.
        let Some(relay) = relay else { return Ok(()) };

        let mut packet = Packet::new();
        packet.put_u8(Opcode::Lookup as u8);
        packet.put_uid(&relay.id);
        self.send_packet(&packet, target).await
    }

    /// Delivers `packet` to `destination`: directly when the nearest known
    /// peer is the destination itself, otherwise wrapped in one ROUTE
    /// envelope toward it. Dropped when the table has no candidate.
    async fn send_packet(&self, packet: &Packet, destination: PeerId) -> Result<(), NetError> {
        let local_id = self.local_id();
        let next = { self.table.read().next_hop(&destination, &local_id) };
        let Some(next) = next else {
            debug!("no route toward {}, dropping", destination);
            return Ok(());
        };

        if next.id == destination {
            self.transport.send(packet.as_slice(), next.addr).await
        } else {
            let mut route = Packet::new();
            route.put_u8(Opcode::Route as u8);
            route.put_uid(&local_id);
            route.put_uid(&destination);
            route.put_u32(packet.len() as u32);
            route.put_raw(packet.as_slice());
            self.transport.send(route.as_slice(), next.addr).await
        }
    }

    /// One bounded receive followed by synchronous dispatch. Returns
    /// `Ok(false)` when the wait timed out.
    async fn poll_once(&self, wait: Duration) -> Result<bool, NetError> {
        let mut buf = self.read_buf.lock().await;
        match timeout(wait, self.transport.recv(&mut buf)).await {
            Err(_) => Ok(false),
            Ok(Err(err)) => Err(err),
            Ok(Ok((len, from))) => {
                // Guard stays held: one datagram is fully processed,
                // forwarding sends included, before the next read.
                self.process_datagram(&buf[..len], from).await;
                Ok(true)
            }
        }
    }

    /// Decodes and dispatches every message in one datagram.
    ///
    /// `source` defaults to the identifier of the sending endpoint (zero if
    /// unknown). ROUTE overrides it for the remainder of its sub-message;
    /// the override resets after each non-ROUTE opcode.
    async fn process_datagram(&self, data: &[u8], from: SocketAddr) {
        let local_id = self.local_id();
        let mut hop_id = {
            self.table
                .read()
                .get_by_addr(&from)
                .map(|p| p.id)
                .unwrap_or_default()
        };
        let mut source = hop_id;

        let mut packet = Packet::from_slice(data);
        while !packet.remaining().is_empty() {
            let start = packet.offset();
            let raw = packet.get_u8();
            let opcode = match Opcode::try_from(raw) {
                Ok(opcode) => opcode,
                Err(_) => {
                    // Cannot skip an unknown payload of unknown length.
                    warn!("invalid opcode {} from {}, dropping datagram", raw, from);
                    return;
                }
            };
            trace!("[{:?}] {:?} {}", opcode, source, from);

            match opcode {
                Opcode::None | Opcode::Pong => {}
                Opcode::Ping => {
                    let mut reply = Packet::new();
                    reply.put_u8(Opcode::Pong as u8);
                    if let Err(err) = self.transport.send(reply.as_slice(), from).await {
                        warn!("pong to {} failed: {}", from, err);
                    }
                }
                Opcode::Handshake => {
                    let id: PeerId = packet.get_uid();
                    self.learn_peer(id, from);
                    hop_id = id;
                    source = id;

                    let mut reply = Packet::new();
                    reply.put_u8(Opcode::HandshakeReply as u8);
                    reply.put_uid(&local_id);
                    if let Err(err) = self.send_packet(&reply, id).await {
                        warn!("handshake reply to {} failed: {}", id, err);
                    }
                }
                Opcode::HandshakeReply => {
                    let id: PeerId = packet.get_uid();
                    self.learn_peer(id, from);
                    hop_id = id;
                    source = id;
                }
                Opcode::Lookup => {
                    let relay_id: PeerId = packet.get_uid();
                    self.answer_lookup(relay_id, source).await;
                }
                Opcode::LookupReply => {
                    let id: PeerId = packet.get_uid();
                    let port = packet.get_u16();
                    let address = packet.get_str();
                    self.handle_lookup_reply(id, port, &address).await;
                }
                Opcode::Route => {
                    let routed_source: PeerId = packet.get_uid();
                    let routed_destination: PeerId = packet.get_uid();
                    let payload_len = packet.get_u32() as usize;

                    let next = { self.table.read().next_hop(&routed_destination, &hop_id) };
                    match next {
                        Some(next) if next.id != local_id => {
                            // Pass-through: forward header and payload
                            // bytes unchanged, no decode.
                            let end = (packet.offset() + payload_len).min(packet.len());
                            let window = &packet.as_slice()[start..end];
                            if let Err(err) = self.transport.send(window, next.addr).await {
                                warn!("route toward {} failed: {}", routed_destination, err);
                            }
                            packet.skip(payload_len);
                            source = hop_id;
                        }
                        _ => {
                            // Arrived: keep decoding the payload in place
                            // with the routed source in effect.
                            source = routed_source;
                        }
                    }
                }
                Opcode::Broadcast => {
                    let broadcast_source: PeerId = packet.get_uid();
                    let tag: BroadcastTag = packet.get_uid();
                    let text = packet.get_str();

                    let first_seen = self.seen_broadcasts.write().insert(tag);
                    if first_seen {
                        let window = packet.as_slice()[start..packet.offset()].to_vec();
                        self.flood(broadcast_source, &window, from).await;
                        let _ = self.delivery_tx.send(Delivery {
                            source: broadcast_source,
                            text,
                        });
                    }
                }
                Opcode::Message => {
                    // The ROUTE chain already confirmed local delivery.
                    let text = packet.get_str();
                    let _ = self.delivery_tx.send(Delivery { source, text });
                }
                Opcode::Disconnect => {
                    if source == hop_id {
                        self.handle_disconnect(source).await;
                    }
                }
            }

            if opcode != Opcode::Route {
                source = hop_id;
            }
        }
    }

    /// Adds a newly discovered peer unless its identifier is known.
    fn learn_peer(&self, id: PeerId, addr: SocketAddr) {
        let mut table = self.table.write();
        if !table.has_id(&id) {
            info!("connect: {}", id);
            table.add(Peer::new(id, addr));
        }
    }

    /// Answers a LOOKUP: the reply retraces the relay path by nesting a
    /// ROUTE addressed to the requester inside a ROUTE addressed to the
    /// relay point the LOOKUP was forwarded through.
    async fn answer_lookup(&self, relay_id: PeerId, requester: PeerId) {
        let (local_id, local_addr, next) = {
            let table = self.table.read();
            let local = table.local().clone();
            let next = table.next_hop(&relay_id, &local.id);
            (local.id, local.addr, next)
        };
        let Some(next) = next else { return };

        let mut reply = Packet::new();
        reply.put_u8(Opcode::LookupReply as u8);
        reply.put_uid(&local_id);
        reply.put_u16(local_addr.port());
        reply.put_str(&local_addr.ip().to_string());

        let mut inner = Packet::new();
        inner.put_u8(Opcode::Route as u8);
        inner.put_uid(&local_id);
        inner.put_uid(&requester);
        inner.put_u32(reply.len() as u32);
        inner.put_raw(reply.as_slice());

        let mut outer = Packet::new();
        outer.put_u8(Opcode::Route as u8);
        outer.put_uid(&local_id);
        outer.put_uid(&relay_id);
        outer.put_u32(inner.len() as u32);
        outer.put_raw(inner.as_slice());

        if let Err(err) = self.transport.send(outer.as_slice(), next.addr).await {
            warn!("lookup reply toward {} failed: {}", relay_id, err);
        }
    }

    /// Completes peer introduction after a LOOKUP round-trip: record the
    /// replier and handshake it directly.
    async fn handle_lookup_reply(&self, id: PeerId, port: u16, address: &str) {
        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("lookup reply with bad address {:?}, ignoring", address);
                return;
            }
        };
        let addr = SocketAddr::new(ip, port);

        let known = self.table.read().has_id(&id);
        if known {
            return;
        }
        self.learn_peer(id, addr);

        let mut packet = Packet::new();
        packet.put_u8(Opcode::Handshake as u8);
        packet.put_uid(&self.local_id());
        if let Err(err) = self.transport.send(packet.as_slice(), addr).await {
            warn!("handshake to {} failed: {}", addr, err);
        }
    }

    /// Forwards a broadcast frame outward along the distance metric: only
    /// to peers strictly farther from the broadcast source than we are,
    /// never back toward the sender.
    async fn flood(&self, broadcast_source: PeerId, frame: &[u8], from: SocketAddr) {
        let targets: Vec<SocketAddr> = {
            let table = self.table.read();
            let local_id = table.local().id;
            let local_distance = broadcast_source ^ local_id;
            table
                .peers()
                .iter()
                .filter(|p| {
                    p.addr != from
                        && p.id != local_id
                        && (broadcast_source ^ p.id) > local_distance
                })
                .map(|p| p.addr)
                .collect()
        };
        for addr in targets {
            if let Err(err) = self.transport.send(frame, addr).await {
                warn!("broadcast forward to {} failed: {}", addr, err);
            }
        }
    }

    /// Removes a departing neighbor and probes the bit level it covered to
    /// refill the gap.
    async fn handle_disconnect(&self, id: PeerId) {
        let repair = {
            let mut table = self.table.write();
            if !table.remove(&id) {
                None
            } else {
                let level = table.level_of(&id);
                (level >= 0).then(|| table.lookup_target(level as u32))
            }
        };
        if let Some(target) = repair {
            info!("disconnect: {}", id);
            if let Err(err) = self.lookup(target).await {
                warn!("repair lookup failed: {}", err);
            }
        }
    }
}
