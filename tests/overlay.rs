//! Multi-node overlay scenarios over an in-memory transport.
//!
//! The test network delivers datagrams between registered endpoints through
//! unbounded channels and can block individual links to simulate partial
//! UDP connectivity. Scripted endpoints drive raw frames directly to probe
//! exact wire behavior.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use peernet::{BroadcastTag, NetError, Opcode, Packet, PeerId, PeerNode, Transport};

type Frame = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct TestNet {
    links: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Frame>>>,
    blocked: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
}

impl TestNet {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn open(self: &Arc<Self>, addr: SocketAddr) -> TestTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(addr, tx);
        TestTransport {
            net: self.clone(),
            addr,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drops all traffic between `a` and `b`, both directions.
    fn block(&self, a: SocketAddr, b: SocketAddr) {
        let mut blocked = self.blocked.lock();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }
}

struct TestTransport {
    net: Arc<TestNet>,
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<(), NetError> {
        if self.net.blocked.lock().contains(&(self.addr, dest)) {
            // Lost datagram, exactly like UDP.
            return Ok(());
        }
        let tx = self.net.links.lock().get(&dest).cloned();
        if let Some(tx) = tx {
            let _ = tx.send((data.to_vec(), self.addr));
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), NetError> {
        let (data, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetError::Disconnect)?;
        if buf.len() < data.len() {
            buf.resize(data.len(), 0);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), from))
    }

    fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.addr)
    }
}

/// Allows a fixed number of sends, then fails every later one the way a
/// closed UDP socket reports refused deliveries.
struct FlakySendTransport {
    inner: TestTransport,
    send_budget: AtomicUsize,
}

#[async_trait]
impl Transport for FlakySendTransport {
    async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<(), NetError> {
        let budget = self.send_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(NetError::Disconnect);
        }
        self.send_budget.store(budget - 1, Ordering::SeqCst);
        self.inner.send(data, dest).await
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), NetError> {
        self.inner.recv(buf).await
    }

    fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner.local_addr()
    }
}

/// Stalls every send so a stop signal can land while a reply is still in
/// flight; counts sends that started and that ran to completion.
struct SlowSendTransport {
    inner: TestTransport,
    delay: Duration,
    sends_started: Arc<AtomicUsize>,
    sends_completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for SlowSendTransport {
    async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<(), NetError> {
        self.sends_started.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        let result = self.inner.send(data, dest).await;
        self.sends_completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), NetError> {
        self.inner.recv(buf).await
    }

    fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner.local_addr()
    }
}

fn addr(host: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), 2000)
}

fn handshake_frame(id: &PeerId) -> Vec<u8> {
    let mut packet = Packet::new();
    packet.put_u8(Opcode::Handshake as u8);
    packet.put_uid(id);
    packet.as_slice().to_vec()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within two seconds");
}

#[tokio::test]
async fn two_nodes_discover_each_other_via_entry_node() {
    let net = TestNet::new();
    let a_addr = addr(1);
    let b_addr = addr(2);

    let a = Arc::new(PeerNode::new(net.open(a_addr), vec![]).unwrap());
    let b = Arc::new(PeerNode::new(net.open(b_addr), vec![a_addr]).unwrap());

    let runner = a.clone();
    let a_task = tokio::spawn(async move { runner.run().await });

    b.join().await.unwrap();

    assert!(b.is_connected());
    assert!(b
        .peers()
        .iter()
        .any(|p| p.id == a.local_id() && p.addr == a_addr));

    // A learned B while answering the handshake, before replying.
    assert!(a.is_connected());
    assert!(a
        .peers()
        .iter()
        .any(|p| p.id == b.local_id() && p.addr == b_addr));

    a.stop();
    a_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn join_fails_without_reachable_entry_node() {
    let net = TestNet::new();
    let lonely = PeerNode::new(net.open(addr(1)), vec![addr(9)]).unwrap();

    let err = lonely.join().await.unwrap_err();
    assert!(matches!(err, NetError::NoEntryNode));
    assert!(!lonely.is_connected());
}

#[tokio::test]
async fn join_survives_send_failures_after_the_handshake() {
    let net = TestNet::new();
    let a_addr = addr(1);
    let b_addr = addr(2);

    let a = Arc::new(PeerNode::new(net.open(a_addr), vec![]).unwrap());
    let runner = a.clone();
    let a_task = tokio::spawn(async move { runner.run().await });

    // One send covers the entry handshake; every probe after it hits a
    // dead socket.
    let transport = FlakySendTransport {
        inner: net.open(b_addr),
        send_budget: AtomicUsize::new(1),
    };
    let b = PeerNode::new(transport, vec![a_addr]).unwrap();

    b.join().await.unwrap();
    assert!(b.is_connected());
    assert!(b.peers().iter().any(|p| p.id == a.local_id()));

    a.stop();
    a_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_lets_in_flight_reply_finish() {
    let net = TestNet::new();
    let n_addr = addr(1);
    let x_addr = addr(2);

    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let transport = SlowSendTransport {
        inner: net.open(n_addr),
        delay: Duration::from_millis(300),
        sends_started: started.clone(),
        sends_completed: completed.clone(),
    };
    let n = Arc::new(PeerNode::new(transport, vec![]).unwrap());
    let x = net.open(x_addr);

    let runner = n.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    let mut ping = Packet::new();
    ping.put_u8(Opcode::Ping as u8);
    x.send(ping.as_slice(), n_addr).await.unwrap();

    // Stop while the pong send is still sleeping inside the transport.
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    n.stop();

    timeout(Duration::from_secs(2), run_task)
        .await
        .expect("run did not return")
        .unwrap()
        .unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    let mut buf = Vec::new();
    let (len, from) = timeout(Duration::from_secs(1), x.recv(&mut buf))
        .await
        .expect("pong never arrived")
        .unwrap();
    assert_eq!(from, n_addr);
    assert!(len > 0);
    assert_eq!(buf[0], Opcode::Pong as u8);
}

#[tokio::test]
async fn message_relays_through_middle_node() {
    let net = TestNet::new();
    let a_addr = addr(1);
    let b_addr = addr(2);
    let c_addr = addr(3);
    // Chain topology: the outer nodes cannot reach each other directly.
    net.block(a_addr, c_addr);

    let a = Arc::new(PeerNode::new(net.open(a_addr), vec![]).unwrap());
    let b = Arc::new(PeerNode::new(net.open(b_addr), vec![a_addr]).unwrap());
    let c = Arc::new(PeerNode::new(net.open(c_addr), vec![b_addr]).unwrap());

    let runner = a.clone();
    tokio::spawn(async move { runner.run().await });
    b.join().await.unwrap();
    let runner = b.clone();
    tokio::spawn(async move { runner.run().await });
    c.join().await.unwrap();
    let runner = c.clone();
    tokio::spawn(async move { runner.run().await });

    // The blocked link kept A and C strangers.
    assert!(!a.peers().iter().any(|p| p.id == c.local_id()));

    let mut inbox = c.subscribe();
    a.send("over the hill", c.local_id()).await.unwrap();

    let delivery = timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("message never arrived")
        .unwrap();
    assert_eq!(delivery.source, a.local_id());
    assert_eq!(delivery.text, "over the hill");

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test]
async fn duplicate_broadcast_delivers_and_forwards_once() {
    let net = TestNet::new();
    let b_addr = addr(1);
    let x_addr = addr(2);
    let y_addr = addr(3);

    let b = Arc::new(PeerNode::new(net.open(b_addr), vec![]).unwrap());
    let x = net.open(x_addr);
    let y = net.open(y_addr);

    let runner = b.clone();
    tokio::spawn(async move { runner.run().await });

    // Introduce Y as a peer maximally far from B.
    let y_id = !b.local_id();
    y.send(&handshake_frame(&y_id), b_addr).await.unwrap();
    let mut buf = Vec::new();
    let (len, _) = timeout(Duration::from_secs(1), y.recv(&mut buf))
        .await
        .expect("no handshake reply")
        .unwrap();
    assert!(len > 0);
    assert_eq!(buf[0], Opcode::HandshakeReply as u8);

    // A source one bit away from B makes Y strictly farther than B,
    // so the flood condition selects Y.
    let source = b.local_id() ^ PeerId::one();
    let tag = BroadcastTag::generate();
    let mut frame = Packet::new();
    frame.put_u8(Opcode::Broadcast as u8);
    frame.put_uid(&source);
    frame.put_uid(&tag);
    frame.put_str("flood");

    let mut inbox = b.subscribe();
    x.send(frame.as_slice(), b_addr).await.unwrap();
    x.send(frame.as_slice(), b_addr).await.unwrap();

    let delivery = timeout(Duration::from_secs(1), inbox.recv())
        .await
        .expect("broadcast not delivered")
        .unwrap();
    assert_eq!(delivery.source, source);
    assert_eq!(delivery.text, "flood");
    assert!(
        timeout(Duration::from_millis(300), inbox.recv()).await.is_err(),
        "duplicate tag delivered twice"
    );

    let (len, from) = timeout(Duration::from_secs(1), y.recv(&mut buf))
        .await
        .expect("broadcast not forwarded")
        .unwrap();
    assert_eq!(from, b_addr);
    let mut forwarded = Packet::from_slice(&buf[..len]);
    assert_eq!(forwarded.get_u8(), Opcode::Broadcast as u8);
    assert_eq!(forwarded.get_uid::<16>(), source);
    assert_eq!(forwarded.get_uid::<32>(), tag);
    assert!(
        timeout(Duration::from_millis(300), y.recv(&mut buf)).await.is_err(),
        "duplicate tag forwarded twice"
    );

    b.stop();
}

#[tokio::test]
async fn disconnect_triggers_removal_and_repair_lookup() {
    let net = TestNet::new();
    let y_addr = addr(1);
    let x_addr = addr(2);
    let z_addr = addr(3);

    let y = Arc::new(PeerNode::new(net.open(y_addr), vec![]).unwrap());
    let x = net.open(x_addr);
    let z = net.open(z_addr);

    let runner = y.clone();
    tokio::spawn(async move { runner.run().await });

    let x_id = PeerId::generate();
    let z_id = PeerId::generate();
    let mut buf = Vec::new();

    x.send(&handshake_frame(&x_id), y_addr).await.unwrap();
    timeout(Duration::from_secs(1), x.recv(&mut buf))
        .await
        .expect("no handshake reply for x")
        .unwrap();
    z.send(&handshake_frame(&z_id), y_addr).await.unwrap();
    timeout(Duration::from_secs(1), z.recv(&mut buf))
        .await
        .expect("no handshake reply for z")
        .unwrap();

    // X announces departure from its known endpoint.
    let mut goodbye = Packet::new();
    goodbye.put_u8(Opcode::Disconnect as u8);
    x.send(goodbye.as_slice(), y_addr).await.unwrap();

    let departed = y.clone();
    wait_until(move || !departed.peers().iter().any(|p| p.id == x_id)).await;

    // The repair lookup probes the bit level X covered, relayed through Z.
    let level = (x_id ^ y.local_id()).highest_bit();
    assert!(level >= 0);
    let expected_target = y.local_id() ^ (PeerId::one() << level as u32);

    let (len, from) = timeout(Duration::from_secs(1), z.recv(&mut buf))
        .await
        .expect("no repair lookup observed")
        .unwrap();
    assert_eq!(from, y_addr);
    let mut repair = Packet::from_slice(&buf[..len]);
    assert_eq!(repair.get_u8(), Opcode::Route as u8);
    assert_eq!(repair.get_uid::<16>(), y.local_id());
    assert_eq!(repair.get_uid::<16>(), expected_target);
    let payload_len = repair.get_u32() as usize;
    assert_eq!(repair.remaining().len(), payload_len);
    assert_eq!(repair.get_u8(), Opcode::Lookup as u8);
    assert_eq!(repair.get_uid::<16>(), z_id);

    y.stop();
}
