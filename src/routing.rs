use std::net::SocketAddr;

use crate::id::PeerId;

/// A known node: identifier plus reachable endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// The set of known peers, including the local node's own entry.
///
/// A flat list rather than a bucketed tree: the local peer always sits at
/// slot 0, identifiers are unique, and nearness queries are full scans.
#[derive(Debug)]
pub struct RoutingTable {
    peers: Vec<Peer>,
}

impl RoutingTable {
    pub fn new(local: Peer) -> Self {
        Self { peers: vec![local] }
    }

    pub fn local(&self) -> &Peer {
        &self.peers[0]
    }

    /// All entries in scan order, local peer first.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().skip(1)
    }

    pub fn remote_count(&self) -> usize {
        self.peers.len() - 1
    }

    /// Inserts unless the identifier is already present.
    pub fn add(&mut self, peer: Peer) {
        if !self.has_id(&peer.id) {
            self.peers.push(peer);
        }
    }

    pub fn has_id(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.id == id)
    }

    pub fn has_addr(&self, addr: &SocketAddr) -> bool {
        self.peers.iter().any(|p| &p.addr == addr)
    }

    pub fn get_by_id(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.addr == addr)
    }

    /// Removes matching remote entries; the local peer is never removed.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        if &self.peers[0].id == id {
            return false;
        }
        let before = self.peers.len();
        self.peers.retain(|p| &p.id != id);
        self.peers.len() != before
    }

    /// Core routing primitive: among the local peer and all remotes whose
    /// identifier is not `except`, the one minimizing `id XOR target`.
    ///
    /// Exclusion of `except` is strict and unconditional. Ties break by
    /// scan order, local peer first, so the local peer loses only to a
    /// strictly closer remote.
    pub fn next_hop(&self, target: &PeerId, except: &PeerId) -> Option<Peer> {
        let mut best: Option<(&Peer, PeerId)> = None;
        for peer in &self.peers {
            if &peer.id == except {
                continue;
            }
            let distance = peer.id ^ *target;
            match &best {
                Some((_, min)) if distance >= *min => {}
                _ => best = Some((peer, distance)),
            }
        }
        best.map(|(p, _)| p.clone())
    }

    /// Identifier differing from the local one at exactly bit `level`,
    /// used to probe table coverage per bit position.
    pub fn lookup_target(&self, level: u32) -> PeerId {
        self.peers[0].id ^ (PeerId::one() << level)
    }

    /// Index of the highest bit at which `id` differs from the local
    /// identifier, `-1` when identical.
    pub fn level_of(&self, id: &PeerId) -> i32 {
        (*id ^ self.peers[0].id).highest_bit()
    }
}
