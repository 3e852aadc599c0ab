//! Peer registry for tracking connected viewer instances
//!
//! The registry is pure in-memory bookkeeping, keyed by the peer id the
//! manager assigned when it admitted the connection. It never touches
//! sockets; the manager owns those and keeps the registry in step with
//! connection lifecycle events.
//!
//! Shared as [`SharedRegistry`] between the worker and the application
//! thread so the UI can snapshot the peer list without a channel round
//! trip. The lock is never held across an await point.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Registry handle shared between worker and application threads.
pub type SharedRegistry = Arc<Mutex<PeerRegistry>>;

/// Create an empty shared registry.
pub fn shared_registry() -> SharedRegistry {
    Arc::new(Mutex::new(PeerRegistry::new()))
}

/// One connected viewer instance
#[derive(Debug, Clone)]
pub struct Peer {
    /// Locally assigned peer id, equal to the connection id
    pub id: u16,
    /// Remote address of the connection
    pub address: IpAddr,
    /// Port of the peer's own server, zero if it runs none
    pub server_port: u16,
    /// Window title the peer last announced
    pub title: String,
    /// Instance name from discovery, empty for inbound connections
    pub client_name: String,
    /// Whether the application lists this peer in its sync menu
    pub show_in_menu: bool,
    synchronized: bool,
    last_seen: Instant,
}

impl Peer {
    /// Create a new peer record from a completed greeting.
    pub fn new(id: u16, address: IpAddr, server_port: u16, title: impl Into<String>) -> Self {
        Self {
            id,
            address,
            server_port,
            title: title.into(),
            client_name: String::new(),
            show_in_menu: true,
            synchronized: false,
            last_seen: Instant::now(),
        }
    }

    /// Set the instance name learned from discovery.
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Whether this peer is part of the synchronized session.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Whether the peer sent anything within the given window.
    pub fn is_active(&self, window: Duration) -> bool {
        self.last_seen.elapsed() < window
    }

    /// Whether the peer connects over loopback.
    pub fn is_local(&self) -> bool {
        self.address.is_loopback()
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Plain-data copy of a peer for the application thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: u16,
    pub address: IpAddr,
    pub server_port: u16,
    pub title: String,
    pub client_name: String,
    pub synchronized: bool,
    pub active: bool,
    pub show_in_menu: bool,
    pub local: bool,
}

/// In-memory registry of connected peers
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<u16, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns false without touching the registry if the id
    /// is already taken.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        self.peers.insert(peer.id, peer);
        true
    }

    /// Remove a peer, returning its record.
    pub fn remove_peer(&mut self, id: u16) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// Drop all peers.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_by_id(&self, id: u16) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Find a peer by the port its server listens on.
    pub fn peer_by_server_port(&self, port: u16) -> Option<&Peer> {
        if port == 0 {
            return None;
        }
        self.peers.values().find(|p| p.server_port == port)
    }

    /// Whether a peer with this address and advertised server port is
    /// already connected. Used to reject duplicate connections.
    pub fn already_connected_to(&self, address: IpAddr, server_port: u16) -> bool {
        if server_port == 0 {
            return false;
        }
        self.peers
            .values()
            .any(|p| p.address == address && p.server_port == server_port)
    }

    /// Flip the synchronized flag. Returns false if the peer is unknown.
    pub fn set_synchronized(&mut self, id: u16, synchronized: bool) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.synchronized = synchronized;
                true
            }
            None => false,
        }
    }

    /// Mark every peer unsynchronized.
    pub fn clear_synchronized(&mut self) {
        for peer in self.peers.values_mut() {
            peer.synchronized = false;
        }
    }

    /// Update a peer's title. Returns false if the peer is unknown.
    pub fn set_title(&mut self, id: u16, title: impl Into<String>) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.title = title.into();
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Update the menu visibility flag. Returns false if the peer is unknown.
    pub fn set_show_in_menu(&mut self, id: u16, show: bool) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.show_in_menu = show;
                true
            }
            None => false,
        }
    }

    /// Refresh a peer's liveness timestamp. Returns false if unknown.
    pub fn touch(&mut self, id: u16) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Ids of all synchronized peers, sorted for deterministic fan-out.
    pub fn synchronized_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .peers
            .values()
            .filter(|p| p.synchronized)
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Server ports of all synchronized peers, zero entries omitted,
    /// sorted. This is the payload of synchronize-list messages.
    pub fn synchronized_server_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .peers
            .values()
            .filter(|p| p.synchronized && p.server_port != 0)
            .map(|p| p.server_port)
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Ids of peers that sent anything within the window.
    pub fn active_ids(&self, window: Duration) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .peers
            .values()
            .filter(|p| p.is_active(window))
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Plain-data snapshots for the application thread, sorted by id.
    pub fn snapshots(&self, window: Duration) -> Vec<PeerSnapshot> {
        let mut list: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|p| PeerSnapshot {
                id: p.id,
                address: p.address,
                server_port: p.server_port,
                title: p.title.clone(),
                client_name: p.client_name.clone(),
                synchronized: p.synchronized,
                active: p.is_active(window),
                show_in_menu: p.show_in_menu,
                local: p.is_local(),
            })
            .collect();
        list.sort_unstable_by_key(|s| s.id);
        list
    }
}
