//! The synchronization manager
//!
//! One `SyncManager` runs per viewer instance, owned by a single task. It
//! is the only place protocol decisions are made; sockets, discovery, and
//! the registry all report here.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncManager (single select! loop)                              │
//! │  ├── commands: mpsc from the application (via SyncHost)         │
//! │  ├── conn events: messages + closes from connection tasks       │
//! │  ├── accepts: sockets from the SessionServer                    │
//! │  ├── dials: outcomes of spawned outbound connects               │
//! │  ├── discovery: hosts found via UDP announcements               │
//! │  │                                                              │
//! │  ├── conns: HashMap<u16, ConnState> (the socket side)           │
//! │  ├── registry: SharedRegistry (the bookkeeping side)            │
//! │  └── events: broadcast::Sender<SyncEvent> to the application    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop never blocks on the network: outbound connects run in spawned
//! tasks and report back through a channel, sends go through per-connection
//! queues. The registry lock is only ever taken for short synchronous
//! sections.
//!
//! ## Modes
//!
//! - [`SyncMode::Local`]: binds the first free loopback port in the scan
//!   range, probes the rest of the range for siblings, joins sessions
//!   transitively via synchronize-lists, honors quit messages.
//! - [`SyncMode::Lan`]: UDP discovery plus an on-demand server on all
//!   interfaces; synchronize-list ports are informational only.
//! - [`SyncMode::RemoteControl`]: LAN behavior plus a per-connection
//!   permission gate; an ungranted link carries only identity,
//!   permission, mode, and farewell traffic.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::connection::{spawn_connection, ConnectionEvent, ConnectionHandle, ConnectionRole};
use crate::discovery::{local_addresses, DiscoveryEvent, DiscoveryService};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::protocol::{Announcement, Message};
use crate::registry::{Peer, SharedRegistry};
use crate::server::{AcceptedConnection, SessionServer};
use crate::types::{ControlMode, PointF, SyncMode, Transform, WindowRect};

/// How long shutdown waits for the goodbye frames to flush
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands the application sends to the manager
#[derive(Debug, Clone)]
pub enum Command {
    /// Start a synchronized session with a connected peer
    SynchronizeWith { peer_id: u16 },
    /// Start a synchronized session with the instance serving this port,
    /// connecting first if necessary (local mode only)
    SynchronizeWithPort { port: u16 },
    /// Leave the synchronized session with one peer
    StopSynchronizeWith { peer_id: u16 },
    /// Leave all synchronized sessions
    StopSynchronizeAll,
    /// Announce a new window title to all connected peers
    SendTitle { title: String },
    /// Mirror the current view transform to synchronized peers
    SendTransform {
        view: Transform,
        image: Transform,
        canvas: PointF,
    },
    /// Mirror the window geometry to synchronized peers
    SendPosition {
        rect: WindowRect,
        opacity: bool,
        overlaid: bool,
    },
    /// Mirror a file navigation step to synchronized peers
    SendNewFile { op: i16, filename: String },
    /// Push an encoded image to synchronized peers
    SendNewImage { title: String, data: Bytes },
    /// Start or stop the LAN server (and its announcements)
    StartServer { enabled: bool },
    /// Connect to a specific host without waiting for discovery
    ConnectToHost { address: IpAddr, port: u16 },
    /// Answer a permission request from a remote-control peer
    SetPermission { peer_id: u16, allowed: bool },
    /// Announce a remote-control mode change; resets all granted
    /// permissions
    SetMode { mode: ControlMode },
    /// Tell same-machine peers to quit along with this instance
    SendQuit,
    /// Wave goodbye to every connected peer, synchronized or not
    SendGoodbye,
    /// Stop the manager
    Shutdown,
}

/// Outcome of a spawned outbound connect
#[derive(Debug)]
enum DialOutcome {
    Connected {
        stream: TcpStream,
        remote: SocketAddr,
        client_name: String,
        sync_pending: bool,
    },
    Failed {
        remote: SocketAddr,
        error: std::io::Error,
        probe: bool,
    },
}

/// Manager-side state of one connection
#[derive(Debug)]
struct ConnState {
    handle: ConnectionHandle,
    /// Greeting completed, peer is in the registry
    ready: bool,
    /// Instance name learned from discovery, empty otherwise
    client_name: String,
    /// Send a synchronize as soon as the connection allows it
    sync_pending: bool,
    /// This application granted the peer control (remote-control mode)
    permission_granted: bool,
    /// What the peer answered to our permission request
    peer_allowed: Option<bool>,
}

/// The per-instance synchronization actor
pub struct SyncManager {
    mode: SyncMode,
    config: SyncConfig,
    title: String,
    registry: SharedRegistry,
    events: broadcast::Sender<SyncEvent>,
    commands: mpsc::UnboundedReceiver<Command>,

    conns: HashMap<u16, ConnState>,
    next_id: u16,
    dialing: HashSet<SocketAddr>,

    server: Option<SessionServer>,
    discovery: Option<DiscoveryService>,

    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    accept_tx: mpsc::UnboundedSender<AcceptedConnection>,
    accept_rx: mpsc::UnboundedReceiver<AcceptedConnection>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
    dial_rx: mpsc::UnboundedReceiver<DialOutcome>,
}

impl SyncManager {
    /// Build a manager and bring up its mode's sockets.
    ///
    /// Socket failures degrade instead of failing construction: an
    /// instance without a server can still join sessions outbound, and
    /// one without discovery can still be connected to directly. Each
    /// degradation is reported with an info event.
    pub async fn new(
        mode: SyncMode,
        config: SyncConfig,
        registry: SharedRegistry,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();

        let title = config.title.clone();
        let mut manager = Self {
            mode,
            config,
            title,
            registry,
            events,
            commands,
            conns: HashMap::new(),
            next_id: 1,
            dialing: HashSet::new(),
            server: None,
            discovery: None,
            conn_tx,
            conn_rx,
            accept_tx,
            accept_rx,
            discovery_tx,
            discovery_rx,
            dial_tx,
            dial_rx,
        };

        match mode {
            SyncMode::Local => manager.start_local().await,
            SyncMode::Lan | SyncMode::RemoteControl => manager.start_lan_discovery().await,
        }
        manager
    }

    /// Port of the running server, zero if none.
    pub fn server_port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port()).unwrap_or(0)
    }

    /// Drive the manager until shutdown.
    pub async fn run(&mut self) {
        info!(mode = %self.mode, "Sync manager running");
        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => {
                    match maybe_cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(event) = self.conn_rx.recv() => self.handle_connection_event(event),
                Some(accepted) = self.accept_rx.recv() => self.handle_accepted(accepted),
                Some(outcome) = self.dial_rx.recv() => self.handle_dial_outcome(outcome),
                Some(found) = self.discovery_rx.recv() => self.handle_host_found(found),
            }
        }
        self.shutdown().await;
        info!("Sync manager stopped");
    }

    async fn start_local(&mut self) {
        let range = self.config.local_port_range.clone();
        match SessionServer::bind_local(range, self.accept_tx.clone()).await {
            Ok(server) => {
                let port = server.port();
                self.server = Some(server);
                self.emit(SyncEvent::ServerPortChanged { port });
            }
            Err(e) => {
                warn!(error = %e, "Could not start local server");
                self.emit(SyncEvent::info(
                    "Local synchronization limited: no free server port",
                ));
            }
        }
        self.probe_local_range();
    }

    async fn start_lan_discovery(&mut self) {
        let ports = match self.mode {
            SyncMode::RemoteControl => {
                self.config.rc_discovery_port..=self.config.rc_discovery_port
            }
            _ => self.config.discovery_port_range.clone(),
        };
        let bound = DiscoveryService::bind(
            ports,
            local_addresses(),
            self.config.broadcast_interval,
        )
        .await;
        match bound {
            Ok(mut service) => {
                service.start_listening(self.discovery_tx.clone());
                self.discovery = Some(service);
            }
            Err(e) => {
                warn!(error = %e, "Could not bind discovery socket");
                self.emit(SyncEvent::info("LAN discovery unavailable"));
            }
        }
    }

    /// Dial every other port in the local scan range to find siblings.
    fn probe_local_range(&mut self) {
        let own = self.server_port();
        for port in self.config.local_port_range.clone() {
            if port == own {
                continue;
            }
            self.dial(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                String::new(),
                false,
                true,
            );
        }
    }

    /// Spawn an outbound connect; the outcome comes back through the
    /// dial channel. Duplicate dials to an address already in flight are
    /// dropped.
    fn dial(&mut self, address: IpAddr, port: u16, client_name: String, sync_pending: bool, probe: bool) {
        let remote = SocketAddr::new(address, port);
        if !self.dialing.insert(remote) {
            trace!(%remote, "Dial already in flight");
            return;
        }
        let outcome_tx = self.dial_tx.clone();
        tokio::spawn(async move {
            let outcome = match TcpStream::connect(remote).await {
                Ok(stream) => DialOutcome::Connected {
                    stream,
                    remote,
                    client_name,
                    sync_pending,
                },
                Err(error) => DialOutcome::Failed {
                    remote,
                    error,
                    probe,
                },
            };
            let _ = outcome_tx.send(outcome);
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SynchronizeWith { peer_id } => {
                if let Err(e) = self.synchronize_with(peer_id) {
                    warn!(peer_id, error = %e, "Synchronize failed");
                }
            }
            Command::SynchronizeWithPort { port } => self.synchronize_with_port(port),
            Command::StopSynchronizeWith { peer_id } => self.stop_synchronize_with(peer_id),
            Command::StopSynchronizeAll => self.stop_synchronize_all(),
            Command::SendTitle { title } => self.send_title(title),
            Command::SendTransform {
                view,
                image,
                canvas,
            } => self.broadcast_to_synchronized(Message::Transform {
                view,
                image,
                canvas,
            }),
            Command::SendPosition {
                rect,
                opacity,
                overlaid,
            } => self.broadcast_to_synchronized(Message::Position {
                rect,
                opacity,
                overlaid,
            }),
            Command::SendNewFile { op, filename } => {
                self.broadcast_to_synchronized(Message::NewFile { op, filename })
            }
            Command::SendNewImage { title, data } => self.send_new_image(title, data),
            Command::StartServer { enabled } => self.set_server_enabled(enabled).await,
            Command::ConnectToHost { address, port } => {
                if self.registry.lock().already_connected_to(address, port) {
                    debug!(%address, port, "Already connected to this host");
                } else {
                    self.dial(address, port, String::new(), false, false);
                }
            }
            Command::SetPermission { peer_id, allowed } => self.set_permission(peer_id, allowed),
            Command::SetMode { mode } => self.set_mode(mode),
            Command::SendQuit => self.send_quit(),
            Command::SendGoodbye => self.send_goodbye(),
            // Handled by the run loop before dispatch.
            Command::Shutdown => {}
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn_id, message } => self.handle_message(conn_id, message),
            ConnectionEvent::Closed { conn_id } => self.drop_connection(conn_id, false),
        }
    }

    fn handle_accepted(&mut self, accepted: AcceptedConnection) {
        self.admit(
            accepted.stream,
            accepted.remote,
            ConnectionRole::Inbound,
            String::new(),
            false,
        );
    }

    fn handle_dial_outcome(&mut self, outcome: DialOutcome) {
        match outcome {
            DialOutcome::Connected {
                stream,
                remote,
                client_name,
                sync_pending,
            } => {
                self.dialing.remove(&remote);
                self.admit(
                    stream,
                    remote,
                    ConnectionRole::Outbound,
                    client_name,
                    sync_pending,
                );
            }
            DialOutcome::Failed {
                remote,
                error,
                probe,
            } => {
                self.dialing.remove(&remote);
                if probe {
                    trace!(%remote, error = %error, "Probe found no instance");
                } else {
                    debug!(%remote, error = %error, "Outbound connection failed");
                    self.emit(SyncEvent::info(format!("Could not connect to {}", remote)));
                }
            }
        }
    }

    fn handle_host_found(&mut self, found: DiscoveryEvent) {
        let DiscoveryEvent::HostFound {
            address,
            server_port,
            client_name,
        } = found;
        if self.registry.lock().already_connected_to(address, server_port) {
            trace!(%address, server_port, "Announced host already connected");
            return;
        }
        debug!(%address, server_port, name = %client_name, "Connecting to announced host");
        self.dial(address, server_port, client_name, false, false);
    }

    /// Admit a socket: spawn its tasks, send our greeting, track it.
    fn admit(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        role: ConnectionRole,
        client_name: String,
        sync_pending: bool,
    ) {
        let id = self.alloc_id();
        let handle = spawn_connection(id, stream, remote, role, self.conn_tx.clone());
        handle.send(Message::Greeting {
            title: self.title.clone(),
            server_port: self.server_port(),
        });
        self.conns.insert(
            id,
            ConnState {
                handle,
                ready: false,
                client_name,
                sync_pending,
                permission_granted: false,
                peer_allowed: None,
            },
        );
        debug!(conn_id = id, %remote, %role, "Connection admitted");
    }

    /// Next free connection id; zero is reserved and live ids are skipped.
    fn alloc_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if id != 0 && !self.conns.contains_key(&id) {
                return id;
            }
        }
    }

    fn handle_message(&mut self, conn_id: u16, message: Message) {
        self.registry.lock().touch(conn_id);

        // The remote-control gate: until the link carries a grant, only
        // identity, permission, mode, and farewell traffic is honored.
        // Session membership, server switches, and every state change
        // stay outside.
        if self.mode == SyncMode::RemoteControl
            && !self.rc_link_granted(conn_id)
            && !matches!(
                message,
                Message::Greeting { .. }
                    | Message::Title { .. }
                    | Message::PermissionRequest
                    | Message::Permission { .. }
                    | Message::ModeChange { .. }
                    | Message::GoodBye
            )
        {
            debug!(
                conn_id,
                kind = message.kind_name(),
                "Dropping message, peer has no permission"
            );
            return;
        }

        match message {
            Message::Greeting { title, server_port } => {
                self.on_greeting(conn_id, title, server_port)
            }
            Message::Synchronize => self.on_synchronize(conn_id),
            Message::SynchronizeList { ports } => self.on_synchronize_list(conn_id, ports),
            Message::StopSynchronize => self.on_stop_synchronize(conn_id),
            Message::Title { title } => self.on_title(conn_id, title),
            Message::Transform {
                view,
                image,
                canvas,
            } => {
                if self.from_synchronized(conn_id, "transform") {
                    self.emit(SyncEvent::TransformReceived {
                        view,
                        image,
                        canvas,
                    });
                }
            }
            Message::Position {
                rect,
                opacity,
                overlaid,
            } => {
                if self.from_synchronized(conn_id, "position") {
                    self.emit(SyncEvent::PositionReceived {
                        rect,
                        opacity,
                        overlaid,
                    });
                }
            }
            Message::NewFile { op, filename } => {
                if self.from_synchronized(conn_id, "new-file") {
                    self.emit(SyncEvent::NewFileReceived { op, filename });
                }
            }
            Message::NewImage { title, data } => {
                if self.from_synchronized(conn_id, "new-image") {
                    self.emit(SyncEvent::ImageReceived { title, data });
                }
            }
            Message::UpcomingImage { title } => {
                if self.from_synchronized(conn_id, "upcoming-image") {
                    self.emit(SyncEvent::UpcomingImageReceived { title });
                }
            }
            Message::SwitchServer { addr, port } => self.on_switch_server(conn_id, addr, port),
            Message::PermissionRequest => self.on_permission_request(conn_id),
            Message::Permission { allowed } => self.on_permission(conn_id, allowed),
            Message::ModeChange { mode } => self.on_mode_change(conn_id, mode),
            Message::GoodBye => {
                debug!(conn_id, "Peer said goodbye");
                self.drop_connection(conn_id, false);
            }
            Message::Quit => {
                if self.mode == SyncMode::Local {
                    info!(conn_id, "Peer requested quit");
                    self.emit(SyncEvent::QuitReceived);
                } else {
                    debug!(conn_id, "Ignoring quit outside local mode");
                }
            }
        }
    }

    fn on_greeting(&mut self, conn_id: u16, title: String, server_port: u16) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        if conn.ready {
            debug!(conn_id, "Duplicate greeting ignored");
            return;
        }
        let remote_ip = conn.handle.remote().ip();
        let client_name = conn.client_name.clone();

        // One connection per instance: if we already talk to this
        // address and server, the newer attempt loses.
        if server_port != 0
            && self
                .registry
                .lock()
                .already_connected_to(remote_ip, server_port)
        {
            debug!(
                conn_id,
                %remote_ip,
                server_port,
                "Duplicate connection to known instance, rejecting"
            );
            self.drop_connection(conn_id, true);
            return;
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.ready = true;
        }
        let peer =
            Peer::new(conn_id, remote_ip, server_port, title).with_client_name(client_name);
        self.registry.lock().add_peer(peer);
        debug!(conn_id, %remote_ip, server_port, "Handshake complete");
        self.emit_peer_list();

        let pending = self
            .conns
            .get_mut(&conn_id)
            .map(|c| std::mem::take(&mut c.sync_pending))
            .unwrap_or(false);
        if pending {
            if let Err(e) = self.synchronize_with(conn_id) {
                warn!(conn_id, error = %e, "Deferred synchronize failed");
            }
        }
    }

    fn on_synchronize(&mut self, conn_id: u16) {
        if !self.conn_ready(conn_id) {
            debug!(conn_id, "Synchronize before greeting, ignoring");
            return;
        }
        // Reply with the members we had before this peer joined.
        let ports = self.registry.lock().synchronized_server_ports();
        if let Some(conn) = self.conns.get(&conn_id) {
            conn.handle.send(Message::SynchronizeList { ports });
        }
        if self.mark_synchronized(conn_id) {
            self.announce_synchronized(conn_id);
            self.membership_changed(true);
            self.emit_peer_list();
        }
    }

    fn on_synchronize_list(&mut self, conn_id: u16, ports: Vec<u16>) {
        if !self.conn_ready(conn_id) {
            debug!(conn_id, "Synchronize-list before greeting, ignoring");
            return;
        }
        if self.mark_synchronized(conn_id) {
            self.announce_synchronized(conn_id);
            self.membership_changed(true);
            self.emit_peer_list();
        }
        // Transitive join: bare ports are only meaningful on loopback.
        if self.mode == SyncMode::Local {
            let own = self.server_port();
            for port in ports {
                if port != own {
                    self.synchronize_with_port(port);
                }
            }
        } else if !ports.is_empty() {
            debug!(conn_id, ?ports, "Ignoring synchronize-list ports off loopback");
        }
    }

    fn on_stop_synchronize(&mut self, conn_id: u16) {
        let changed = {
            let mut registry = self.registry.lock();
            let was = registry
                .peer_by_id(conn_id)
                .map_or(false, |p| p.is_synchronized());
            if was {
                registry.set_synchronized(conn_id, false);
            }
            was
        };
        if changed {
            info!(conn_id, "Peer left the synchronized session");
            self.membership_changed(true);
            self.emit_peer_list();
        }
    }

    fn on_title(&mut self, conn_id: u16, title: String) {
        if self.registry.lock().set_title(conn_id, title.clone()) {
            self.emit(SyncEvent::TitleReceived {
                peer_id: conn_id,
                title,
            });
            self.emit_peer_list();
        }
    }

    fn on_switch_server(&mut self, conn_id: u16, address: IpAddr, port: u16) {
        if !self.mode.is_lan() {
            debug!(conn_id, %address, port, "Ignoring switch-server off the LAN");
            return;
        }
        let was_synchronized = self
            .registry
            .lock()
            .peer_by_id(conn_id)
            .map_or(false, |p| p.is_synchronized());
        info!(conn_id, %address, port, "Peer asked us to switch servers");
        self.emit(SyncEvent::info(format!(
            "Switching to server {}:{}",
            address, port
        )));
        self.drop_connection(conn_id, true);
        self.dial(address, port, String::new(), was_synchronized, false);
    }

    fn on_permission_request(&mut self, conn_id: u16) {
        if self.mode != SyncMode::RemoteControl {
            debug!(conn_id, mode = %self.mode, "Ignoring permission request in this mode");
            return;
        }
        let title = self
            .registry
            .lock()
            .peer_by_id(conn_id)
            .map(|p| p.title.clone())
            .unwrap_or_default();
        info!(conn_id, %title, "Peer asks for control permission");
        self.emit(SyncEvent::PermissionRequested {
            peer_id: conn_id,
            title,
        });
    }

    fn on_permission(&mut self, conn_id: u16, allowed: bool) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        // Only answers to a request of ours count; an uninvited grant
        // must not open the gate.
        if !conn.sync_pending && conn.peer_allowed.is_none() {
            debug!(conn_id, allowed, "Ignoring permission answer we never asked for");
            return;
        }
        conn.peer_allowed = Some(allowed);
        let pending = std::mem::take(&mut conn.sync_pending);
        if allowed {
            debug!(conn_id, "Peer granted control permission");
            if pending {
                conn.handle.send(Message::Synchronize);
            }
        } else {
            info!(conn_id, "Peer denied control permission");
            self.emit(SyncEvent::info("Remote control request was denied"));
        }
    }

    fn on_mode_change(&mut self, conn_id: u16, code: i32) {
        let Some(mode) = ControlMode::from_code(code) else {
            debug!(conn_id, code, "Unknown control mode, dropping");
            return;
        };
        // The peer's grants no longer stand; we have to ask again.
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.peer_allowed = None;
        }
        info!(conn_id, %mode, "Peer changed control mode");
        self.emit(SyncEvent::ModeChanged { mode });
    }

    fn synchronize_with(&mut self, peer_id: u16) -> SyncResult<()> {
        let conn = self
            .conns
            .get_mut(&peer_id)
            .ok_or(SyncError::PeerNotFound(peer_id))?;
        if !conn.ready {
            return Err(SyncError::Handshake(format!(
                "connection {} is still greeting",
                peer_id
            )));
        }
        if self.mode == SyncMode::RemoteControl && conn.peer_allowed != Some(true) {
            conn.sync_pending = true;
            conn.handle.send(Message::PermissionRequest);
            debug!(peer_id, "Requested control permission");
            return Ok(());
        }
        conn.handle.send(Message::Synchronize);
        debug!(peer_id, "Synchronize requested");
        Ok(())
    }

    fn synchronize_with_port(&mut self, port: u16) {
        let existing = {
            let registry = self.registry.lock();
            registry
                .peer_by_server_port(port)
                .map(|p| (p.id, p.is_synchronized()))
        };
        match existing {
            Some((_, true)) => {}
            Some((id, false)) => {
                if let Err(e) = self.synchronize_with(id) {
                    warn!(port, error = %e, "Synchronize failed");
                }
            }
            None if self.mode == SyncMode::Local => {
                if port == self.server_port() {
                    return;
                }
                self.dial(IpAddr::V4(Ipv4Addr::LOCALHOST), port, String::new(), true, false);
            }
            None => warn!(port, "No connected peer serves this port"),
        }
    }

    fn stop_synchronize_with(&mut self, peer_id: u16) {
        let was_synchronized = {
            let mut registry = self.registry.lock();
            let was = registry
                .peer_by_id(peer_id)
                .map_or(false, |p| p.is_synchronized());
            if was {
                registry.set_synchronized(peer_id, false);
            }
            was
        };
        if !was_synchronized {
            debug!(peer_id, "Peer was not synchronized");
            return;
        }
        if let Some(conn) = self.conns.get(&peer_id) {
            conn.handle.send(Message::StopSynchronize);
        }
        info!(peer_id, "Left synchronized session");
        self.membership_changed(true);
        self.emit_peer_list();
    }

    fn stop_synchronize_all(&mut self) {
        let ids = self.registry.lock().synchronized_ids();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            if let Some(conn) = self.conns.get(id) {
                conn.handle.send(Message::StopSynchronize);
            }
        }
        self.registry.lock().clear_synchronized();
        info!(peers = ids.len(), "Left all synchronized sessions");
        self.membership_changed(false);
        self.emit_peer_list();
    }

    fn send_title(&mut self, title: String) {
        self.title = title.clone();
        for conn in self.conns.values() {
            if conn.ready {
                conn.handle.send(Message::Title {
                    title: title.clone(),
                });
            }
        }
    }

    fn send_new_image(&mut self, title: String, data: Bytes) {
        if !self.mode.is_lan() {
            debug!("Image push only applies to the LAN modes");
            return;
        }
        let ids = self.registry.lock().synchronized_ids();
        for id in ids {
            if let Some(conn) = self.conns.get(&id) {
                conn.handle.send(Message::UpcomingImage {
                    title: title.clone(),
                });
                conn.handle.send(Message::NewImage {
                    title: title.clone(),
                    data: data.clone(),
                });
            }
        }
    }

    fn broadcast_to_synchronized(&mut self, message: Message) {
        let ids = self.registry.lock().synchronized_ids();
        for id in ids {
            if let Some(conn) = self.conns.get(&id) {
                conn.handle.send(message.clone());
            }
        }
    }

    async fn set_server_enabled(&mut self, enabled: bool) {
        if !self.mode.is_lan() {
            debug!("The local server is managed automatically");
            return;
        }
        if enabled {
            if self.server.is_some() {
                return;
            }
            match SessionServer::bind_lan(self.config.lan_server_port, self.accept_tx.clone())
                .await
            {
                Ok(server) => {
                    let port = server.port();
                    self.server = Some(server);
                    info!(port, "LAN server started");
                    self.emit(SyncEvent::ServerPortChanged { port });
                    if let Some(discovery) = &mut self.discovery {
                        discovery.start_announcing(Announcement {
                            server_port: port,
                            client_name: self.config.client_name.clone(),
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Could not start LAN server");
                    self.emit(SyncEvent::info("Could not start LAN server"));
                }
            }
        } else {
            self.stop_synchronize_all();
            if let Some(discovery) = &mut self.discovery {
                discovery.stop_announcing();
            }
            if let Some(server) = self.server.take() {
                server.shutdown();
                info!("LAN server stopped");
                self.emit(SyncEvent::ServerPortChanged { port: 0 });
            }
        }
    }

    fn set_permission(&mut self, peer_id: u16, allowed: bool) {
        if self.mode != SyncMode::RemoteControl {
            debug!(peer_id, "Permissions only apply to remote control");
            return;
        }
        match self.conns.get_mut(&peer_id) {
            Some(conn) => {
                conn.permission_granted = allowed;
                conn.handle.send(Message::Permission { allowed });
                info!(peer_id, allowed, "Answered permission request");
            }
            None => warn!(peer_id, "Cannot set permission, peer gone"),
        }
    }

    fn set_mode(&mut self, mode: ControlMode) {
        if self.mode != SyncMode::RemoteControl {
            debug!("Mode changes only apply to remote control");
            return;
        }
        // A mode switch voids every grant; peers must ask again.
        for conn in self.conns.values_mut() {
            conn.permission_granted = false;
        }
        let code = mode.code();
        for conn in self.conns.values() {
            if conn.ready {
                conn.handle.send(Message::ModeChange { mode: code });
            }
        }
        info!(%mode, "Control mode changed, permissions reset");
    }

    fn send_quit(&mut self) {
        if self.mode != SyncMode::Local {
            debug!("Quit messages only apply to local mode");
            return;
        }
        for conn in self.conns.values() {
            if conn.ready {
                conn.handle.send(Message::Quit);
            }
        }
    }

    /// Goodbye goes to every connected peer, not just synchronized ones.
    /// Peers close on receipt, so the connections drain on their own.
    fn send_goodbye(&mut self) {
        for conn in self.conns.values() {
            if conn.ready {
                conn.handle.send(Message::GoodBye);
            }
        }
    }

    /// Remove a connection and its peer, with all follow-up traffic.
    fn drop_connection(&mut self, conn_id: u16, polite: bool) {
        let Some(mut state) = self.conns.remove(&conn_id) else {
            return;
        };
        if polite && state.ready {
            state.handle.send(Message::GoodBye);
        }
        state.handle.close();

        let removed = self.registry.lock().remove_peer(conn_id);
        match removed {
            Some(peer) => {
                info!(conn_id, title = %peer.title, "Peer disconnected");
                let shown = if peer.title.is_empty() {
                    peer.address.to_string()
                } else {
                    peer.title.clone()
                };
                self.emit(SyncEvent::info(format!("{} disconnected", shown)));
                self.emit_peer_list();
                if peer.is_synchronized() {
                    self.membership_changed(true);
                }
            }
            None => debug!(conn_id, "Connection closed before handshake completed"),
        }
    }

    /// Report the new membership and, if asked, push the fresh list to
    /// everyone still in the session.
    fn membership_changed(&mut self, rebroadcast: bool) {
        let (ports, ids) = {
            let registry = self.registry.lock();
            (
                registry.synchronized_server_ports(),
                registry.synchronized_ids(),
            )
        };
        if rebroadcast {
            for id in &ids {
                if let Some(conn) = self.conns.get(id) {
                    conn.handle.send(Message::SynchronizeList {
                        ports: ports.clone(),
                    });
                }
            }
        }
        self.emit(SyncEvent::SynchronizedPeersChanged { ports });
    }

    /// Flip a peer to synchronized. Returns false if it already was, so
    /// callers only announce real changes (and list rebroadcasts cannot
    /// ping-pong between two instances).
    fn mark_synchronized(&mut self, conn_id: u16) -> bool {
        let mut registry = self.registry.lock();
        let flip = registry
            .peer_by_id(conn_id)
            .map_or(false, |p| !p.is_synchronized());
        if flip {
            registry.set_synchronized(conn_id, true);
        }
        flip
    }

    fn announce_synchronized(&mut self, conn_id: u16) {
        let title = self
            .registry
            .lock()
            .peer_by_id(conn_id)
            .map(|p| p.title.clone())
            .unwrap_or_default();
        info!(conn_id, %title, "Peer synchronized");
        self.emit(SyncEvent::info(format!("Connected with {}", title)));
    }

    fn conn_ready(&self, conn_id: u16) -> bool {
        self.conns.get(&conn_id).map_or(false, |c| c.ready)
    }

    /// A remote-control link carries a grant once this side allowed the
    /// peer, or the peer allowed a request of ours; its replies then
    /// complete the session we asked for.
    fn rc_link_granted(&self, conn_id: u16) -> bool {
        self.conns.get(&conn_id).map_or(false, |c| {
            c.permission_granted || c.peer_allowed == Some(true)
        })
    }

    fn from_synchronized(&self, conn_id: u16, kind: &str) -> bool {
        let synchronized = self
            .registry
            .lock()
            .peer_by_id(conn_id)
            .map_or(false, |p| p.is_synchronized());
        if !synchronized {
            debug!(conn_id, kind, "Dropping message from unsynchronized peer");
        }
        synchronized
    }

    fn emit(&self, event: SyncEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.events.send(event);
    }

    fn emit_peer_list(&self) {
        let peers = self
            .registry
            .lock()
            .snapshots(self.config.liveness_window);
        self.emit(SyncEvent::PeerListChanged { peers });
    }

    async fn shutdown(&mut self) {
        info!("Shutting down sync manager");
        self.send_goodbye();
        let mut writers = Vec::new();
        for (_, mut state) in self.conns.drain() {
            if let Some(writer) = state.handle.close() {
                writers.push(writer);
            }
        }
        // The writers still hold the queued goodbyes and the runtime
        // ends right after this function. Await the flush, with a bound
        // against stalled sockets.
        let drain = async {
            for writer in writers {
                let _ = writer.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, drain)
            .await
            .is_err()
        {
            warn!("Some goodbye messages did not flush before shutdown");
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop_listening();
            discovery.stop_announcing();
        }
        self.registry.lock().clear();
        self.emit_peer_list();
        self.emit(SyncEvent::SynchronizedPeersChanged { ports: Vec::new() });
    }
}
