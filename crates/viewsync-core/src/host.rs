//! The sync worker host
//!
//! Viewer applications are rarely async; their UI loop must never touch
//! the network. `SyncHost` runs the whole subsystem on one dedicated
//! thread with its own single-threaded runtime and exposes a plain
//! synchronous handle:
//!
//! ```text
//!  application thread              sync thread
//!  ┌──────────────┐   commands   ┌──────────────────────┐
//!  │   SyncHost   │ ───────────► │ runtime ─ SyncManager │
//!  │              │ ◄─────────── │                      │
//!  └──────────────┘    events    └──────────────────────┘
//! ```
//!
//! Commands are fire and forget. Events come back through a broadcast
//! channel; slow subscribers lose old events rather than stalling the
//! manager. [`SyncHost::start`] returns once the manager has bound its
//! sockets, so the reported server port is immediately valid.

use std::net::IpAddr;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
use crate::manager::{Command, SyncManager};
use crate::registry::{shared_registry, PeerSnapshot, SharedRegistry};
use crate::types::{ControlMode, PointF, SyncMode, Transform, WindowRect};

/// Synchronous handle to the sync subsystem
///
/// Dropping the host shuts the worker down and joins its thread.
pub struct SyncHost {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    registry: SharedRegistry,
    liveness_window: Duration,
    port: u16,
    thread: Option<thread::JoinHandle<()>>,
}

impl SyncHost {
    /// Spawn the worker thread and wait for the manager to come up.
    pub fn start(mode: SyncMode, config: SyncConfig) -> SyncResult<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _keepalive) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (init_tx, init_rx) = std_mpsc::channel::<SyncResult<u16>>();

        let registry = shared_registry();
        let liveness_window = config.liveness_window;
        let thread_registry = registry.clone();
        let thread_events = event_tx.clone();

        let thread = thread::Builder::new()
            .name("viewsync".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(SyncError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let mut manager = SyncManager::new(
                        mode,
                        config,
                        thread_registry,
                        command_rx,
                        thread_events,
                    )
                    .await;
                    let _ = init_tx.send(Ok(manager.server_port()));
                    manager.run().await;
                });
            })?;

        let port = match init_rx.recv() {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SyncError::WorkerGone(
                    "sync thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Self {
            commands: command_tx,
            events: event_tx,
            registry,
            liveness_window,
            port,
            thread: Some(thread),
        })
    }

    /// Receiver for sync events. Each call gets an independent stream
    /// starting at the current position.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Port bound at startup, zero if none. Later changes (the LAN
    /// server starting or stopping) arrive as server-port events.
    pub fn server_port(&self) -> u16 {
        self.port
    }

    /// Current peer list.
    pub fn peer_list(&self) -> Vec<PeerSnapshot> {
        self.registry.lock().snapshots(self.liveness_window)
    }

    /// Start a synchronized session with a connected peer.
    pub fn synchronize_with(&self, peer_id: u16) {
        self.send(Command::SynchronizeWith { peer_id });
    }

    /// Start a synchronized session with the instance serving this
    /// loopback port.
    pub fn synchronize_with_port(&self, port: u16) {
        self.send(Command::SynchronizeWithPort { port });
    }

    /// Leave the synchronized session with one peer.
    pub fn stop_synchronize_with(&self, peer_id: u16) {
        self.send(Command::StopSynchronizeWith { peer_id });
    }

    /// Leave all synchronized sessions.
    pub fn stop_synchronize_all(&self) {
        self.send(Command::StopSynchronizeAll);
    }

    /// Announce a new window title to all connected peers.
    pub fn send_title(&self, title: impl Into<String>) {
        self.send(Command::SendTitle {
            title: title.into(),
        });
    }

    /// Mirror the current view transform to synchronized peers.
    pub fn send_transform(&self, view: Transform, image: Transform, canvas: PointF) {
        self.send(Command::SendTransform {
            view,
            image,
            canvas,
        });
    }

    /// Mirror the window geometry to synchronized peers.
    pub fn send_position(&self, rect: WindowRect, opacity: bool, overlaid: bool) {
        self.send(Command::SendPosition {
            rect,
            opacity,
            overlaid,
        });
    }

    /// Mirror a file navigation step to synchronized peers.
    pub fn send_new_file(&self, op: i16, filename: impl Into<String>) {
        self.send(Command::SendNewFile {
            op,
            filename: filename.into(),
        });
    }

    /// Push an encoded image to synchronized peers.
    pub fn send_new_image(&self, title: impl Into<String>, data: Bytes) {
        self.send(Command::SendNewImage {
            title: title.into(),
            data,
        });
    }

    /// Start or stop the LAN server and its announcements.
    pub fn start_server(&self, enabled: bool) {
        self.send(Command::StartServer { enabled });
    }

    /// Connect to a specific host without waiting for discovery.
    pub fn connect_to_host(&self, address: IpAddr, port: u16) {
        self.send(Command::ConnectToHost { address, port });
    }

    /// Answer a peer's control permission request.
    pub fn set_permission(&self, peer_id: u16, allowed: bool) {
        self.send(Command::SetPermission { peer_id, allowed });
    }

    /// Announce a remote-control mode change to all peers.
    pub fn set_mode(&self, mode: ControlMode) {
        self.send(Command::SetMode { mode });
    }

    /// Tell same-machine peers to quit along with this instance.
    pub fn send_quit(&self) {
        self.send(Command::SendQuit);
    }

    /// Say goodbye to every connected peer without stopping the worker.
    /// `shutdown` already does this; call it directly when the instance
    /// wants to leave the mesh but keep running.
    pub fn send_goodbye(&self) {
        self.send(Command::SendGoodbye);
    }

    /// Stop the worker and wait for it to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Sync worker is gone, dropping command");
        }
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        debug!("Stopping sync worker");
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            warn!("Sync worker panicked");
        }
    }
}

impl Drop for SyncHost {
    fn drop(&mut self) {
        self.stop();
    }
}
