//! Viewsync Core Library
//!
//! Peer synchronization for multi-instance image viewers.
//!
//! ## Overview
//!
//! Viewsync lets several viewer instances mirror each other: pan and zoom
//! one window and the synchronized windows follow, flip to the next image
//! and they flip too. Instances find each other automatically, on the
//! same machine by scanning a loopback port range and across a LAN via
//! UDP broadcast, then talk over a simple framed TCP protocol. A
//! remote-control variant adds a permission gate so one instance can
//! drive another only after its user agreed.
//!
//! ## Core Principles
//!
//! - **No coordinator**: every instance is client and server at once
//! - **UI stays synchronous**: the subsystem runs on its own thread
//!   behind [`SyncHost`]; commands in, events out
//! - **Sessions are explicit**: connected peers exchange nothing until
//!   someone asks to synchronize
//!
//! ## Quick Start
//!
//! ```ignore
//! use viewsync_core::{SyncConfig, SyncEvent, SyncHost, SyncMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = SyncHost::start(SyncMode::Local, SyncConfig::with_title("my viewer"))?;
//!     let mut events = host.subscribe();
//!
//!     // Join every instance already running on this machine.
//!     for peer in host.peer_list() {
//!         host.synchronize_with(peer.id);
//!     }
//!
//!     while let Ok(event) = events.blocking_recv() {
//!         match event {
//!             SyncEvent::TransformReceived { view, .. } => println!("pan/zoom: {:?}", view),
//!             SyncEvent::NewFileReceived { filename, .. } => println!("show {}", filename),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod host;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

// Re-exports
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
pub use host::SyncHost;
pub use manager::{Command, SyncManager};
pub use protocol::{Announcement, FrameCodec, Message, MAX_FRAME_SIZE};
pub use registry::{shared_registry, Peer, PeerRegistry, PeerSnapshot, SharedRegistry};
pub use types::*;
