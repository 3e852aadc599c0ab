//! Events the synchronization worker reports to the application
//!
//! Everything the viewer needs to react to arrives as a [`SyncEvent`] on a
//! broadcast channel: peer list updates, mirrored view state from
//! synchronized peers, permission requests, and transient status text.
//!
//! Consumers that fall behind lose the oldest events; every event carries
//! full state where that matters (peer lists, port lists) so a lagging UI
//! recovers by applying the latest one.

use std::time::Duration;

use bytes::Bytes;

use crate::registry::PeerSnapshot;
use crate::types::{ControlMode, PointF, Transform, WindowRect};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default display time for transient info messages.
const INFO_DISPLAY_TIME: Duration = Duration::from_millis(3000);

/// Events emitted by the synchronization worker
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The set of connected peers changed
    PeerListChanged {
        /// Current peer list
        peers: Vec<PeerSnapshot>,
    },

    /// The synchronized session membership changed
    SynchronizedPeersChanged {
        /// Server ports of all synchronized peers
        ports: Vec<u16>,
    },

    /// A synchronized peer sent a view transform
    TransformReceived {
        view: Transform,
        image: Transform,
        canvas: PointF,
    },

    /// A synchronized peer sent its window geometry
    PositionReceived {
        rect: WindowRect,
        opacity: bool,
        overlaid: bool,
    },

    /// A synchronized peer navigated to another file
    NewFileReceived { op: i16, filename: String },

    /// A synchronized peer pushed an encoded image
    ImageReceived { title: String, data: Bytes },

    /// A peer announced the title of an image it is about to push
    UpcomingImageReceived { title: String },

    /// A peer's window title changed
    TitleReceived { peer_id: u16, title: String },

    /// A remote-control peer asks to control this instance
    ///
    /// The application answers with a set-permission command.
    PermissionRequested { peer_id: u16, title: String },

    /// A peer announced a remote-control mode change
    ModeChanged { mode: ControlMode },

    /// The TCP server is reachable under a new port
    ServerPortChanged { port: u16 },

    /// A same-machine peer quit; this instance should shut down too
    QuitReceived,

    /// Transient status text for the viewer's overlay
    Info {
        message: String,
        display_time: Duration,
    },
}

impl SyncEvent {
    /// Build an info event with the default display time.
    pub fn info(message: impl Into<String>) -> Self {
        SyncEvent::Info {
            message: message.into(),
            display_time: INFO_DISPLAY_TIME,
        }
    }

    /// Short name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::PeerListChanged { .. } => "peer-list-changed",
            SyncEvent::SynchronizedPeersChanged { .. } => "synchronized-peers-changed",
            SyncEvent::TransformReceived { .. } => "transform-received",
            SyncEvent::PositionReceived { .. } => "position-received",
            SyncEvent::NewFileReceived { .. } => "new-file-received",
            SyncEvent::ImageReceived { .. } => "image-received",
            SyncEvent::UpcomingImageReceived { .. } => "upcoming-image-received",
            SyncEvent::TitleReceived { .. } => "title-received",
            SyncEvent::PermissionRequested { .. } => "permission-requested",
            SyncEvent::ModeChanged { .. } => "mode-changed",
            SyncEvent::ServerPortChanged { .. } => "server-port-changed",
            SyncEvent::QuitReceived => "quit-received",
            SyncEvent::Info { .. } => "info",
        }
    }

    /// Peer id this event refers to, if any
    pub fn peer_id(&self) -> Option<u16> {
        match self {
            SyncEvent::TitleReceived { peer_id, .. } => Some(*peer_id),
            SyncEvent::PermissionRequested { peer_id, .. } => Some(*peer_id),
            _ => None,
        }
    }
}
