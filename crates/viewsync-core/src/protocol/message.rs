//! Sync protocol messages
//!
//! One variant per wire kind. Every TCP connection speaks this protocol,
//! regardless of whether it was made by the local, LAN, or remote-control
//! manager.
//!
//! ## Message Flow
//!
//! ```text
//! Instance A                      Instance B
//!   |                               |
//!   |--- Greeting {title, port} --->|
//!   |<-- Greeting {title, port} ----|
//!   |                               |
//!   |    (user starts syncing)      |
//!   |                               |
//!   |--- Synchronize -------------->|
//!   |<-- SynchronizeList {ports} ---|
//!   |                               |
//!   |--- Transform {..} ----------->|
//!   |--- Position {..} ------------>|
//!   |--- NewFile {..} ------------->|
//!   |    (mirrored while synced)    |
//!   |                               |
//!   |--- GoodBye ------------------>|
//! ```

use std::net::IpAddr;

use bytes::Bytes;

use crate::types::{PointF, Transform, WindowRect};

/// Wire kind codes, one per [`Message`] variant.
pub mod kind {
    pub const GREETING: u8 = 1;
    pub const SYNCHRONIZE: u8 = 2;
    pub const SYNCHRONIZE_LIST: u8 = 3;
    pub const STOP_SYNCHRONIZE: u8 = 4;
    pub const TITLE: u8 = 5;
    pub const TRANSFORM: u8 = 6;
    pub const POSITION: u8 = 7;
    pub const NEW_FILE: u8 = 8;
    pub const NEW_IMAGE: u8 = 9;
    pub const UPCOMING_IMAGE: u8 = 10;
    pub const SWITCH_SERVER: u8 = 11;
    pub const PERMISSION_REQUEST: u8 = 12;
    pub const PERMISSION: u8 = 13;
    pub const MODE_CHANGE: u8 = 14;
    pub const GOODBYE: u8 = 15;
    pub const QUIT: u8 = 16;
}

/// Messages exchanged between connected instances
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First message on every connection, sent by both sides
    ///
    /// Carries the sender's window title and the port its own server
    /// listens on (zero when it runs no server).
    Greeting {
        /// Current window title of the sender
        title: String,
        /// TCP port of the sender's own server, zero if none
        server_port: u16,
    },

    /// Ask the receiver to enter a synchronized session with the sender
    Synchronize,

    /// Server ports of the sender's already-synchronized peers
    ///
    /// Sent as the reply to `Synchronize` and rebroadcast whenever the
    /// membership changes, so remaining members stay informed.
    SynchronizeList {
        /// Server ports, zero entries omitted
        ports: Vec<u16>,
    },

    /// Leave the synchronized session with the receiver
    StopSynchronize,

    /// The sender's window title changed
    Title {
        /// New window title
        title: String,
    },

    /// View state update, mirrored by synchronized peers
    Transform {
        /// World-to-window transform
        view: Transform,
        /// Image-to-world transform
        image: Transform,
        /// Canvas size the transforms are relative to
        canvas: PointF,
    },

    /// Window geometry update
    Position {
        /// New window rectangle in screen coordinates
        rect: WindowRect,
        /// Whether the receiver should enter translucent mode
        opacity: bool,
        /// Whether the windows are stacked on top of each other
        overlaid: bool,
    },

    /// File navigation update
    NewFile {
        /// Operation code, see [`crate::types::file_op`]
        op: i16,
        /// File name the operation refers to
        filename: String,
    },

    /// Encoded image pushed to peers that cannot reach the file itself
    NewImage {
        /// Title shown for the pushed image
        title: String,
        /// Encoded image bytes
        data: Bytes,
    },

    /// Title of an image that is about to be transferred
    UpcomingImage {
        /// Title of the pending image
        title: String,
    },

    /// Ask the receiver to reconnect to a different server
    SwitchServer {
        /// Address of the new server
        addr: IpAddr,
        /// Port of the new server
        port: u16,
    },

    /// Ask the receiver for permission to control it
    PermissionRequest,

    /// Grant or deny a previous permission request
    Permission {
        /// True grants control, false denies it
        allowed: bool,
    },

    /// The sender's remote-control mode changed
    ModeChange {
        /// Wire code, see [`crate::types::ControlMode`]
        mode: i32,
    },

    /// Orderly goodbye; the receiver removes the sender and closes
    GoodBye,

    /// The sender quits; same-machine peers shut down with it
    Quit,
}

impl Message {
    /// Wire kind code of this message
    pub fn kind(&self) -> u8 {
        match self {
            Message::Greeting { .. } => kind::GREETING,
            Message::Synchronize => kind::SYNCHRONIZE,
            Message::SynchronizeList { .. } => kind::SYNCHRONIZE_LIST,
            Message::StopSynchronize => kind::STOP_SYNCHRONIZE,
            Message::Title { .. } => kind::TITLE,
            Message::Transform { .. } => kind::TRANSFORM,
            Message::Position { .. } => kind::POSITION,
            Message::NewFile { .. } => kind::NEW_FILE,
            Message::NewImage { .. } => kind::NEW_IMAGE,
            Message::UpcomingImage { .. } => kind::UPCOMING_IMAGE,
            Message::SwitchServer { .. } => kind::SWITCH_SERVER,
            Message::PermissionRequest => kind::PERMISSION_REQUEST,
            Message::Permission { .. } => kind::PERMISSION,
            Message::ModeChange { .. } => kind::MODE_CHANGE,
            Message::GoodBye => kind::GOODBYE,
            Message::Quit => kind::QUIT,
        }
    }

    /// Short name for log lines
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Greeting { .. } => "greeting",
            Message::Synchronize => "synchronize",
            Message::SynchronizeList { .. } => "synchronize-list",
            Message::StopSynchronize => "stop-synchronize",
            Message::Title { .. } => "title",
            Message::Transform { .. } => "transform",
            Message::Position { .. } => "position",
            Message::NewFile { .. } => "new-file",
            Message::NewImage { .. } => "new-image",
            Message::UpcomingImage { .. } => "upcoming-image",
            Message::SwitchServer { .. } => "switch-server",
            Message::PermissionRequest => "permission-request",
            Message::Permission { .. } => "permission",
            Message::ModeChange { .. } => "mode-change",
            Message::GoodBye => "goodbye",
            Message::Quit => "quit",
        }
    }

    /// True for messages that mutate viewer state on the receiver.
    ///
    /// The remote-control manager drops these until the application has
    /// granted the sending connection permission.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Message::Transform { .. }
                | Message::Position { .. }
                | Message::NewFile { .. }
                | Message::NewImage { .. }
                | Message::UpcomingImage { .. }
        )
    }
}
