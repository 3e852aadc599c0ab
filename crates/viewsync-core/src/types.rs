//! Shared value types
//!
//! Small plain-data types that travel between the viewer application, the
//! sync worker, and the wire: the operating mode of a manager, view
//! transforms, window geometry, and remote-control modes.

use serde::{Deserialize, Serialize};

/// Which variant of the synchronization manager an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncMode {
    /// Same-machine synchronization over loopback, with port scanning
    #[default]
    Local,
    /// LAN synchronization with UDP broadcast discovery
    Lan,
    /// LAN synchronization with a permission gate in front of
    /// state-changing messages
    RemoteControl,
}

impl SyncMode {
    /// True for the two LAN-backed variants
    pub fn is_lan(&self) -> bool {
        matches!(self, SyncMode::Lan | SyncMode::RemoteControl)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Local => write!(f, "local"),
            SyncMode::Lan => write!(f, "lan"),
            SyncMode::RemoteControl => write!(f, "remote-control"),
        }
    }
}

/// Remote-control mode announced by the controlled side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ControlMode {
    /// No remote control active
    #[default]
    Inactive,
    /// The peer steers this instance
    RemoteControl,
    /// This instance mirrors what the peer displays
    RemoteDisplay,
}

impl ControlMode {
    /// Wire code carried in mode-change messages
    pub fn code(&self) -> i32 {
        match self {
            ControlMode::Inactive => 0,
            ControlMode::RemoteControl => 1,
            ControlMode::RemoteDisplay => 2,
        }
    }

    /// Decode a wire code. Unknown codes return `None` and the message is
    /// dropped by the receiver.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ControlMode::Inactive),
            1 => Some(ControlMode::RemoteControl),
            2 => Some(ControlMode::RemoteDisplay),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Inactive => write!(f, "inactive"),
            ControlMode::RemoteControl => write!(f, "remote-control"),
            ControlMode::RemoteDisplay => write!(f, "remote-display"),
        }
    }
}

/// A 3x3 view transform in row-major order.
///
/// Mirrors what the viewer uses for pan/zoom/rotation. The last column is
/// the projective part and stays `(0, 0, 1)` for affine transforms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub m11: f64,
    pub m12: f64,
    pub m13: f64,
    pub m21: f64,
    pub m22: f64,
    pub m23: f64,
    pub m31: f64,
    pub m32: f64,
    pub m33: f64,
}

impl Transform {
    /// The identity transform
    pub const IDENTITY: Transform = Transform {
        m11: 1.0,
        m12: 0.0,
        m13: 0.0,
        m21: 0.0,
        m22: 1.0,
        m23: 0.0,
        m31: 0.0,
        m32: 0.0,
        m33: 1.0,
    };

    /// A pure scaling transform
    pub fn scaling(sx: f64, sy: f64) -> Self {
        Transform {
            m11: sx,
            m22: sy,
            ..Transform::IDENTITY
        }
    }

    /// A pure translation transform
    pub fn translation(dx: f64, dy: f64) -> Self {
        Transform {
            m31: dx,
            m32: dy,
            ..Transform::IDENTITY
        }
    }

    /// All nine coefficients in row-major order
    pub fn coefficients(&self) -> [f64; 9] {
        [
            self.m11, self.m12, self.m13, self.m21, self.m22, self.m23, self.m31, self.m32,
            self.m33,
        ]
    }

    /// Rebuild from nine row-major coefficients
    pub fn from_coefficients(m: [f64; 9]) -> Self {
        Transform {
            m11: m[0],
            m12: m[1],
            m13: m[2],
            m21: m[3],
            m22: m[4],
            m23: m[5],
            m31: m[6],
            m32: m[7],
            m33: m[8],
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

/// A point (or size) in floating-point canvas coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PointF {
    pub x: f64,
    pub y: f64,
}

impl PointF {
    pub fn new(x: f64, y: f64) -> Self {
        PointF { x, y }
    }
}

/// Window geometry in integer screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl WindowRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        WindowRect {
            x,
            y,
            width,
            height,
        }
    }
}

/// Operation codes carried by new-file messages.
///
/// The code is an open-ended step count; these are the values the viewer
/// sends for its standard actions.
pub mod file_op {
    /// Open the named file directly
    pub const OPEN: i16 = 0;
    /// Step to the next file in the folder
    pub const NEXT: i16 = 1;
    /// Step to the previous file in the folder
    pub const PREVIOUS: i16 = -1;
}
