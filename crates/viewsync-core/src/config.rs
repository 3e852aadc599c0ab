//! Configuration for a synchronization instance.
//!
//! All ports default to the well-known values the wire protocol was built
//! around, but stay configurable so several sessions can coexist on one
//! machine (and so tests can run on disjoint ranges).

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// First port probed by the local (same machine) TCP server scan.
pub const LOCAL_TCP_PORT_START: u16 = 45454;
/// Last port probed by the local TCP server scan.
pub const LOCAL_TCP_PORT_END: u16 = 45484;

/// First UDP port used for LAN discovery broadcasts.
pub const LAN_UDP_PORT_START: u16 = 28566;
/// Last UDP port used for LAN discovery broadcasts.
pub const LAN_UDP_PORT_END: u16 = 28576;

/// Single UDP port used for remote-control discovery.
pub const RC_UDP_PORT: u16 = 28565;

/// Default interval between discovery broadcasts while a server announces.
const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Default window within which a peer counts as active.
const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(5);

/// Configuration for one synchronization instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Window title announced in the greeting and kept fresh via
    /// title-update messages.
    pub title: String,

    /// Stable instance name announced in discovery datagrams. Unlike the
    /// title it does not change while the instance runs.
    pub client_name: String,

    /// Loopback port range scanned by the local variant's TCP server.
    pub local_port_range: RangeInclusive<u16>,

    /// TCP port the LAN server binds on all interfaces. Zero picks an
    /// ephemeral port, which discovery then advertises.
    pub lan_server_port: u16,

    /// UDP port range used for LAN discovery. Announcements are sent to
    /// every port in the range so instances listening on different ports
    /// still hear them.
    pub discovery_port_range: RangeInclusive<u16>,

    /// UDP port used for remote-control discovery.
    pub rc_discovery_port: u16,

    /// Interval between periodic discovery broadcasts.
    pub broadcast_interval: Duration,

    /// A peer counts as active if it sent anything within this window.
    pub liveness_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            client_name: "viewsync".to_string(),
            local_port_range: LOCAL_TCP_PORT_START..=LOCAL_TCP_PORT_END,
            lan_server_port: 0,
            discovery_port_range: LAN_UDP_PORT_START..=LAN_UDP_PORT_END,
            rc_discovery_port: RC_UDP_PORT,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }
}

impl SyncConfig {
    /// Create a config with the given title and defaults for everything else.
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}
