//! Transport configuration.

use serde::{Deserialize, Serialize};

use crate::utp::packet::MAX_PACKET_SIZE;

/// Configuration for the uTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpConfig {
    /// Initial send window in bytes. The congestion controller moves the
    /// window from here; a timeout collapses it to a single packet.
    pub max_window: u32,

    /// Receive window advertised to the peer (bytes)
    pub recv_window: u32,

    /// A pending fetch resolves empty after this long without progress
    pub idle_timeout_ms: u64,

    /// Consecutive retransmission timeouts tolerated before the
    /// connection is reset
    pub max_timeouts: u32,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            max_window: 64 * MAX_PACKET_SIZE as u32,
            recv_window: 1024 * 1024,
            idle_timeout_ms: 2_000,
            max_timeouts: 5,
        }
    }
}
