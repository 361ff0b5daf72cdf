//! Typed errors for the uTP transport.
//!
//! Local recovery (undecodable datagrams, stale or unknown packets,
//! isolated losses) is handled silently inside the transport; everything
//! here can also surface through a pending transfer handle.

use thiserror::Error;

use crate::types::NodeId;

/// Errors raised by the uTP transport.
#[derive(Debug, Error)]
pub enum UtpError {
    /// Packet header malformed, unknown type/version, or truncated extension
    #[error("malformed packet: {reason}")]
    Decode { reason: String },

    /// Inbound packet with no matching socket and not an expected SYN
    #[error("no connection {conn_id} for peer {remote}")]
    UnknownConnection { remote: NodeId, conn_id: u16 },

    /// Packet arrived on a closed or reset socket
    #[error("connection {conn_id} is terminated")]
    StaleConnection { conn_id: u16 },

    /// FIN observed while the receive buffer still has gaps
    #[error("stream incomplete: missing packet {missing}")]
    IncompleteStream { missing: u16 },

    /// No progress within the retransmission deadline, repeatedly
    #[error("transfer timed out after {attempts} consecutive timeouts")]
    Timeout { attempts: u32 },

    /// Transfer cancelled locally
    #[error("transfer cancelled")]
    Cancelled,

    /// RESET received from the remote peer
    #[error("connection reset by peer")]
    PeerReset,

    /// The host session failed to transmit a datagram
    #[error("session send failed: {0}")]
    Session(String),
}

impl UtpError {
    /// Create a decode error
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Whether the error terminates a transfer (as opposed to a single
    /// dropped datagram the transport absorbs on its own).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::IncompleteStream { .. }
                | Self::Timeout { .. }
                | Self::Cancelled
                | Self::PeerReset
        )
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, UtpError>;
