//! Host session seam
//!
//! The transport does not own a socket: datagrams go out through the
//! host's discovery-v5 session layer, which tags them with the uTP
//! protocol id, and come back in via `UtpMux::on_datagram` for every
//! inbound datagram carrying that id.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::NodeId;

/// Datagram egress provided by the host.
#[async_trait]
pub trait HostSession: Send + Sync {
    /// Transmit one datagram to `remote`. The implementation owns
    /// framing, encryption, and the uTP protocol tag.
    async fn send(&self, remote: NodeId, datagram: Vec<u8>) -> Result<()>;
}

/// Session that discards everything. Useful in tests and as a stand-in
/// while a host boots.
pub struct NullSession;

#[async_trait]
impl HostSession for NullSession {
    async fn send(&self, _remote: NodeId, _datagram: Vec<u8>) -> Result<()> {
        Ok(())
    }
}
