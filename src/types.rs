//! Core identity types shared across the transport.

use std::fmt;

/// 256-bit node identity from the host discovery layer.
///
/// The transport treats this as opaque: it only needs equality and hashing
/// to key connections, and a compact `Display` for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Generate a random node id (useful for tests and local endpoints).
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(raw: [u8; 32]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First four bytes are enough to tell peers apart in logs
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}..",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Identifier of the sub-protocol a content item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u16);

impl NetworkId {
    /// State network.
    pub const STATE: NetworkId = NetworkId(0x500a);
    /// History network (block bodies, receipts).
    pub const HISTORY: NetworkId = NetworkId(0x500b);
    /// Beacon light-client network.
    pub const BEACON: NetworkId = NetworkId(0x501a);
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}
