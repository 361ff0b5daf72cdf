//! Content database and application-protocol seams
//!
//! The transport moves opaque bytes; what those bytes mean, where they
//! are stored, and how transfers are negotiated (FindContent / Offer)
//! belong to the host application behind these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{NetworkId, NodeId};

/// Opaque content database.
pub trait ContentStore: Send + Sync {
    fn put(&self, network: NetworkId, key: &[u8], value: &[u8]);

    fn get(&self, network: NetworkId, key: &[u8]) -> Option<Bytes>;
}

/// In-memory content store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryContentStore {
    entries: RwLock<HashMap<(NetworkId, Vec<u8>), Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, network: NetworkId, key: &[u8], value: &[u8]) {
        self.entries
            .write()
            .insert((network, key.to_vec()), Bytes::copy_from_slice(value));
    }

    fn get(&self, network: NetworkId, key: &[u8]) -> Option<Bytes> {
        self.entries.read().get(&(network, key.to_vec())).cloned()
    }
}

/// Outcome of a FindContent request.
#[derive(Debug, Clone)]
pub enum FindContentResponse {
    /// The content fit in the response itself
    Content(Bytes),

    /// The peer will stream it over uTP under this connection id
    ConnectionId(u16),
}

/// Outcome of an Offer.
#[derive(Debug, Clone, Copy)]
pub enum OfferResponse {
    /// The peer accepts and will read on this connection id
    Accepted(u16),

    /// The peer already has the content or does not want it
    Declined,
}

/// Application-level request surface the coordinator drives.
#[async_trait]
pub trait ProtocolController: Send + Sync {
    /// Ask `remote` for the content under `key`
    async fn find_content(&self, remote: NodeId, key: &[u8]) -> Result<FindContentResponse>;

    /// Offer the content under `key` to `remote`
    async fn offer(&self, remote: NodeId, key: &[u8]) -> Result<OfferResponse>;
}
