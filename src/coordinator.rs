//! Request coordination
//!
//! Bridges application-level content requests (FindContent / Offer) to
//! transport lifecycles: a handoff response turns into a reader socket
//! whose assembly resolves the request, an accepted offer turns into a
//! writer socket that streams the payload.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::content::{ContentStore, FindContentResponse, OfferResponse, ProtocolController};
use crate::error::{Result, UtpError};
use crate::types::{NetworkId, NodeId};
use crate::utp::multiplexer::UtpMux;

/// Drives content transfers over the uTP multiplexer.
pub struct ContentCoordinator {
    mux: Arc<UtpMux>,
    protocol: Arc<dyn ProtocolController>,
    store: Arc<dyn ContentStore>,
}

impl ContentCoordinator {
    pub fn new(
        mux: Arc<UtpMux>,
        protocol: Arc<dyn ProtocolController>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            mux,
            protocol,
            store,
        }
    }

    /// Fetch the content under `key` from `remote`.
    ///
    /// Inline responses return immediately. A connection-id handoff opens
    /// a reader socket bound to that id and resolves once the peer's
    /// stream is fully assembled, or with empty bytes when the transfer
    /// goes idle or arrives with gaps. Delivered content is written
    /// through to the store.
    pub async fn fetch(&self, remote: NodeId, network: NetworkId, key: &[u8]) -> Result<Bytes> {
        match self.protocol.find_content(remote, key).await? {
            FindContentResponse::Content(content) => {
                self.store.put(network, key, &content);
                Ok(content)
            }
            FindContentResponse::ConnectionId(conn_id) => {
                debug!(%remote, conn_id, "fetch handed off to uTP");
                let handle = self.mux.create_reader(remote, conn_id);
                let idle = Duration::from_millis(self.mux.config().idle_timeout_ms);
                match handle.wait_idle(idle).await {
                    Ok(content) => {
                        if !content.is_empty() {
                            self.store.put(network, key, &content);
                        }
                        Ok(content)
                    }
                    Err(UtpError::IncompleteStream { missing }) => {
                        debug!(%remote, missing, "stream arrived with gaps");
                        Ok(Bytes::new())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Offer the content under `key` to `remote` and stream `payload` if
    /// the peer accepts. Resolves `true` once the peer has acknowledged
    /// the full stream, `false` when the offer is declined.
    pub async fn serve(&self, remote: NodeId, key: &[u8], payload: Bytes) -> Result<bool> {
        match self.protocol.offer(remote, key).await? {
            OfferResponse::Declined => {
                debug!(%remote, "offer declined");
                Ok(false)
            }
            OfferResponse::Accepted(conn_id) => {
                debug!(%remote, conn_id, bytes = payload.len(), "offer accepted, streaming");
                let handle = self.mux.connect_writer(remote, conn_id, payload).await;
                handle.wait().await?;
                Ok(true)
            }
        }
    }

    /// [`serve`](Self::serve) with the payload looked up in the store.
    /// Resolves `false` when the content is not held locally.
    pub async fn serve_stored(
        &self,
        remote: NodeId,
        network: NetworkId,
        key: &[u8],
    ) -> Result<bool> {
        match self.store.get(network, key) {
            Some(payload) => self.serve(remote, key, payload).await,
            None => Ok(false),
        }
    }
}
