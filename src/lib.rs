//! # portal-utp
//!
//! A μTP content transport for Portal-Network-style clients: reliable,
//! LEDBAT-controlled streaming of content payloads (block bodies,
//! receipts, proofs, bytecode) between peers over an unreliable datagram
//! session, for anything too large for a single datagram.
//!
//! ## Features
//!
//! - **BEP-29 wire format**: 20-byte headers, selective-ACK extension
//! - **LEDBAT congestion control**: one-way delay drives the window
//! - **Session-agnostic**: datagrams flow through an injected
//!   [`HostSession`], typically a discv5 TALKREQ channel
//! - **One transfer per connection**: reader sockets reassemble, writer
//!   sockets stream; both resolve a pending handle
//! - **Async**: built on Tokio; per-socket events are serialized
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portal_utp::{ContentCoordinator, MemoryContentStore, NetworkId, NodeId, UtpConfig, UtpMux};
//!
//! # async fn example(
//! #     session: Arc<dyn portal_utp::HostSession>,
//! #     protocol: Arc<dyn portal_utp::ProtocolController>,
//! #     remote: NodeId,
//! # ) -> portal_utp::Result<()> {
//! let mux = UtpMux::new(session, UtpConfig::default());
//! let store = Arc::new(MemoryContentStore::new());
//! let coordinator = ContentCoordinator::new(mux.clone(), protocol, store);
//!
//! // Inbound datagrams tagged with the uTP protocol id go to the mux:
//! // mux.on_datagram(remote, &datagram).await;
//!
//! let content = coordinator
//!     .fetch(remote, NetworkId::HISTORY, b"content-key")
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Modules
pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod types;
pub mod utp;

// Re-exports for convenience
pub use config::UtpConfig;
pub use content::{
    ContentStore, FindContentResponse, MemoryContentStore, OfferResponse, ProtocolController,
};
pub use coordinator::ContentCoordinator;
pub use error::{Result, UtpError};
pub use session::{HostSession, NullSession};
pub use types::{NetworkId, NodeId};
pub use utp::{
    ConnectionState, Packet, PacketType, SelectiveAck, SocketRole, TransferHandle, TransferStats,
    UtpMux, UtpSocket, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
