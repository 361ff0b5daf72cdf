//! uTP (Micro Transport Protocol) over a datagram session (BEP 29)
//!
//! A per-connection state machine layering a reliable, LEDBAT-controlled,
//! ACK-driven content stream atop the host's unreliable datagram channel:
//!
//! - `packet`: packet encoding/decoding (20-byte header + extensions)
//! - `congestion`: LEDBAT window control and RTT/RTO estimation
//! - `buffer`: in-flight packet tracking
//! - `reader`: out-of-order reassembly of an inbound content payload
//! - `writer`: chunking and send bookkeeping of an outbound payload
//! - `socket`: one connection, one transfer, one role
//! - `multiplexer`: `(remote, connection_id)` routing over the session

pub mod buffer;
pub mod congestion;
pub mod multiplexer;
pub mod packet;
pub mod reader;
pub mod socket;
pub mod writer;

pub use congestion::LedbatController;
pub use multiplexer::{TransferHandle, UtpMux};
pub use packet::{
    Packet, PacketType, SelectiveAck, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, SACK_BITMAP,
};
pub use reader::ContentReader;
pub use socket::{ConnectionState, SocketRole, TransferStats, UtpSocket};
pub use writer::ContentWriter;
