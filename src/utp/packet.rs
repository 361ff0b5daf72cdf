//! uTP packet encoding/decoding (BEP 29)
//!
//! uTP uses a 20-byte big-endian header followed by optional extensions
//! and payload. The only extension carried here is the selective ACK,
//! a fixed 4-byte bitmask whose bit positions go through a remap table.

use bytes::Bytes;

use crate::error::UtpError;

/// uTP packet header size
pub const HEADER_SIZE: usize = 20;

/// Datagram budget. Matches the discv5 session layer's 1280-byte MTU; the
/// transport never fragments above it.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Maximum application payload per DATA packet
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Bit remap table for the selective ACK extension.
///
/// Offset `i` into the acknowledged range (`ack_nr + 2 + i`) is carried at
/// bit `SACK_BITMAP[i] - 1` of the 32-bit mask. Both directions of the wire
/// format go through this table; peers that do not share it will not
/// interoperate.
pub const SACK_BITMAP: [u8; 32] = [
    9, 10, 11, 12, 13, 14, 15, 16, //
    1, 2, 3, 4, 5, 6, 7, 8, //
    25, 26, 27, 28, 29, 30, 31, 32, //
    17, 18, 19, 20, 21, 22, 23, 24,
];

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(UtpError::decode(format!("invalid packet type: {}", value))),
        }
    }
}

/// Extension type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtensionType {
    /// No extension / end of extension chain
    None = 0,
    /// Selective ACK extension
    SelectiveAck = 1,
}

/// Selective ACK extension data.
///
/// Acknowledges packets `ack_nr + 2 ..= ack_nr + 33`; the cumulative
/// `ack_nr` itself (and `ack_nr + 1`, whose absence is what triggers the
/// extension) are never represented here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectiveAck {
    mask: u32,
}

impl SelectiveAck {
    /// Mark the packet at `offset` (relative to `ack_nr + 2`) as received
    pub fn set(&mut self, offset: u8) {
        if (offset as usize) < SACK_BITMAP.len() {
            self.mask |= 1 << (SACK_BITMAP[offset as usize] - 1);
        }
    }

    /// Whether the packet at `offset` (relative to `ack_nr + 2`) is acked
    pub fn contains(&self, offset: u8) -> bool {
        (offset as usize) < SACK_BITMAP.len()
            && self.mask & (1 << (SACK_BITMAP[offset as usize] - 1)) != 0
    }

    /// Iterate over the acked offsets, lowest first
    pub fn acked_offsets(&self) -> impl Iterator<Item = u8> + '_ {
        (0..SACK_BITMAP.len() as u8).filter(|off| self.contains(*off))
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Raw 32-bit mask, for inspection
    pub fn mask(&self) -> u32 {
        self.mask
    }

    fn to_bytes(self) -> [u8; 4] {
        self.mask.to_be_bytes()
    }

    fn from_bytes(raw: [u8; 4]) -> Self {
        Self {
            mask: u32::from_be_bytes(raw),
        }
    }
}

/// uTP packet header and data
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet type (upper nibble of byte 0; version is the lower nibble)
    pub packet_type: PacketType,

    /// Connection ID
    pub connection_id: u16,

    /// Sender's clock in microseconds at send time
    pub timestamp_micros: u32,

    /// Sender's measurement of the one-way delay from its peer
    pub timestamp_diff_micros: u32,

    /// Sender's advertised receive window (bytes)
    pub wnd_size: u32,

    /// Sequence number
    pub seq_nr: u16,

    /// Acknowledgment number (last in-order received seq_nr)
    pub ack_nr: u16,

    /// Optional selective ACK extension
    pub selective_ack: Option<SelectiveAck>,

    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            selective_ack: None,
            payload: Bytes::new(),
        }
    }

    /// Create a SYN packet to initiate a connection
    pub fn syn(connection_id: u16, seq_nr: u16) -> Self {
        Self::new(PacketType::Syn, connection_id, seq_nr, 0)
    }

    /// Create a STATE packet (acknowledgment)
    pub fn state(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::State, connection_id, seq_nr, ack_nr)
    }

    /// Create a DATA packet
    pub fn data(connection_id: u16, seq_nr: u16, ack_nr: u16, payload: Bytes) -> Self {
        let mut pkt = Self::new(PacketType::Data, connection_id, seq_nr, ack_nr);
        pkt.payload = payload;
        pkt
    }

    /// Create a FIN packet
    pub fn fin(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::Fin, connection_id, seq_nr, ack_nr)
    }

    /// Create a RESET packet
    pub fn reset(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::Reset, connection_id, seq_nr, ack_nr)
    }

    /// Set timestamps
    pub fn with_timestamps(mut self, timestamp_micros: u32, timestamp_diff_micros: u32) -> Self {
        self.timestamp_micros = timestamp_micros;
        self.timestamp_diff_micros = timestamp_diff_micros;
        self
    }

    /// Set window size
    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    /// Set selective ACK
    pub fn with_selective_ack(mut self, sack: SelectiveAck) -> Self {
        self.selective_ack = Some(sack);
        self
    }

    /// Encode the packet to bytes
    pub fn encode(&self) -> Vec<u8> {
        let ext_type = if self.selective_ack.is_some() {
            ExtensionType::SelectiveAck as u8
        } else {
            ExtensionType::None as u8
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + 6 + self.payload.len());

        // Byte 0: type (4 bits) | version (4 bits)
        buf.push((self.packet_type as u8) << 4 | UTP_VERSION);

        // Byte 1: first extension type
        buf.push(ext_type);

        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_diff_micros.to_be_bytes());
        buf.extend_from_slice(&self.wnd_size.to_be_bytes());
        buf.extend_from_slice(&self.seq_nr.to_be_bytes());
        buf.extend_from_slice(&self.ack_nr.to_be_bytes());

        // Extension chain: next_ext(1) | len(1) | data(len)
        if let Some(sack) = self.selective_ack {
            buf.push(ExtensionType::None as u8);
            buf.push(4);
            buf.extend_from_slice(&sack.to_bytes());
        }

        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode a packet from bytes
    pub fn decode(data: &[u8]) -> Result<Self, UtpError> {
        if data.len() < HEADER_SIZE {
            return Err(UtpError::decode(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let type_ver = data[0];
        let packet_type = PacketType::try_from(type_ver >> 4)?;
        let version = type_ver & 0x0f;
        if version != UTP_VERSION {
            return Err(UtpError::decode(format!(
                "unsupported version: {}",
                version
            )));
        }

        let connection_id = u16::from_be_bytes([data[2], data[3]]);
        let timestamp_micros = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let timestamp_diff_micros = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let wnd_size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let seq_nr = u16::from_be_bytes([data[16], data[17]]);
        let ack_nr = u16::from_be_bytes([data[18], data[19]]);

        // Walk the extension chain; it must terminate with next_ext == 0
        let mut offset = HEADER_SIZE;
        let mut selective_ack = None;
        let mut ext = data[1];

        while ext != ExtensionType::None as u8 {
            if offset + 2 > data.len() {
                return Err(UtpError::decode("extension header truncated"));
            }
            let next_ext = data[offset];
            let ext_len = data[offset + 1] as usize;
            offset += 2;
            if offset + ext_len > data.len() {
                return Err(UtpError::decode("extension data truncated"));
            }

            match ext {
                1 => {
                    if ext_len != 4 {
                        return Err(UtpError::decode(format!(
                            "selective ack length {} != 4",
                            ext_len
                        )));
                    }
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&data[offset..offset + 4]);
                    selective_ack = Some(SelectiveAck::from_bytes(raw));
                }
                other => {
                    return Err(UtpError::decode(format!("unknown extension: {}", other)));
                }
            }

            offset += ext_len;
            ext = next_ext;
        }

        let payload = Bytes::copy_from_slice(&data[offset..]);

        Ok(Self {
            packet_type,
            connection_id,
            timestamp_micros,
            timestamp_diff_micros,
            wnd_size,
            seq_nr,
            ack_nr,
            selective_ack,
            payload,
        })
    }
}

/// Current wall clock in microseconds, truncated to 32 bits
pub fn timestamp_micros() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_micros() & 0xffff_ffff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let pkt = Packet::syn(12345, 100)
            .with_timestamps(1_000_000, 500)
            .with_window(65535);

        let encoded = pkt.encode();
        let decoded = Packet::decode(&encoded).unwrap();

        assert_eq!(decoded.packet_type, PacketType::Syn);
        assert_eq!(decoded.connection_id, 12345);
        assert_eq!(decoded.seq_nr, 100);
        assert_eq!(decoded.ack_nr, 0);
        assert_eq!(decoded.timestamp_micros, 1_000_000);
        assert_eq!(decoded.timestamp_diff_micros, 500);
        assert_eq!(decoded.wnd_size, 65535);
    }

    #[test]
    fn test_encode_is_stable() {
        let mut sack = SelectiveAck::default();
        sack.set(0);
        sack.set(5);
        let pkt = Packet::state(77, 10, 9)
            .with_timestamps(42, 7)
            .with_window(4096)
            .with_selective_ack(sack);

        let first = pkt.encode();
        let reencoded = Packet::decode(&first).unwrap().encode();
        assert_eq!(first, reencoded);
    }

    #[test]
    fn test_data_packet_payload() {
        let payload = Bytes::from_static(b"portal content");
        let pkt = Packet::data(1234, 5, 3, payload.clone());

        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sack_bitmap_placement() {
        // Received {ack+2, ack+4, ack+33} => offsets {0, 2, 31}
        let mut sack = SelectiveAck::default();
        sack.set(0);
        sack.set(2);
        sack.set(31);

        let expected = (1u32 << (SACK_BITMAP[0] - 1))
            | (1u32 << (SACK_BITMAP[2] - 1))
            | (1u32 << (SACK_BITMAP[31] - 1));
        assert_eq!(sack.mask(), expected);

        assert!(sack.contains(0));
        assert!(!sack.contains(1));
        assert!(sack.contains(2));
        assert!(sack.contains(31));
        assert_eq!(sack.acked_offsets().collect::<Vec<_>>(), vec![0, 2, 31]);
    }

    #[test]
    fn test_sack_round_trip_through_wire() {
        let mut sack = SelectiveAck::default();
        for off in [1u8, 7, 8, 16, 24, 31] {
            sack.set(off);
        }
        let pkt = Packet::state(9, 1, 0).with_selective_ack(sack);
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.selective_ack, Some(sack));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut raw = Packet::state(1, 1, 0).encode();
        raw[0] = (PacketType::State as u8) << 4 | 2;
        assert!(matches!(
            Packet::decode(&raw),
            Err(UtpError::Decode { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut raw = Packet::state(1, 1, 0).encode();
        raw[0] = 7 << 4 | UTP_VERSION;
        assert!(Packet::decode(&raw).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_extension() {
        let mut raw = Packet::state(1, 1, 0).encode();
        raw[1] = ExtensionType::SelectiveAck as u8;
        // chain claims an extension but no bytes follow the header
        assert!(Packet::decode(&raw).is_err());
    }

    #[test]
    fn test_decode_rejects_short_packet() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_payload_budget() {
        assert_eq!(MAX_PAYLOAD_SIZE, 1260);
        assert_eq!(MAX_PACKET_SIZE - HEADER_SIZE, MAX_PAYLOAD_SIZE);
    }
}
