//! Outgoing in-flight buffer
//!
//! Tracks every unacknowledged SYN/DATA/FIN by sequence number along with
//! its most recent send time, which is where RTT samples come from. The
//! buffer size times the packet budget is the socket's in-flight window.

use std::collections::BTreeMap;
use std::time::Instant;

use super::packet::MAX_PACKET_SIZE;

/// `a <= b` in the modular u16 sequence space
pub(crate) fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 32768
}

/// `a < b` in the modular u16 sequence space
pub(crate) fn seq_lt(a: u16, b: u16) -> bool {
    a != b && seq_le(a, b)
}

/// Send record for one in-flight packet
#[derive(Debug, Clone, Copy)]
pub struct SentEntry {
    /// Most recent send time; refreshed on retransmission
    pub sent_at: Instant,

    /// Number of times the packet has been put on the wire
    pub transmissions: u32,
}

/// In-flight packets awaiting acknowledgment, keyed by sequence number.
#[derive(Debug, Default)]
pub struct OutgoingBuffer {
    in_flight: BTreeMap<u16, SentEntry>,
}

impl OutgoingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly sent packet
    pub fn record(&mut self, seq_nr: u16) {
        self.in_flight.insert(
            seq_nr,
            SentEntry {
                sent_at: Instant::now(),
                transmissions: 1,
            },
        );
    }

    /// Refresh the send timestamp for a retransmission
    pub fn mark_retransmit(&mut self, seq_nr: u16) {
        if let Some(entry) = self.in_flight.get_mut(&seq_nr) {
            entry.sent_at = Instant::now();
            entry.transmissions += 1;
        }
    }

    /// Acknowledge a single sequence number
    pub fn ack(&mut self, seq_nr: u16) -> Option<SentEntry> {
        self.in_flight.remove(&seq_nr)
    }

    /// Cumulatively acknowledge everything at or before `ack_nr`
    /// (modular), returning the removed entries.
    pub fn ack_through(&mut self, ack_nr: u16) -> Vec<(u16, SentEntry)> {
        let acked: Vec<u16> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&seq| seq_le(seq, ack_nr))
            .collect();
        acked
            .into_iter()
            .filter_map(|seq| self.in_flight.remove(&seq).map(|entry| (seq, entry)))
            .collect()
    }

    pub fn contains(&self, seq_nr: u16) -> bool {
        self.in_flight.contains_key(&seq_nr)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// In-flight byte window: every tracked packet costs one datagram
    /// budget regardless of its payload length.
    pub fn cur_window(&self) -> u32 {
        self.in_flight.len() as u32 * MAX_PACKET_SIZE as u32
    }

    /// Sequence numbers currently in flight
    pub fn unacked(&self) -> impl Iterator<Item = u16> + '_ {
        self.in_flight.keys().copied()
    }

    /// The in-flight packet that has been waiting longest
    pub fn oldest(&self) -> Option<u16> {
        self.in_flight
            .iter()
            .min_by_key(|(_, entry)| entry.sent_at)
            .map(|(seq, _)| *seq)
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}
