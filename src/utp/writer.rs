//! Content chunking and send bookkeeping
//!
//! Splits one content payload into DATA-sized frames up front and tracks
//! which sequence numbers carried which chunk, which have been sent, and
//! which the peer has acknowledged. Retransmission always reuses the
//! sequence number a chunk was first assigned.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use super::buffer::seq_lt;
use super::packet::MAX_PAYLOAD_SIZE;

/// Send-side bookkeeping for one outbound content transfer.
#[derive(Debug)]
pub struct ContentWriter {
    /// Fixed chunking of the payload; zero-copy slices
    chunks: Vec<Bytes>,

    /// Index of the first chunk that has never been sent
    next_unsent: usize,

    /// Assigned sequence number -> chunk index
    seq_to_chunk: HashMap<u16, usize>,

    /// Sequence numbers sent, in send order
    data_nrs: Vec<u16>,

    /// Sequence numbers the peer has acknowledged
    acked: HashSet<u16>,

    /// Total payload bytes
    total: usize,
}

impl ContentWriter {
    pub fn new(payload: Bytes) -> Self {
        let total = payload.len();
        let mut chunks = Vec::with_capacity(total.div_ceil(MAX_PAYLOAD_SIZE));
        let mut offset = 0;
        while offset < total {
            let end = (offset + MAX_PAYLOAD_SIZE).min(total);
            chunks.push(payload.slice(offset..end));
            offset = end;
        }
        Self {
            chunks,
            next_unsent: 0,
            seq_to_chunk: HashMap::new(),
            data_nrs: Vec::new(),
            acked: HashSet::new(),
            total,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn all_sent(&self) -> bool {
        self.next_unsent == self.chunks.len()
    }

    /// Assign `seq_nr` to the next unsent chunk and return it, or None
    /// when every chunk has already been put on the wire.
    pub fn assign_next(&mut self, seq_nr: u16) -> Option<Bytes> {
        if self.all_sent() {
            return None;
        }
        let index = self.next_unsent;
        self.next_unsent += 1;
        self.seq_to_chunk.insert(seq_nr, index);
        self.data_nrs.push(seq_nr);
        Some(self.chunks[index].clone())
    }

    /// The chunk previously assigned to `seq_nr`, for retransmission
    pub fn chunk_for(&self, seq_nr: u16) -> Option<Bytes> {
        self.seq_to_chunk
            .get(&seq_nr)
            .map(|&index| self.chunks[index].clone())
    }

    /// Record an acknowledgment. Returns true when `seq_nr` names a data
    /// chunk not previously acked.
    pub fn mark_acked(&mut self, seq_nr: u16) -> bool {
        if !self.seq_to_chunk.contains_key(&seq_nr) {
            return false;
        }
        self.acked.insert(seq_nr)
    }

    pub fn is_acked(&self, seq_nr: u16) -> bool {
        self.acked.contains(&seq_nr)
    }

    /// Sent sequence numbers that remain unacknowledged and sit below
    /// `horizon` in the modular order; these are the retransmission
    /// candidates once later sequences have been selectively acked.
    pub fn lost_below(&self, horizon: u16) -> Vec<u16> {
        self.data_nrs
            .iter()
            .copied()
            .filter(|seq| seq_lt(*seq, horizon) && !self.acked.contains(seq))
            .collect()
    }

    /// Every chunk sent and every sent sequence acknowledged
    pub fn complete(&self) -> bool {
        self.all_sent() && self.acked.len() == self.data_nrs.len()
    }
}
