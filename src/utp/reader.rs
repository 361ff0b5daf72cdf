//! Content reassembly
//!
//! Buffers DATA payloads by sequence number as they arrive (in any order)
//! and concatenates them into the original content once the peer's FIN
//! pins down the end of the stream.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::UtpError;

/// Gap buffer for one inbound content transfer.
#[derive(Debug, Default)]
pub struct ContentReader {
    /// Sequence number of the first DATA packet (the peer's SYN seq + 1);
    /// unknown until the handshake is observed
    first_nr: Option<u16>,

    /// Payloads keyed by raw sequence number
    received: BTreeMap<u16, Bytes>,

    /// Total buffered payload bytes
    buffered: usize,
}

impl ContentReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the sequence number the content starts at
    pub fn bind_first(&mut self, first_nr: u16) {
        self.first_nr = Some(first_nr);
    }

    pub fn first_nr(&self) -> Option<u16> {
        self.first_nr
    }

    /// Buffer a DATA payload. Returns false for duplicates.
    pub fn insert(&mut self, seq_nr: u16, payload: Bytes) -> bool {
        if self.received.contains_key(&seq_nr) {
            return false;
        }
        self.buffered += payload.len();
        self.received.insert(seq_nr, payload);
        true
    }

    pub fn contains(&self, seq_nr: u16) -> bool {
        self.received.contains_key(&seq_nr)
    }

    /// Buffered payload bytes so far
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Concatenate the payloads from the first data sequence up to (but
    /// excluding) `fin_nr`, in modular order. Consumes the buffer; any
    /// missing sequence fails the assembly.
    pub fn assemble(&mut self, fin_nr: u16) -> Result<Bytes, UtpError> {
        let first = self
            .first_nr
            .ok_or(UtpError::IncompleteStream { missing: fin_nr })?;

        let mut content = Vec::with_capacity(self.buffered);
        let mut seq = first;
        while seq != fin_nr {
            let chunk = self
                .received
                .remove(&seq)
                .ok_or(UtpError::IncompleteStream { missing: seq })?;
            content.extend_from_slice(&chunk);
            seq = seq.wrapping_add(1);
        }
        self.buffered = 0;

        Ok(content.into())
    }
}
