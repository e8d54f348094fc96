//! Transaction sequence-number correlation.
//!
//! A client's request is forwarded to the file provider and answered later.
//! The answer must carry the sequence number of the request it belongs to,
//! so the server parks `(peer short address → seq)` here until the provider
//! replies.  When the table is full the entry is simply not kept and the
//! reply falls back to the server's own counter.

use log::warn;

/// Concurrent outstanding provider requests the server can correlate.
pub const SEQ_TABLE_CAP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqEntry {
    pub short_addr: u16,
    pub seq_num: u8,
}

#[derive(Debug, Clone, Default)]
pub struct SeqNumTable {
    slots: [Option<SeqEntry>; SEQ_TABLE_CAP],
}

impl SeqNumTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; SEQ_TABLE_CAP],
        }
    }

    /// Remember `seq_num` for `short_addr`.  An existing entry for the same
    /// peer is overwritten; otherwise the first free slot is used.  Returns
    /// `false` when the table is full and the entry was dropped.
    pub fn insert(&mut self, short_addr: u16, seq_num: u8) -> bool {
        let entry = SeqEntry {
            short_addr,
            seq_num,
        };
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|e| e.short_addr == short_addr))
        {
            *slot = Some(entry);
            return true;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            return true;
        }
        warn!("SeqNumTable: full, seq {seq_num} for 0x{short_addr:04X} not kept");
        false
    }

    /// Remove and return the sequence number parked for `short_addr`.
    pub fn take(&mut self, short_addr: u16) -> Option<u8> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|e| e.short_addr == short_addr))?;
        slot.take().map(|e| e.seq_num)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = &SeqEntry> {
        self.slots.iter().flatten()
    }
}
