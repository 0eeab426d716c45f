//! Fragmentation and reassembly.
//!
//! A payload's base64 text is split into frame-sized chunks on send. On
//! receive, chunks are collected per message into a `NetBuffer` until every
//! part is present, in any order. Buffers that stop receiving parts are
//! swept after the idle lifetime.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use chatwire_core::wire::FrameHeader;

use crate::channel::PeerId;

/// Split `payload` into chunks of at most `max_chunk_bytes` bytes.
///
/// Part count is `ceil(len / max_chunk_bytes)`; the last chunk may be
/// shorter. An empty payload is still one (empty) chunk. Chunks never split
/// a UTF-8 character, though base64 text is ASCII anyway.
pub fn split(payload: &str, max_chunk_bytes: usize) -> Vec<&str> {
    if payload.is_empty() {
        return vec![payload];
    }
    let max = max_chunk_bytes.max(1);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(max));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Why a part was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PartRejected {
    #[error("part {index} out of range for {total} parts")]
    OutOfRange { index: u16, total: u16 },

    #[error("part {0} already received")]
    Duplicate(u16),

    #[error("part declares {declared} parts, buffer expects {expected}")]
    TotalMismatch { expected: u16, declared: u16 },
}

/// Accumulator for the parts of one message.
#[derive(Debug, Clone)]
pub struct NetBuffer {
    total: u16,
    parts: Vec<Option<String>>,
    received: u16,
    last_seen: Instant,
}

impl NetBuffer {
    pub fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            parts: vec![None; usize::from(total)],
            received: 0,
            last_seen: now,
        }
    }

    pub fn total(&self) -> u16 {
        self.total
    }

    pub fn received(&self) -> u16 {
        self.received
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Store part `index`. Returns `Ok(true)` exactly when this part
    /// completes the message.
    ///
    /// Out-of-range and already-filled slots are rejected without touching
    /// the buffer; a slot is never overwritten.
    pub fn add_part(
        &mut self,
        index: u16,
        chunk: &str,
        now: Instant,
    ) -> Result<bool, PartRejected> {
        let slot = self
            .parts
            .get_mut(usize::from(index))
            .ok_or(PartRejected::OutOfRange {
                index,
                total: self.total,
            })?;
        if slot.is_some() {
            return Err(PartRejected::Duplicate(index));
        }
        *slot = Some(chunk.to_string());
        self.received += 1;
        self.last_seen = now;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    /// Has nothing arrived for longer than `max_idle`?
    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > max_idle
    }

    /// The parts joined in index order, once every part is present.
    pub fn concat(&self) -> Option<String> {
        if !self.is_complete() {
            return None;
        }
        Some(self.parts.iter().flatten().map(String::as_str).collect())
    }
}

/// Message ids are chosen by each sender, so buffers are keyed by both.
pub type MessageKey = (PeerId, u32);

/// Outcome of feeding one part into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accept {
    /// Stored; more parts are needed.
    Pending { received: u16, total: u16 },
    /// This part completed the message. Carries the joined payload.
    Complete(String),
    /// Not stored.
    Rejected(PartRejected),
    /// The message already completed recently; the part is ignored.
    Replayed,
}

/// Partial messages in flight, keyed by sender and message id.
///
/// Each buffer is removed exactly once: by the part that completes it, or by
/// `sweep`. Both go through the map's own locking, so whichever runs first
/// wins and the other finds nothing to remove. Completed keys stay as
/// tombstones for one lifetime, which turns duplicate and replayed parts of
/// a finished message into no-ops instead of a second dispatch.
///
/// A tombstone only matches parts with the same type id and part count. A
/// sender that restarts within one lifetime counts its ids from 1 again;
/// its new messages are accepted unless they repeat both of those too, in
/// which case they are dropped as replays until the tombstone expires.
#[derive(Default)]
pub struct PendingTable {
    buffers: DashMap<MessageKey, NetBuffer>,
    completed: DashMap<MessageKey, Tombstone>,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    done_at: Instant,
    type_id: u32,
    total: u16,
}

impl Tombstone {
    fn new(header: &FrameHeader, done_at: Instant) -> Self {
        Self {
            done_at,
            type_id: header.type_id,
            total: header.total,
        }
    }

    fn matches(&self, header: &FrameHeader) -> bool {
        self.type_id == header.type_id && self.total == header.total
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one part. The check-add-remove sequence for a key runs under
    /// that key's entry lock.
    pub fn accept(
        &self,
        key: MessageKey,
        header: &FrameHeader,
        chunk: &str,
        now: Instant,
    ) -> Accept {
        match self.buffers.entry(key) {
            Entry::Occupied(mut occupied) => {
                let buffer = occupied.get_mut();
                if buffer.total() != header.total {
                    return Accept::Rejected(PartRejected::TotalMismatch {
                        expected: buffer.total(),
                        declared: header.total,
                    });
                }
                match buffer.add_part(header.index, chunk, now) {
                    Err(rejected) => Accept::Rejected(rejected),
                    Ok(false) => Accept::Pending {
                        received: buffer.received(),
                        total: buffer.total(),
                    },
                    Ok(true) => {
                        self.completed.insert(key, Tombstone::new(header, now));
                        let buffer = occupied.remove();
                        Accept::Complete(buffer.concat().unwrap_or_default())
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let tombstone = self.completed.get(&key).map(|t| t.matches(header));
                match tombstone {
                    Some(true) => return Accept::Replayed,
                    Some(false) => {
                        self.completed.remove(&key);
                    }
                    None => {}
                }
                let mut buffer = NetBuffer::new(header.total, now);
                match buffer.add_part(header.index, chunk, now) {
                    Err(rejected) => Accept::Rejected(rejected),
                    Ok(true) => {
                        self.completed.insert(key, Tombstone::new(header, now));
                        Accept::Complete(buffer.concat().unwrap_or_default())
                    }
                    Ok(false) => {
                        let pending = Accept::Pending {
                            received: buffer.received(),
                            total: buffer.total(),
                        };
                        vacant.insert(buffer);
                        pending
                    }
                }
            }
        }
    }

    /// Remove buffers idle longer than `max_idle`, and tombstones older than
    /// it. Returns how many partial messages expired.
    pub fn sweep(&self, now: Instant, max_idle: Duration) -> usize {
        let mut expired = 0;
        if !self.buffers.is_empty() {
            self.buffers.retain(|(sender, msg_id), buffer| {
                if buffer.is_idle(now, max_idle) {
                    tracing::debug!(
                        %sender,
                        msg_id = *msg_id,
                        received = buffer.received(),
                        total = buffer.total(),
                        "partial message expired"
                    );
                    expired += 1;
                    false
                } else {
                    true
                }
            });
        }
        if !self.completed.is_empty() {
            self.completed
                .retain(|_, tombstone| now.saturating_duration_since(tombstone.done_at) <= max_idle);
        }
        expired
    }

    /// Number of partial messages in flight.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn clear(&self) {
        self.buffers.clear();
        self.completed.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
