//! Inbound engine events and the bounded queue that carries them.
//!
//! Everything that can wake an engine becomes a typed event:
//! - Radio frames on the OTA cluster
//! - ZDO answers (discovery, IEEE address)
//! - File provider answers (image metadata, data blocks)
//! - Timer expiries
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ Transport   │────▶│              │     │                  │
//! │ ZDO         │────▶│  EventQueue  │────▶│  engine.poll()   │
//! │ Provider    │────▶│  (bounded)   │     │  (drains, FIFO)  │
//! │ Timers      │────▶│              │     │                  │
//! └─────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! A full queue drops the new event with a warning; the peer's own retry
//! (or the engine's timeout) recovers from the loss.

use heapless::Deque;
use log::warn;

use crate::app::ports::QueryKind;
use crate::client::ClientTimer;
use crate::protocol::{BlockData, FileId, FrameBuf, PeerAddr, ZclStatus};
use crate::timers::TimerDelegate;

/// Capacity of each engine's event queue.
pub const EVENT_QUEUE_CAP: usize = 16;

/// A frame received on the OTA cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub src: PeerAddr,
    pub dst_endpoint: u8,
    pub cluster_id: u16,
    pub was_broadcast: bool,
    pub data: FrameBuf,
}

// ── Client events ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// ZCL frame from the network.
    Frame(InboundFrame),
    /// Answer to a match-descriptor broadcast.
    MatchDescRsp {
        short_addr: u16,
        success: bool,
        endpoints: heapless::Vec<u8, 4>,
    },
    /// Answer to an IEEE address request.
    IeeeAddrRsp { short_addr: u16, ieee: [u8; 8] },
    /// A client timer expired.
    Timer(ClientTimer),
}

impl From<ClientTimer> for ClientEvent {
    fn from(t: ClientTimer) -> Self {
        Self::Timer(t)
    }
}

// ── Server events ─────────────────────────────────────────────

/// Provider answer to `request_next_image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextImageRsp {
    pub peer: PeerAddr,
    pub status: ZclStatus,
    pub file_id: FileId,
    pub image_size: u32,
    pub query: QueryKind,
}

/// Provider answer to `request_file_read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadRsp {
    pub peer: PeerAddr,
    pub status: ZclStatus,
    pub file_id: FileId,
    pub offset: u32,
    pub data: BlockData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Frame(InboundFrame),
    NextImage(NextImageRsp),
    FileRead(FileReadRsp),
}

// ── Bounded FIFO ──────────────────────────────────────────────

pub struct EventQueue<E, const N: usize = EVENT_QUEUE_CAP> {
    inner: Deque<E, N>,
    dropped: u32,
}

impl<E, const N: usize> EventQueue<E, N> {
    pub const fn new() -> Self {
        Self {
            inner: Deque::new(),
            dropped: 0,
        }
    }

    /// Enqueue an event.  Returns `false` if the queue was full and the
    /// event was dropped.
    pub fn push(&mut self, event: E) -> bool {
        if self.inner.push_back(event).is_err() {
            self.dropped = self.dropped.saturating_add(1);
            warn!("EventQueue: full ({} pending), event dropped", N);
            return false;
        }
        true
    }

    pub fn pop(&mut self) -> Option<E> {
        self.inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Events lost to a full queue since creation.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl<E, const N: usize> Default for EventQueue<E, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer expiries land in the queue like any other event.
impl<T, E: From<T>, const N: usize> TimerDelegate<T> for EventQueue<E, N> {
    fn on_timer_fired(&mut self, id: T) {
        self.push(E::from(id));
    }
}
