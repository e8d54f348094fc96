//! Port traits: the hexagonal boundary between the OTA engines and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ OtaClient / OtaServer (domain)
//! ```
//!
//! Radio transport, flash, the file provider and the device itself are
//! external collaborators.  Asynchronous answers (ZDO responses, provider
//! callbacks) never come back through these traits: adapters post them as
//! typed events into the engine's queue instead.

use crate::error::{ProviderError, StorageError, TransportError};
use crate::protocol::{FileId, IeeeAddr, PeerAddr, ZclStatus};

// ───────────────────────────────────────────────────────────────
// Transport ports (domain → radio)
// ───────────────────────────────────────────────────────────────

/// Sends encoded ZCL frames on the OTA cluster.
pub trait ZclTransport {
    fn send(&mut self, dst: PeerAddr, frame: &[u8]) -> Result<(), TransportError>;
}

/// Client-side network services on top of the ZCL transport.
///
/// Responses arrive later as
/// [`ClientEvent::MatchDescRsp`](crate::events::ClientEvent::MatchDescRsp) and
/// [`ClientEvent::IeeeAddrRsp`](crate::events::ClientEvent::IeeeAddrRsp).
pub trait NetworkPort: ZclTransport {
    /// Broadcast a match-descriptor request for servers of `cluster_id`.
    fn match_desc_req(&mut self, cluster_id: u16) -> Result<(), TransportError>;

    /// Ask `short_addr` for its IEEE address.
    fn ieee_addr_req(&mut self, short_addr: u16) -> Result<(), TransportError>;
}

// ───────────────────────────────────────────────────────────────
// Staging port (domain ↔ flash)
// ───────────────────────────────────────────────────────────────

/// Page-addressed access to the flash region holding the staged image.
///
/// Page 0 holds the metadata record; image data starts at page 1.
/// A page must be erased before it is written.
pub trait StagingPort {
    fn open(&mut self) -> Result<(), StorageError>;

    fn close(&mut self);

    fn page_size(&self) -> u32;

    /// Pages in the region, metadata page included.
    fn page_count(&self) -> u32;

    fn read_page(&mut self, page: u32, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write_page(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    fn erase_page(&mut self, page: u32) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// File provider port (server ↔ console / host tool)
// ───────────────────────────────────────────────────────────────

/// Which query a provider answer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Query-Next-Image: "anything newer than this?"
    Next,
    /// Query-Specific-File: a named file for the given node.
    Specific { node_addr: IeeeAddr, stack_version: u16 },
}

/// Asynchronous image source behind the server.
///
/// `Ok` means the request was accepted and an answer will be posted as
/// [`ServerEvent`](crate::events::ServerEvent); `Err` means no answer will
/// ever come and the server must reply to the client on its own.
pub trait FileProvider {
    fn request_next_image(
        &mut self,
        peer: PeerAddr,
        file_id: FileId,
        hardware_version: Option<u16>,
        query: QueryKind,
    ) -> Result<(), ProviderError>;

    fn request_file_read(
        &mut self,
        peer: PeerAddr,
        file_id: FileId,
        offset: u32,
        len: u8,
    ) -> Result<(), ProviderError>;

    /// Report the end of a client's transfer.
    fn report_status(&mut self, peer: PeerAddr, file_id: Option<FileId>, status: ZclStatus);
}

// ───────────────────────────────────────────────────────────────
// Device port (domain → platform services)
// ───────────────────────────────────────────────────────────────

pub trait DevicePort {
    /// Uniform random number (jitter and poll randomization).
    fn random_u16(&mut self) -> u16;

    /// Change how often a sleepy device polls its parent.
    fn set_poll_rate(&mut self, period_ms: u32);

    /// Reboot into the bootloader, which copies the staged image.
    fn system_reset(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Event sink port (domain → logging / application)
// ───────────────────────────────────────────────────────────────

/// The engines emit structured [`OtaEvent`](super::events::OtaEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::OtaEvent);
}
