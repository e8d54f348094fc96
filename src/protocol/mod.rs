//! OTA Upgrade cluster wire protocol.
//!
//! ```text
//!  ┌────────────────────── ZCL frame ───────────────────────┐
//!  │ FC │ [manu code] │ seq │ cmd │ payload (per command)    │
//!  └────┴─────────────┴─────┴─────┴──────────────────────────┘
//!          frame.rs                      messages.rs
//!                                  (LE fields via codec.rs)
//! ```
//!
//! Every record has an `encode`/`decode` pair and validates the payload
//! length before touching any field.

pub mod codec;
pub mod frame;
pub mod messages;

pub use frame::{Direction, FrameBuf, FrameType, ZclHeader};
pub use messages::*;

/// ZCL cluster id of the OTA Upgrade cluster.
pub const OTA_CLUSTER_ID: u16 = 0x0019;

/// Largest block of image data carried by one Image-Block Response.
pub const OTA_MAX_MTU: u8 = 64;

/// Upgrade time meaning "wait for the server's go-ahead".
pub const UPGRADE_TIME_WAIT: u32 = 0xFFFF_FFFF;

/// Wildcard values used when matching a file identifier.
pub const MANUFACTURER_WILDCARD: u16 = 0xFFFF;
pub const IMAGE_TYPE_WILDCARD: u16 = 0xFFFF;
pub const VERSION_WILDCARD: u32 = 0xFFFF_FFFF;

/// Capacity of a command payload buffer.
pub const MAX_PAYLOAD: usize = 96;

/// Owned command payload.
pub type Payload = heapless::Vec<u8, MAX_PAYLOAD>;

/// IEEE (EUI-64) address, little-endian as carried on the wire.
pub type IeeeAddr = [u8; 8];

/// ZCL global command id of the Default Response.
pub const ZCL_CMD_DEFAULT_RSP: u8 = 0x0B;

// ── Command ids ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    ImageNotify = 0x00,
    QueryNextImageReq = 0x01,
    QueryNextImageRsp = 0x02,
    ImageBlockReq = 0x03,
    ImagePageReq = 0x04,
    ImageBlockRsp = 0x05,
    UpgradeEndReq = 0x06,
    UpgradeEndRsp = 0x07,
    QuerySpecificFileReq = 0x08,
    QuerySpecificFileRsp = 0x09,
}

impl CommandId {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::ImageNotify,
            0x01 => Self::QueryNextImageReq,
            0x02 => Self::QueryNextImageRsp,
            0x03 => Self::ImageBlockReq,
            0x04 => Self::ImagePageReq,
            0x05 => Self::ImageBlockRsp,
            0x06 => Self::UpgradeEndReq,
            0x07 => Self::UpgradeEndRsp,
            0x08 => Self::QuerySpecificFileReq,
            0x09 => Self::QuerySpecificFileRsp,
            _ => return None,
        })
    }

    /// Direction in which this command travels.
    pub const fn direction(self) -> Direction {
        match self {
            Self::ImageNotify
            | Self::QueryNextImageRsp
            | Self::ImageBlockRsp
            | Self::UpgradeEndRsp
            | Self::QuerySpecificFileRsp => Direction::ServerToClient,
            _ => Direction::ClientToServer,
        }
    }
}

// ── Status codes ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ZclStatus {
    Success = 0x00,
    Failure = 0x01,
    MalformedCommand = 0x80,
    UnsupClusterCommand = 0x81,
    UnsupManuClusterCommand = 0x84,
    Abort = 0x95,
    InvalidImage = 0x96,
    WaitForData = 0x97,
    NoImageAvailable = 0x98,
    RequireMoreImage = 0x99,
}

impl ZclStatus {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Success,
            0x01 => Self::Failure,
            0x80 => Self::MalformedCommand,
            0x81 => Self::UnsupClusterCommand,
            0x84 => Self::UnsupManuClusterCommand,
            0x95 => Self::Abort,
            0x96 => Self::InvalidImage,
            0x97 => Self::WaitForData,
            0x98 => Self::NoImageAvailable,
            0x99 => Self::RequireMoreImage,
            _ => return None,
        })
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

// ── Addressing ───────────────────────────────────────────────

/// Network short address plus application endpoint of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeerAddr {
    pub short_addr: u16,
    pub endpoint: u8,
}

impl PeerAddr {
    /// All-routers-and-coordinator style broadcast to every node.
    pub const BROADCAST: u16 = 0xFFFF;

    pub const fn new(short_addr: u16, endpoint: u8) -> Self {
        Self {
            short_addr,
            endpoint,
        }
    }

    pub const fn is_broadcast(self) -> bool {
        self.short_addr >= 0xFFF8
    }
}

// ── Sequence numbers ─────────────────────────────────────────

/// Wrapping ZCL transaction sequence counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqCounter(u8);

impl SeqCounter {
    pub const fn new(start: u8) -> Self {
        Self(start)
    }

    /// Return the current number and advance.
    pub fn next_seq(&mut self) -> u8 {
        let seq = self.0;
        self.0 = self.0.wrapping_add(1);
        seq
    }

    pub const fn peek(&self) -> u8 {
        self.0
    }
}

/// Outcome of handling one inbound cluster command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No cluster-specific reply was sent; a default response may follow.
    Status(ZclStatus),
    /// The handler already sent (or forwarded for) a specific response.
    Responded,
    /// Dropped without any reply (stale or not addressed to us).
    Ignored,
}

/// Whether a Default Response must be sent for an inbound command.
///
/// Never for broadcasts.  Errors are always reported; a success only when
/// the sender left default responses enabled.
pub fn default_response_needed(header: &ZclHeader, was_broadcast: bool, status: ZclStatus) -> bool {
    if was_broadcast {
        return false;
    }
    !status.is_success() || !header.disable_default_rsp
}
