//! Outbound application events.
//!
//! Emitted by the engines through the [`EventSink`](super::ports::EventSink)
//! port.  Each variant is a notable milestone the application or an operator
//! console may want to react to.

use crate::client::UpgradeStatus;
use crate::protocol::{FileId, PeerAddr, ZclStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    // ── Client ───────────────────────────────────────────────
    /// A server answered discovery.
    ServerDiscovered(PeerAddr),
    /// The upgrade server's IEEE address became known.
    ServerIeeeAddress { short_addr: u16, ieee: [u8; 8] },
    /// A Query-Next-Image exchange finished.
    QueryResult { status: ZclStatus },
    /// No answer to a Query-Next-Image request.
    QueryTimedOut,
    /// The client status attribute changed.
    StatusChanged { from: UpgradeStatus, to: UpgradeStatus },
    /// A transfer session opened.
    DownloadStarted {
        file_id: FileId,
        image_size: u32,
        server: PeerAddr,
    },
    /// Bytes staged so far.
    Progress { offset: u32, image_size: u32 },
    /// The transfer session closed.
    DownloadFinished { status: ZclStatus },
    /// The server scheduled the apply.
    UpgradeScheduled { delay_secs: u32 },
    /// The server asked the client to hold the image.
    UpgradeWaiting,
    /// The staged image was marked for copy; a reset follows.
    ApplyingImage { file_id: FileId },
    /// The staged image could not be handed to the bootloader.
    ApplyFailed,

    // ── Server ───────────────────────────────────────────────
    /// The provider answered a client's image query.
    ImageQueried {
        peer: PeerAddr,
        file_id: FileId,
        status: ZclStatus,
    },
    /// A client reported the end of its transfer.
    TransferEnded { peer: PeerAddr, status: ZclStatus },
}
