//! Frame gating and reply helpers shared by both engines.
//!
//! ```text
//!  InboundFrame ──▶ gate() ──▶ Handle(cmd, payload) ──▶ engine handler
//!                     │                                    │
//!                     ├──▶ Reply(status) ─────────┐        ▼
//!                     └──▶ Drop                   └──▶ finish(): default rsp
//! ```

use log::{debug, warn};

use crate::events::InboundFrame;
use crate::protocol::frame::default_response;
use crate::protocol::{
    CommandId, Direction, Disposition, FrameType, OTA_CLUSTER_ID, PeerAddr, WireRecord, ZclHeader,
    ZclStatus, default_response_needed, encode_command,
};

use super::ports::ZclTransport;

/// Result of screening an inbound frame.
pub(crate) enum Gate<'a> {
    /// A well-formed cluster command for this engine.
    Handle {
        header: ZclHeader,
        command: CommandId,
        payload: &'a [u8],
    },
    /// Refuse the command with `status` (subject to the default-response rules).
    Reply { header: ZclHeader, status: ZclStatus },
    /// Not for us, or unreadable.
    Drop,
}

/// Screen a frame for an engine listening on `endpoint` for commands
/// travelling in `accepts` direction.
pub(crate) fn gate(frame: &InboundFrame, endpoint: u8, accepts: Direction) -> Gate<'_> {
    if frame.cluster_id != OTA_CLUSTER_ID || frame.dst_endpoint != endpoint {
        debug!(
            "Dispatch: frame for cluster 0x{:04X} ep {} ignored",
            frame.cluster_id, frame.dst_endpoint
        );
        return Gate::Drop;
    }
    let (header, payload) = match ZclHeader::decode(&frame.data) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Dispatch: unreadable ZCL header from 0x{:04X}: {e}", frame.src.short_addr);
            return Gate::Drop;
        }
    };
    if header.frame_type == FrameType::Global {
        return Gate::Drop;
    }
    if header.manufacturer_code.is_some() {
        return Gate::Reply {
            header,
            status: ZclStatus::UnsupManuClusterCommand,
        };
    }
    match CommandId::from_u8(header.command) {
        Some(command) if header.direction == accepts && command.direction() == accepts => {
            Gate::Handle {
                header,
                command,
                payload,
            }
        }
        _ => Gate::Reply {
            header,
            status: ZclStatus::UnsupClusterCommand,
        },
    }
}

/// Send the default response a disposition calls for, if any.
pub(crate) fn finish<T: ZclTransport + ?Sized>(
    transport: &mut T,
    frame: &InboundFrame,
    header: &ZclHeader,
    disposition: Disposition,
) {
    let Disposition::Status(status) = disposition else {
        return;
    };
    if !default_response_needed(header, frame.was_broadcast, status) {
        return;
    }
    match default_response(header, status) {
        Ok(rsp) => {
            if let Err(e) = transport.send(frame.src, &rsp) {
                warn!("Dispatch: default response to 0x{:04X} failed: {e}", frame.src.short_addr);
            }
        }
        Err(e) => warn!("Dispatch: default response encode failed: {e}"),
    }
}

/// Encode and send one cluster command.  Returns `false` if it never left.
pub(crate) fn send_command<T: ZclTransport + ?Sized, R: WireRecord>(
    transport: &mut T,
    dst: PeerAddr,
    command: CommandId,
    seq_num: u8,
    record: &R,
) -> bool {
    let frame = match encode_command(command, seq_num, true, record) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dispatch: {command:?} encode failed: {e}");
            return false;
        }
    };
    match transport.send(dst, &frame) {
        Ok(()) => {
            debug!("Dispatch: {command:?} seq {seq_num} -> 0x{:04X}", dst.short_addr);
            true
        }
        Err(e) => {
            warn!("Dispatch: {command:?} to 0x{:04X} failed: {e}", dst.short_addr);
            false
        }
    }
}
