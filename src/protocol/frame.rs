//! ZCL frame header and whole-frame assembly.
//!
//! ```text
//!  bit  7 6 5 │ 4          │ 3         │ 2           │ 1 0
//!       rsvd  │ disable DR │ direction │ manu-spec   │ frame type
//! ```

use super::codec::{PutLe, Reader};
use super::{Payload, ZCL_CMD_DEFAULT_RSP, ZclStatus};
use crate::error::{DecodeError, EncodeError};

/// Capacity of an encoded frame (header + payload).
pub const MAX_FRAME: usize = 128;

/// Owned encoded frame.
pub type FrameBuf = heapless::Vec<u8, MAX_FRAME>;

const FC_TYPE_MASK: u8 = 0b0000_0011;
const FC_MANU_SPECIFIC: u8 = 0b0000_0100;
const FC_SERVER_TO_CLIENT: u8 = 0b0000_1000;
const FC_DISABLE_DEFAULT_RSP: u8 = 0b0001_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Foundation command (read attributes, default response, ...).
    Global,
    /// Command specific to the addressed cluster.
    ClusterSpecific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZclHeader {
    pub frame_type: FrameType,
    pub manufacturer_code: Option<u16>,
    pub direction: Direction,
    pub disable_default_rsp: bool,
    pub seq_num: u8,
    pub command: u8,
}

impl ZclHeader {
    /// Cluster-specific header with default responses enabled.
    pub const fn cluster(direction: Direction, seq_num: u8, command: u8) -> Self {
        Self {
            frame_type: FrameType::ClusterSpecific,
            manufacturer_code: None,
            direction,
            disable_default_rsp: false,
            seq_num,
            command,
        }
    }

    /// Decode the header, returning it with the remaining command payload.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut r = Reader::new(bytes);
        let fc = r.u8()?;
        let frame_type = match fc & FC_TYPE_MASK {
            0 => FrameType::Global,
            1 => FrameType::ClusterSpecific,
            _ => return Err(DecodeError::BadField("frame type")),
        };
        let manufacturer_code = if fc & FC_MANU_SPECIFIC != 0 {
            Some(r.u16()?)
        } else {
            None
        };
        let direction = if fc & FC_SERVER_TO_CLIENT != 0 {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        };
        let seq_num = r.u8()?;
        let command = r.u8()?;
        let header = Self {
            frame_type,
            manufacturer_code,
            direction,
            disable_default_rsp: fc & FC_DISABLE_DEFAULT_RSP != 0,
            seq_num,
            command,
        };
        Ok((header, r.rest()))
    }

    pub fn encode(&self, out: &mut FrameBuf) -> Result<(), EncodeError> {
        let mut fc = match self.frame_type {
            FrameType::Global => 0,
            FrameType::ClusterSpecific => 1,
        };
        if self.manufacturer_code.is_some() {
            fc |= FC_MANU_SPECIFIC;
        }
        if self.direction == Direction::ServerToClient {
            fc |= FC_SERVER_TO_CLIENT;
        }
        if self.disable_default_rsp {
            fc |= FC_DISABLE_DEFAULT_RSP;
        }
        out.put_u8(fc)?;
        if let Some(code) = self.manufacturer_code {
            out.put_u16(code)?;
        }
        out.put_u8(self.seq_num)?;
        out.put_u8(self.command)
    }
}

/// Assemble header and payload into one frame.
pub fn build_frame(header: &ZclHeader, payload: &[u8]) -> Result<FrameBuf, EncodeError> {
    let mut out = FrameBuf::new();
    header.encode(&mut out)?;
    out.put_slice(payload)?;
    Ok(out)
}

/// Build a ZCL Default Response answering `request`.
pub fn default_response(request: &ZclHeader, status: ZclStatus) -> Result<FrameBuf, EncodeError> {
    let direction = match request.direction {
        Direction::ClientToServer => Direction::ServerToClient,
        Direction::ServerToClient => Direction::ClientToServer,
    };
    let header = ZclHeader {
        frame_type: FrameType::Global,
        manufacturer_code: request.manufacturer_code,
        direction,
        disable_default_rsp: true,
        seq_num: request.seq_num,
        command: ZCL_CMD_DEFAULT_RSP,
    };
    let mut payload = Payload::new();
    payload.put_u8(request.command)?;
    payload.put_u8(status as u8)?;
    build_frame(&header, &payload)
}
