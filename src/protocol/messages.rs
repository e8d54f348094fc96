//! OTA cluster command records.
//!
//! One type per command kind.  `decode` checks the payload length against
//! what the field-control bits and status promise before any field is read;
//! `encode` derives the field-control bits from which optional fields are
//! present, so an encoded record is always self-consistent.

use super::codec::{PutLe, Reader};
use super::frame::{FrameBuf, ZclHeader, build_frame};
use super::{
    CommandId, IMAGE_TYPE_WILDCARD, IeeeAddr, MANUFACTURER_WILDCARD, OTA_MAX_MTU, Payload,
    VERSION_WILDCARD, ZclStatus,
};
use crate::error::{DecodeError, EncodeError};

/// Encode/decode pair for one command payload.
pub trait WireRecord: Sized {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError>;
    fn decode(payload: &[u8]) -> Result<Self, DecodeError>;

    fn to_payload(&self) -> Result<Payload, EncodeError> {
        let mut out = Payload::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// Frame a record as a cluster-specific command.
pub fn encode_command<R: WireRecord>(
    command: CommandId,
    seq_num: u8,
    disable_default_rsp: bool,
    record: &R,
) -> Result<FrameBuf, EncodeError> {
    let mut header = ZclHeader::cluster(command.direction(), seq_num, command as u8);
    header.disable_default_rsp = disable_default_rsp;
    build_frame(&header, &record.to_payload()?)
}

fn expect_len(payload: &[u8], allowed: &[usize]) -> Result<(), DecodeError> {
    if allowed.contains(&payload.len()) {
        Ok(())
    } else {
        Err(DecodeError::BadLength { len: payload.len() })
    }
}

fn read_status(r: &mut Reader<'_>) -> Result<ZclStatus, DecodeError> {
    let raw = r.u8()?;
    ZclStatus::from_u8(raw).ok_or(DecodeError::UnknownStatus(raw))
}

// ═══════════════════════════════════════════════════════════════
//  File identifier
// ═══════════════════════════════════════════════════════════════

/// {manufacturer, image type, version}: names one firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileId {
    pub manufacturer: u16,
    pub image_type: u16,
    pub version: u32,
}

impl FileId {
    pub const LEN: usize = 8;

    pub const fn new(manufacturer: u16, image_type: u16, version: u32) -> Self {
        Self {
            manufacturer,
            image_type,
            version,
        }
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            manufacturer: r.u16()?,
            image_type: r.u16()?,
            version: r.u32()?,
        })
    }

    pub fn write(&self, out: &mut impl PutLe) -> Result<(), EncodeError> {
        out.put_u16(self.manufacturer)?;
        out.put_u16(self.image_type)?;
        out.put_u32(self.version)
    }

    /// Field-wise match where either side may carry the wildcard value.
    pub fn matches(&self, other: &FileId) -> bool {
        let mfr = self.manufacturer == other.manufacturer
            || self.manufacturer == MANUFACTURER_WILDCARD
            || other.manufacturer == MANUFACTURER_WILDCARD;
        let ty = self.image_type == other.image_type
            || self.image_type == IMAGE_TYPE_WILDCARD
            || other.image_type == IMAGE_TYPE_WILDCARD;
        let ver = self.version == other.version
            || self.version == VERSION_WILDCARD
            || other.version == VERSION_WILDCARD;
        mfr && ty && ver
    }

    /// Same manufacturer and image type, any version.
    pub fn same_product(&self, other: &FileId) -> bool {
        self.manufacturer == other.manufacturer && self.image_type == other.image_type
    }
}

// ═══════════════════════════════════════════════════════════════
//  Image Notify (server → client)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NotifyPayloadType {
    JitterOnly = 0,
    Manufacturer = 1,
    ImageType = 2,
    Version = 3,
}

impl NotifyPayloadType {
    const fn required_len(self) -> usize {
        match self {
            Self::JitterOnly => 2,
            Self::Manufacturer => 4,
            Self::ImageType => 6,
            Self::Version => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageNotify {
    pub payload_type: NotifyPayloadType,
    /// 1..=100; the share of receivers that should react.
    pub query_jitter: u8,
    pub manufacturer: Option<u16>,
    pub image_type: Option<u16>,
    pub file_version: Option<u32>,
}

impl ImageNotify {
    pub const MIN_LEN: usize = 2;
    pub const MAX_LEN: usize = 10;

    /// Notify carrying every filter tier up to and including `file_id.version`.
    pub const fn for_file(file_id: FileId, query_jitter: u8) -> Self {
        Self {
            payload_type: NotifyPayloadType::Version,
            query_jitter,
            manufacturer: Some(file_id.manufacturer),
            image_type: Some(file_id.image_type),
            file_version: Some(file_id.version),
        }
    }
}

impl WireRecord for ImageNotify {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        out.put_u8(self.payload_type as u8)?;
        out.put_u8(self.query_jitter)?;
        if self.payload_type >= NotifyPayloadType::Manufacturer {
            out.put_u16(self.manufacturer.unwrap_or(MANUFACTURER_WILDCARD))?;
        }
        if self.payload_type >= NotifyPayloadType::ImageType {
            out.put_u16(self.image_type.unwrap_or(IMAGE_TYPE_WILDCARD))?;
        }
        if self.payload_type >= NotifyPayloadType::Version {
            out.put_u32(self.file_version.unwrap_or(VERSION_WILDCARD))?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&payload.len()) {
            return Err(DecodeError::BadLength { len: payload.len() });
        }
        let mut r = Reader::new(payload);
        let payload_type = match r.u8()? {
            0 => NotifyPayloadType::JitterOnly,
            1 => NotifyPayloadType::Manufacturer,
            2 => NotifyPayloadType::ImageType,
            3 => NotifyPayloadType::Version,
            _ => return Err(DecodeError::BadField("payload type")),
        };
        if payload.len() < payload_type.required_len() {
            return Err(DecodeError::BadLength { len: payload.len() });
        }
        let query_jitter = r.u8()?;
        let manufacturer = if payload_type >= NotifyPayloadType::Manufacturer {
            Some(r.u16()?)
        } else {
            None
        };
        let image_type = if payload_type >= NotifyPayloadType::ImageType {
            Some(r.u16()?)
        } else {
            None
        };
        let file_version = if payload_type >= NotifyPayloadType::Version {
            Some(r.u32()?)
        } else {
            None
        };
        Ok(Self {
            payload_type,
            query_jitter,
            manufacturer,
            image_type,
            file_version,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Query Next Image (client → server, server → client)
// ═══════════════════════════════════════════════════════════════

const QUERY_FC_HW_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryNextImageReq {
    pub file_id: FileId,
    pub hardware_version: Option<u16>,
}

impl WireRecord for QueryNextImageReq {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        let fc = if self.hardware_version.is_some() {
            QUERY_FC_HW_VERSION
        } else {
            0
        };
        out.put_u8(fc)?;
        self.file_id.write(out)?;
        if let Some(hw) = self.hardware_version {
            out.put_u16(hw)?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[9, 11])?;
        let mut r = Reader::new(payload);
        let fc = r.u8()?;
        if fc & QUERY_FC_HW_VERSION != 0 {
            expect_len(payload, &[11])?;
        } else {
            expect_len(payload, &[9])?;
        }
        let file_id = FileId::read(&mut r)?;
        let hardware_version = if fc & QUERY_FC_HW_VERSION != 0 {
            Some(r.u16()?)
        } else {
            None
        };
        Ok(Self {
            file_id,
            hardware_version,
        })
    }
}

/// Payload shared by Query-Next-Image and Query-Specific-File responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryImageRsp {
    Offer { file_id: FileId, image_size: u32 },
    Unavailable(ZclStatus),
}

impl WireRecord for QueryImageRsp {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        match self {
            Self::Offer {
                file_id,
                image_size,
            } => {
                out.put_u8(ZclStatus::Success as u8)?;
                file_id.write(out)?;
                out.put_u32(*image_size)
            }
            Self::Unavailable(status) => out.put_u8(*status as u8),
        }
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[1, 13])?;
        let mut r = Reader::new(payload);
        let status = read_status(&mut r)?;
        if !status.is_success() {
            return Ok(Self::Unavailable(status));
        }
        if payload.len() != 13 {
            return Err(DecodeError::BadLength { len: payload.len() });
        }
        Ok(Self::Offer {
            file_id: FileId::read(&mut r)?,
            image_size: r.u32()?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Image Block (client → server, server → client)
// ═══════════════════════════════════════════════════════════════

/// Field-control bit: requesting node's IEEE address follows.
pub const BLOCK_FC_NODE_ADDR_PRESENT: u8 = 0x01;
/// Field-control bit: minimum block period follows (rate-limit support).
pub const BLOCK_FC_REQ_DELAY_PRESENT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBlockReq {
    pub file_id: FileId,
    pub file_offset: u32,
    pub max_data_size: u8,
    pub node_addr: Option<IeeeAddr>,
    /// Minimum block period in milliseconds.
    pub block_req_delay: Option<u16>,
}

impl ImageBlockReq {
    pub const MIN_LEN: usize = 14;

    pub fn field_control(&self) -> u8 {
        let mut fc = 0;
        if self.node_addr.is_some() {
            fc |= BLOCK_FC_NODE_ADDR_PRESENT;
        }
        if self.block_req_delay.is_some() {
            fc |= BLOCK_FC_REQ_DELAY_PRESENT;
        }
        fc
    }
}

impl WireRecord for ImageBlockReq {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        out.put_u8(self.field_control())?;
        self.file_id.write(out)?;
        out.put_u32(self.file_offset)?;
        out.put_u8(self.max_data_size)?;
        if let Some(addr) = self.node_addr {
            out.put_slice(&addr)?;
        }
        if let Some(delay) = self.block_req_delay {
            out.put_u16(delay)?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < Self::MIN_LEN {
            return Err(DecodeError::BadLength { len: payload.len() });
        }
        let mut r = Reader::new(payload);
        let fc = r.u8()?;
        let mut expected = Self::MIN_LEN;
        if fc & BLOCK_FC_NODE_ADDR_PRESENT != 0 {
            expected += 8;
        }
        if fc & BLOCK_FC_REQ_DELAY_PRESENT != 0 {
            expected += 2;
        }
        expect_len(payload, &[expected])?;
        let file_id = FileId::read(&mut r)?;
        let file_offset = r.u32()?;
        let max_data_size = r.u8()?;
        let node_addr = if fc & BLOCK_FC_NODE_ADDR_PRESENT != 0 {
            Some(r.array()?)
        } else {
            None
        };
        let block_req_delay = if fc & BLOCK_FC_REQ_DELAY_PRESENT != 0 {
            Some(r.u16()?)
        } else {
            None
        };
        Ok(Self {
            file_id,
            file_offset,
            max_data_size,
            node_addr,
            block_req_delay,
        })
    }
}

/// Image data carried by one block response.
pub type BlockData = heapless::Vec<u8, { OTA_MAX_MTU as usize }>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBlockRsp {
    Success {
        file_id: FileId,
        file_offset: u32,
        data: BlockData,
    },
    /// Flow control: come back later, or slow down.
    WaitForData {
        current_time: u32,
        request_time: u32,
        block_req_delay: u16,
    },
    Abort,
}

impl ImageBlockRsp {
    pub const SUCCESS_MIN_LEN: usize = 14;
    pub const WAIT_LEN: usize = 11;
}

impl WireRecord for ImageBlockRsp {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        match self {
            Self::Success {
                file_id,
                file_offset,
                data,
            } => {
                out.put_u8(ZclStatus::Success as u8)?;
                file_id.write(out)?;
                out.put_u32(*file_offset)?;
                out.put_u8(data.len() as u8)?;
                out.put_slice(data)
            }
            Self::WaitForData {
                current_time,
                request_time,
                block_req_delay,
            } => {
                out.put_u8(ZclStatus::WaitForData as u8)?;
                out.put_u32(*current_time)?;
                out.put_u32(*request_time)?;
                out.put_u16(*block_req_delay)
            }
            Self::Abort => out.put_u8(ZclStatus::Abort as u8),
        }
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        match read_status(&mut r)? {
            ZclStatus::Success => {
                if payload.len() < Self::SUCCESS_MIN_LEN {
                    return Err(DecodeError::BadLength { len: payload.len() });
                }
                let file_id = FileId::read(&mut r)?;
                let file_offset = r.u32()?;
                let size = r.u8()?;
                if size == 0 || size > OTA_MAX_MTU {
                    return Err(DecodeError::BadField("data size"));
                }
                expect_len(payload, &[Self::SUCCESS_MIN_LEN + size as usize])?;
                let data = BlockData::from_slice(r.take(size as usize)?)
                    .map_err(|()| DecodeError::BadField("data size"))?;
                Ok(Self::Success {
                    file_id,
                    file_offset,
                    data,
                })
            }
            ZclStatus::WaitForData => {
                expect_len(payload, &[Self::WAIT_LEN])?;
                Ok(Self::WaitForData {
                    current_time: r.u32()?,
                    request_time: r.u32()?,
                    block_req_delay: r.u16()?,
                })
            }
            ZclStatus::Abort => Ok(Self::Abort),
            other => Err(DecodeError::UnexpectedStatus(other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Image Page Request (client → server)
// ═══════════════════════════════════════════════════════════════

const PAGE_FC_NODE_ADDR_PRESENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePageReq {
    pub file_id: FileId,
    pub file_offset: u32,
    pub max_data_size: u8,
    pub page_size: u16,
    pub response_spacing: u16,
    pub node_addr: Option<IeeeAddr>,
}

impl WireRecord for ImagePageReq {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        let fc = if self.node_addr.is_some() {
            PAGE_FC_NODE_ADDR_PRESENT
        } else {
            0
        };
        out.put_u8(fc)?;
        self.file_id.write(out)?;
        out.put_u32(self.file_offset)?;
        out.put_u8(self.max_data_size)?;
        out.put_u16(self.page_size)?;
        out.put_u16(self.response_spacing)?;
        if let Some(addr) = self.node_addr {
            out.put_slice(&addr)?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[18, 26])?;
        let mut r = Reader::new(payload);
        let fc = r.u8()?;
        let file_id = FileId::read(&mut r)?;
        let file_offset = r.u32()?;
        let max_data_size = r.u8()?;
        let page_size = r.u16()?;
        let response_spacing = r.u16()?;
        let node_addr = if fc & PAGE_FC_NODE_ADDR_PRESENT != 0 {
            Some(r.array()?)
        } else {
            None
        };
        Ok(Self {
            file_id,
            file_offset,
            max_data_size,
            page_size,
            response_spacing,
            node_addr,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Upgrade End (client → server, server → client)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndReq {
    pub status: ZclStatus,
    pub file_id: Option<FileId>,
}

impl WireRecord for UpgradeEndReq {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        out.put_u8(self.status as u8)?;
        if let Some(file_id) = &self.file_id {
            file_id.write(out)?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[1, 9])?;
        let mut r = Reader::new(payload);
        let status = read_status(&mut r)?;
        let file_id = if payload.len() == 9 {
            Some(FileId::read(&mut r)?)
        } else {
            None
        };
        Ok(Self { status, file_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndRsp {
    pub file_id: FileId,
    /// Server's notion of now, in seconds.
    pub current_time: u32,
    /// When to apply, or [`UPGRADE_TIME_WAIT`](super::UPGRADE_TIME_WAIT).
    pub upgrade_time: u32,
}

impl WireRecord for UpgradeEndRsp {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        self.file_id.write(out)?;
        out.put_u32(self.current_time)?;
        out.put_u32(self.upgrade_time)
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[16])?;
        let mut r = Reader::new(payload);
        Ok(Self {
            file_id: FileId::read(&mut r)?,
            current_time: r.u32()?,
            upgrade_time: r.u32()?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Query Specific File (client → server)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySpecificFileReq {
    pub node_addr: IeeeAddr,
    pub file_id: FileId,
    pub stack_version: u16,
}

impl WireRecord for QuerySpecificFileReq {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        out.put_slice(&self.node_addr)?;
        self.file_id.write(out)?;
        out.put_u16(self.stack_version)
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[18])?;
        let mut r = Reader::new(payload);
        Ok(Self {
            node_addr: r.array()?,
            file_id: FileId::read(&mut r)?,
            stack_version: r.u16()?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Default Response (global)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRsp {
    pub command_id: u8,
    pub status: ZclStatus,
}

impl WireRecord for DefaultRsp {
    fn encode(&self, out: &mut Payload) -> Result<(), EncodeError> {
        out.put_u8(self.command_id)?;
        out.put_u8(self.status as u8)
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, &[2])?;
        let mut r = Reader::new(payload);
        Ok(Self {
            command_id: r.u8()?,
            status: read_status(&mut r)?,
        })
    }
}
