//! Streaming parser for the OTA upgrade file format.
//!
//! The server hands out the file in arbitrary block sizes, so the parser
//! keeps just enough state to resume mid-field:
//!
//! ```text
//!  ┌──────────── header (56..=69 B) ────────────┐┌─ element ─┐┌─ element ─┐
//!  │ magic │ hver │ hlen │ fc │ file id │ ... │ ││tag│len│data││tag│len│data│ ...
//!  └────────────────────────────────────────────┘└───────────┘└───────────┘
//!                                                 tag 0x0000 = upgrade image
//! ```
//!
//! Only the upgrade-image element is forwarded to the stager; signature and
//! certificate elements are consumed and skipped.

use crate::error::{EncodeError, ImageError};
use crate::protocol::codec::{PutLe, Reader};
use crate::protocol::{FileId, IeeeAddr};

pub const OTA_HEADER_MAGIC: u32 = 0x0BEE_F11E;
pub const OTA_HEADER_VERSION: u16 = 0x0100;
pub const OTA_HEADER_MIN_LEN: u16 = 56;
pub const OTA_HEADER_MAX_LEN: u16 = 69;
pub const OTA_HEADER_STR_LEN: usize = 32;

/// Sub-element tags.
pub const TAG_UPGRADE_IMAGE: u16 = 0x0000;
pub const TAG_ECDSA_SIGNATURE: u16 = 0x0001;
pub const TAG_ECDSA_CERTIFICATE: u16 = 0x0002;

const ELEMENT_HEADER_LEN: usize = 6;
/// Bytes needed before the header length is known.
const HEADER_PREFIX_LEN: usize = 8;

const HDR_FC_SECURITY_CREDENTIAL: u16 = 0x0001;
const HDR_FC_DEVICE_SPECIFIC: u16 = 0x0002;
const HDR_FC_HARDWARE_VERSIONS: u16 = 0x0004;

// ═══════════════════════════════════════════════════════════════
//  File header
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaHeader {
    pub header_version: u16,
    pub file_id: FileId,
    pub stack_version: u16,
    pub header_string: [u8; OTA_HEADER_STR_LEN],
    pub total_image_size: u32,
    pub security_credential_version: Option<u8>,
    pub destination: Option<IeeeAddr>,
    pub hardware_versions: Option<(u16, u16)>,
}

impl OtaHeader {
    /// Minimal header; `total_image_size` still has to be filled in.
    pub fn new(file_id: FileId, stack_version: u16, label: &str) -> Self {
        let mut header_string = [0u8; OTA_HEADER_STR_LEN];
        let n = label.len().min(OTA_HEADER_STR_LEN);
        header_string[..n].copy_from_slice(&label.as_bytes()[..n]);
        Self {
            header_version: OTA_HEADER_VERSION,
            file_id,
            stack_version,
            header_string,
            total_image_size: 0,
            security_credential_version: None,
            destination: None,
            hardware_versions: None,
        }
    }

    fn field_control(&self) -> u16 {
        let mut fc = 0;
        if self.security_credential_version.is_some() {
            fc |= HDR_FC_SECURITY_CREDENTIAL;
        }
        if self.destination.is_some() {
            fc |= HDR_FC_DEVICE_SPECIFIC;
        }
        if self.hardware_versions.is_some() {
            fc |= HDR_FC_HARDWARE_VERSIONS;
        }
        fc
    }

    pub fn header_len(&self) -> u16 {
        let mut len = OTA_HEADER_MIN_LEN;
        if self.security_credential_version.is_some() {
            len += 1;
        }
        if self.destination.is_some() {
            len += 8;
        }
        if self.hardware_versions.is_some() {
            len += 4;
        }
        len
    }

    pub fn write(&self, out: &mut impl PutLe) -> Result<(), EncodeError> {
        out.put_u32(OTA_HEADER_MAGIC)?;
        out.put_u16(self.header_version)?;
        out.put_u16(self.header_len())?;
        out.put_u16(self.field_control())?;
        self.file_id.write(out)?;
        out.put_u16(self.stack_version)?;
        out.put_slice(&self.header_string)?;
        out.put_u32(self.total_image_size)?;
        if let Some(v) = self.security_credential_version {
            out.put_u8(v)?;
        }
        if let Some(addr) = self.destination {
            out.put_slice(&addr)?;
        }
        if let Some((min, max)) = self.hardware_versions {
            out.put_u16(min)?;
            out.put_u16(max)?;
        }
        Ok(())
    }

    /// Parse a complete header (exactly `header_len` bytes).
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let bad_len = ImageError::BadHeaderLength(bytes.len() as u16);
        let mut r = Reader::new(bytes);
        let magic = r.u32().map_err(|_| bad_len)?;
        if magic != OTA_HEADER_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        let header_version = r.u16().map_err(|_| bad_len)?;
        let header_len = r.u16().map_err(|_| bad_len)?;
        if usize::from(header_len) != bytes.len() {
            return Err(ImageError::BadHeaderLength(header_len));
        }
        let fc = r.u16().map_err(|_| bad_len)?;
        let file_id = FileId::read(&mut r).map_err(|_| bad_len)?;
        let stack_version = r.u16().map_err(|_| bad_len)?;
        let header_string = r.array().map_err(|_| bad_len)?;
        let total_image_size = r.u32().map_err(|_| bad_len)?;
        let security_credential_version = if fc & HDR_FC_SECURITY_CREDENTIAL != 0 {
            Some(r.u8().map_err(|_| bad_len)?)
        } else {
            None
        };
        let destination = if fc & HDR_FC_DEVICE_SPECIFIC != 0 {
            Some(r.array().map_err(|_| bad_len)?)
        } else {
            None
        };
        let hardware_versions = if fc & HDR_FC_HARDWARE_VERSIONS != 0 {
            Some((r.u16().map_err(|_| bad_len)?, r.u16().map_err(|_| bad_len)?))
        } else {
            None
        };
        Ok(Self {
            header_version,
            file_id,
            stack_version,
            header_string,
            total_image_size,
            security_credential_version,
            destination,
            hardware_versions,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Streaming parser
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    ElementHeader,
    ElementData { tag: u16, remaining: u32 },
    Done,
}

#[derive(Debug, Clone)]
pub struct ImageParser {
    expected: FileId,
    offered_size: u32,
    state: ParseState,
    buf: heapless::Vec<u8, { OTA_HEADER_MAX_LEN as usize }>,
    header_len: Option<u16>,
    header: Option<OtaHeader>,
    consumed: u32,
    payload_len: u32,
}

impl ImageParser {
    pub fn new(expected: FileId, offered_size: u32) -> Self {
        Self {
            expected,
            offered_size,
            state: ParseState::Header,
            buf: heapless::Vec::new(),
            header_len: None,
            header: None,
            consumed: 0,
            payload_len: 0,
        }
    }

    pub fn header(&self) -> Option<&OtaHeader> {
        self.header.as_ref()
    }

    /// Bytes of upgrade-image payload forwarded so far.
    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }

    /// The whole file was consumed on an element boundary.
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Done
    }

    /// Consume the next slice of the file, forwarding upgrade-image bytes
    /// to `sink` in order.
    pub fn feed(
        &mut self,
        mut data: &[u8],
        sink: &mut dyn FnMut(&[u8]) -> Result<(), ImageError>,
    ) -> Result<(), ImageError> {
        if u64::from(self.consumed) + data.len() as u64 > u64::from(self.offered_size) {
            return Err(ImageError::Overrun);
        }
        while !data.is_empty() {
            let used = match self.state {
                ParseState::Header => self.feed_header(data)?,
                ParseState::ElementHeader => self.feed_element_header(data)?,
                ParseState::ElementData { tag, remaining } => {
                    let n = (remaining as usize).min(data.len());
                    if tag == TAG_UPGRADE_IMAGE {
                        sink(&data[..n])?;
                        self.payload_len += n as u32;
                    }
                    let remaining = remaining - n as u32;
                    self.state = if remaining == 0 {
                        ParseState::ElementHeader
                    } else {
                        ParseState::ElementData { tag, remaining }
                    };
                    n
                }
                ParseState::Done => return Err(ImageError::Overrun),
            };
            self.consumed += used as u32;
            data = &data[used..];
            self.check_done();
        }
        Ok(())
    }

    // ── Internal ──────────────────────────────────────────────

    fn check_done(&mut self) {
        if self.state == ParseState::ElementHeader
            && self.buf.is_empty()
            && self.header.is_some_and(|h| h.total_image_size == self.consumed)
        {
            self.state = ParseState::Done;
        }
    }

    fn fill(&mut self, data: &[u8], target: usize) -> usize {
        let n = target.saturating_sub(self.buf.len()).min(data.len());
        // Capacity covers the largest header, and targets never exceed it.
        let _ = self.buf.extend_from_slice(&data[..n]);
        n
    }

    fn feed_header(&mut self, data: &[u8]) -> Result<usize, ImageError> {
        let target = match self.header_len {
            Some(len) => usize::from(len),
            None => HEADER_PREFIX_LEN,
        };
        let used = self.fill(data, target);
        if self.buf.len() < target {
            return Ok(used);
        }

        if self.header_len.is_none() {
            let magic = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if magic != OTA_HEADER_MAGIC {
                return Err(ImageError::BadMagic(magic));
            }
            let len = u16::from_le_bytes([self.buf[6], self.buf[7]]);
            if !(OTA_HEADER_MIN_LEN..=OTA_HEADER_MAX_LEN).contains(&len) {
                return Err(ImageError::BadHeaderLength(len));
            }
            self.header_len = Some(len);
            return Ok(used);
        }

        let header = OtaHeader::parse(&self.buf)?;
        if header.file_id != self.expected {
            return Err(ImageError::FileIdMismatch);
        }
        if header.total_image_size != self.offered_size {
            return Err(ImageError::SizeMismatch {
                header: header.total_image_size,
                offered: self.offered_size,
            });
        }
        self.header = Some(header);
        self.buf.clear();
        self.state = ParseState::ElementHeader;
        Ok(used)
    }

    fn feed_element_header(&mut self, data: &[u8]) -> Result<usize, ImageError> {
        let used = self.fill(data, ELEMENT_HEADER_LEN);
        if self.buf.len() < ELEMENT_HEADER_LEN {
            return Ok(used);
        }
        let tag = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        let len = u32::from_le_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
        self.buf.clear();

        let end = u64::from(self.consumed) + used as u64 + u64::from(len);
        if end > u64::from(self.offered_size) {
            return Err(ImageError::Overrun);
        }
        if len > 0 {
            self.state = ParseState::ElementData { tag, remaining: len };
        }
        Ok(used)
    }
}
