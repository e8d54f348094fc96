//! In-memory file provider.
//!
//! [`ImageStore`] answers the server's provider requests from OTA files held
//! in memory.  Answers are not delivered synchronously: they queue up as
//! [`ServerEvent`]s that the host drains and posts back into the server,
//! the same way a serial-attached host tool would answer later.

use std::collections::VecDeque;

use log::{debug, info};

use crate::app::ports::{FileProvider, QueryKind};
use crate::client::image::{OtaHeader, TAG_UPGRADE_IMAGE};
use crate::error::{EncodeError, ProviderError};
use crate::events::{FileReadRsp, NextImageRsp, ServerEvent};
use crate::protocol::codec::PutLe;
use crate::protocol::{BlockData, FileId, PeerAddr, ZclStatus};

/// Wrap `payload` in a minimal OTA file: header plus one upgrade-image
/// sub-element.
pub fn build_ota_file(
    file_id: FileId,
    stack_version: u16,
    payload: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    let mut header = OtaHeader::new(file_id, stack_version, "zcl-ota image");
    let element_len = 6 + payload.len() as u32;
    header.total_image_size = u32::from(header.header_len()) + element_len;
    let mut out = Vec::with_capacity(header.total_image_size as usize);
    header.write(&mut out)?;
    out.put_u16(TAG_UPGRADE_IMAGE)?;
    out.put_u32(payload.len() as u32)?;
    out.put_slice(payload)?;
    Ok(out)
}

#[derive(Debug, Clone)]
struct StoredImage {
    file_id: FileId,
    data: Vec<u8>,
}

/// Provider request the store has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCall {
    NextImage { peer: PeerAddr, file_id: FileId },
    FileRead { peer: PeerAddr, offset: u32, len: u8 },
}

#[derive(Debug, Default)]
pub struct ImageStore {
    images: Vec<StoredImage>,
    answers: VecDeque<ServerEvent>,
    calls: Vec<ProviderCall>,
    reports: Vec<(PeerAddr, Option<FileId>, ZclStatus)>,
    /// Refuse every request (side channel down).
    offline: bool,
    /// Refuse this many upcoming reads with `Busy`.
    busy_reads: u32,
    /// Answer reads with a failure status.
    failing_reads: bool,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, file_id: FileId, data: Vec<u8>) {
        info!(
            "ImageStore: added {:04X}/{:04X} v0x{:08X} ({} bytes)",
            file_id.manufacturer,
            file_id.image_type,
            file_id.version,
            data.len()
        );
        self.images.push(StoredImage { file_id, data });
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn set_busy_reads(&mut self, count: u32) {
        self.busy_reads = count;
    }

    pub fn set_failing_reads(&mut self, failing: bool) {
        self.failing_reads = failing;
    }

    /// Answers not yet handed to the server.
    pub fn drain_answers(&mut self) -> Vec<ServerEvent> {
        self.answers.drain(..).collect()
    }

    pub fn calls(&self) -> &[ProviderCall] {
        &self.calls
    }

    pub fn reports(&self) -> &[(PeerAddr, Option<FileId>, ZclStatus)] {
        &self.reports
    }

    fn find_offer(&self, file_id: FileId, query: QueryKind) -> Option<&StoredImage> {
        let mut candidates = self
            .images
            .iter()
            .filter(|img| img.file_id.same_product(&file_id));
        match query {
            QueryKind::Next => candidates
                .filter(|img| img.file_id.version > file_id.version)
                .max_by_key(|img| img.file_id.version),
            QueryKind::Specific { .. } => {
                candidates.find(|img| img.file_id.version == file_id.version)
            }
        }
    }
}

impl FileProvider for ImageStore {
    fn request_next_image(
        &mut self,
        peer: PeerAddr,
        file_id: FileId,
        _hardware_version: Option<u16>,
        query: QueryKind,
    ) -> Result<(), ProviderError> {
        if self.offline {
            return Err(ProviderError::Unavailable);
        }
        self.calls.push(ProviderCall::NextImage { peer, file_id });
        let rsp = match self.find_offer(file_id, query) {
            Some(img) => NextImageRsp {
                peer,
                status: ZclStatus::Success,
                file_id: img.file_id,
                image_size: img.data.len() as u32,
                query,
            },
            None => NextImageRsp {
                peer,
                status: ZclStatus::NoImageAvailable,
                file_id,
                image_size: 0,
                query,
            },
        };
        debug!("ImageStore: next image for 0x{:04X}: {:?}", peer.short_addr, rsp.status);
        self.answers.push_back(ServerEvent::NextImage(rsp));
        Ok(())
    }

    fn request_file_read(
        &mut self,
        peer: PeerAddr,
        file_id: FileId,
        offset: u32,
        len: u8,
    ) -> Result<(), ProviderError> {
        if self.offline {
            return Err(ProviderError::Unavailable);
        }
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            return Err(ProviderError::Busy);
        }
        self.calls.push(ProviderCall::FileRead { peer, offset, len });

        let chunk = self
            .images
            .iter()
            .find(|img| img.file_id == file_id)
            .and_then(|img| {
                let start = offset as usize;
                let end = (start + usize::from(len)).min(img.data.len());
                img.data.get(start..end)
            })
            .and_then(|bytes| BlockData::from_slice(bytes).ok());
        let rsp = match chunk {
            Some(data) if !self.failing_reads => FileReadRsp {
                peer,
                status: ZclStatus::Success,
                file_id,
                offset,
                data,
            },
            _ => FileReadRsp {
                peer,
                status: ZclStatus::Failure,
                file_id,
                offset,
                data: BlockData::new(),
            },
        };
        self.answers.push_back(ServerEvent::FileRead(rsp));
        Ok(())
    }

    fn report_status(&mut self, peer: PeerAddr, file_id: Option<FileId>, status: ZclStatus) {
        self.reports.push((peer, file_id, status));
    }
}
