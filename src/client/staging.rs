//! Staged-image bookkeeping on top of a [`StagingPort`].
//!
//! ```text
//!  page 0            page 1 ..
//!  ┌───────────────┐ ┌──────────────────────────────────────┐
//!  │ len │ meta    │ │ upgrade-image payload, page by page   │
//!  └───────────────┘ └──────────────────────────────────────┘
//! ```
//!
//! The metadata record is postcard-encoded behind a one-byte length.  An
//! erased page reads back as `0xFF` and therefore as "no staged image".

use crc::{CRC_32_ISO_HDLC, Crc, Digest};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::StagingPort;
use crate::error::{ImageError, StorageError};
use crate::protocol::FileId;

/// CRC over the staged payload.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const META_MAGIC: u32 = 0x4F54_4131;
const META_BUF_LEN: usize = 64;
const META_PAGE: u32 = 0;
const FIRST_DATA_PAGE: u32 = 1;
const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrcStatus {
    /// Never checked against the payload.
    Unchecked,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    Default,
    /// The bootloader should copy this image on the next reset.
    NeedCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedImageMeta {
    pub magic: u32,
    pub file_id: FileId,
    pub image_len: u32,
    pub crc32: u32,
    pub crc_status: CrcStatus,
    pub copy_status: CopyStatus,
}

struct ActiveStage {
    file_id: FileId,
    written: u32,
    digest: Digest<'static, u32>,
}

/// Writes one upgrade image into the staging region and seals it with a
/// metadata record.
#[derive(Default)]
pub struct ImageStager {
    active: Option<ActiveStage>,
}

impl ImageStager {
    pub const fn new() -> Self {
        Self { active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Payload bytes written in the current stage.
    pub fn written(&self) -> u32 {
        self.active.as_ref().map_or(0, |a| a.written)
    }

    /// Payload capacity of the region (metadata page excluded).
    pub fn capacity(storage: &dyn StagingPort) -> u32 {
        storage
            .page_count()
            .saturating_sub(FIRST_DATA_PAGE)
            .saturating_mul(storage.page_size())
    }

    /// Open the region for a new image of at most `image_size` bytes and
    /// invalidate any previous metadata.
    pub fn begin(
        &mut self,
        storage: &mut dyn StagingPort,
        file_id: FileId,
        image_size: u32,
    ) -> Result<(), ImageError> {
        let capacity = Self::capacity(storage);
        if image_size > capacity {
            return Err(ImageError::TooLarge {
                len: image_size,
                capacity,
            });
        }
        if self.active.is_some() {
            storage.close();
        }
        storage.open()?;
        if let Err(e) = storage.erase_page(META_PAGE) {
            storage.close();
            return Err(e.into());
        }
        self.active = Some(ActiveStage {
            file_id,
            written: 0,
            digest: CRC32.digest(),
        });
        info!("Staging: region opened for {image_size} bytes (capacity {capacity})");
        Ok(())
    }

    /// Append payload bytes, erasing each page as it is first touched.
    pub fn write(&mut self, storage: &mut dyn StagingPort, mut data: &[u8]) -> Result<(), ImageError> {
        let page_size = storage.page_size();
        let capacity = Self::capacity(storage);
        let Some(active) = self.active.as_mut() else {
            return Err(StorageError::NotOpen.into());
        };
        let end = u64::from(active.written) + data.len() as u64;
        if end > u64::from(capacity) {
            return Err(ImageError::TooLarge {
                len: end.min(u64::from(u32::MAX)) as u32,
                capacity,
            });
        }

        while !data.is_empty() {
            let page = FIRST_DATA_PAGE + active.written / page_size;
            let offset = active.written % page_size;
            if offset == 0 {
                storage.erase_page(page)?;
            }
            let n = ((page_size - offset) as usize).min(data.len());
            storage.write_page(page, offset, &data[..n])?;
            active.digest.update(&data[..n]);
            active.written += n as u32;
            data = &data[n..];
        }
        Ok(())
    }

    /// Seal the staged image: write the metadata record and close.
    pub fn finish(&mut self, storage: &mut dyn StagingPort) -> Result<StagedImageMeta, ImageError> {
        let Some(active) = self.active.take() else {
            return Err(StorageError::NotOpen.into());
        };
        if active.written == 0 {
            storage.close();
            return Err(ImageError::MissingPayload);
        }
        let meta = StagedImageMeta {
            magic: META_MAGIC,
            file_id: active.file_id,
            image_len: active.written,
            crc32: active.digest.finalize(),
            crc_status: CrcStatus::Valid,
            copy_status: CopyStatus::Default,
        };
        let result = write_meta(storage, &meta);
        storage.close();
        result?;
        info!(
            "Staging: sealed {} bytes, crc 0x{:08X}",
            meta.image_len, meta.crc32
        );
        Ok(meta)
    }

    /// Drop the current stage without sealing it.
    pub fn abort(&mut self, storage: &mut dyn StagingPort) {
        if self.active.take().is_some() {
            debug!("Staging: aborted");
            storage.close();
        }
    }
}

// ── Metadata record ───────────────────────────────────────────

fn write_meta(storage: &mut dyn StagingPort, meta: &StagedImageMeta) -> Result<(), ImageError> {
    let mut buf = [0u8; META_BUF_LEN];
    let used = postcard::to_slice(meta, &mut buf[1..])
        .map_err(|_| ImageError::Storage(StorageError::Io))?
        .len();
    buf[0] = used as u8;
    storage.erase_page(META_PAGE)?;
    storage.write_page(META_PAGE, 0, &buf[..=used])?;
    Ok(())
}

fn load_meta(storage: &mut dyn StagingPort) -> Result<StagedImageMeta, ImageError> {
    let mut buf = [0u8; META_BUF_LEN];
    storage.read_page(META_PAGE, 0, &mut buf)?;
    let len = usize::from(buf[0]);
    if len == 0 || len >= META_BUF_LEN {
        return Err(ImageError::NoStagedImage);
    }
    let meta: StagedImageMeta =
        postcard::from_bytes(&buf[1..=len]).map_err(|_| ImageError::NoStagedImage)?;
    if meta.magic != META_MAGIC {
        return Err(ImageError::NoStagedImage);
    }
    Ok(meta)
}

fn staged_crc(storage: &mut dyn StagingPort, image_len: u32) -> Result<u32, ImageError> {
    let page_size = storage.page_size();
    let mut digest = CRC32.digest();
    let mut buf = [0u8; READ_CHUNK];
    let mut pos = 0u32;
    while pos < image_len {
        let page = FIRST_DATA_PAGE + pos / page_size;
        let offset = pos % page_size;
        let n = (READ_CHUNK as u32)
            .min(page_size - offset)
            .min(image_len - pos) as usize;
        storage.read_page(page, offset, &mut buf[..n])?;
        digest.update(&buf[..n]);
        pos += n as u32;
    }
    Ok(digest.finalize())
}

/// Run `f` with the region open, closing it afterwards either way.
fn with_open<T>(
    storage: &mut dyn StagingPort,
    f: impl FnOnce(&mut dyn StagingPort) -> Result<T, ImageError>,
) -> Result<T, ImageError> {
    storage.open()?;
    let result = f(&mut *storage);
    storage.close();
    result
}

/// Read the metadata record of the staged image.
pub fn read_meta(storage: &mut dyn StagingPort) -> Result<StagedImageMeta, ImageError> {
    with_open(storage, load_meta)
}

/// Recompute the payload CRC and compare it with the metadata record.
pub fn verify_staged(storage: &mut dyn StagingPort) -> Result<StagedImageMeta, ImageError> {
    with_open(storage, |s| {
        let meta = load_meta(s)?;
        let actual = staged_crc(s, meta.image_len)?;
        if actual != meta.crc32 {
            warn!(
                "Staging: CRC mismatch (recorded 0x{:08X}, read 0x{actual:08X})",
                meta.crc32
            );
            return Err(ImageError::CrcMismatch {
                expected: meta.crc32,
                actual,
            });
        }
        Ok(meta)
    })
}

/// Verify the staged image and flag it for the bootloader to copy.
pub fn mark_pending_copy(storage: &mut dyn StagingPort) -> Result<StagedImageMeta, ImageError> {
    with_open(storage, |s| {
        let mut meta = load_meta(s)?;
        let actual = staged_crc(s, meta.image_len)?;
        if actual != meta.crc32 {
            meta.crc_status = CrcStatus::Invalid;
            write_meta(s, &meta)?;
            return Err(ImageError::CrcMismatch {
                expected: meta.crc32,
                actual,
            });
        }
        meta.crc_status = CrcStatus::Valid;
        meta.copy_status = CopyStatus::NeedCopy;
        write_meta(s, &meta)?;
        info!("Staging: image {:?} marked for copy", meta.file_id);
        Ok(meta)
    })
}
