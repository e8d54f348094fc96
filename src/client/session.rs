//! Per-download state of the client.

use crate::protocol::{FileId, OTA_MAX_MTU, PeerAddr};

use super::image::ImageParser;

/// One download in flight.  Created when a server offers an image and
/// dropped when the transfer finishes, aborts or gives up.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub file_id: FileId,
    pub image_size: u32,
    /// Next byte expected from the server.
    pub offset: u32,
    pub server: PeerAddr,
    pub(crate) parser: ImageParser,
}

impl TransferSession {
    pub fn new(file_id: FileId, image_size: u32, server: PeerAddr) -> Self {
        Self {
            file_id,
            image_size,
            offset: 0,
            server,
            parser: ImageParser::new(file_id, image_size),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.image_size.saturating_sub(self.offset)
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.image_size
    }

    /// Size to ask for in the next block request.
    pub fn next_block_len(&self, configured: u8) -> u8 {
        let cap = u32::from(configured.min(OTA_MAX_MTU));
        self.remaining().min(cap) as u8
    }
}
