//! Log-based event sink adapters.
//!
//! [`LogEventSink`] renders every [`OtaEvent`] through the `log` facade
//! (stderr via `env_logger` in the host binary).  [`RecordingSink`] keeps
//! the events so tests and the simulation can assert on them.

use log::{info, warn};

use crate::app::events::OtaEvent;
use crate::app::ports::EventSink;
use crate::protocol::ZclStatus;

const PROGRESS_COLUMNS: u32 = 30;

/// Adapter that logs every [`OtaEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink {
    /// Tag prepended to each line, so several nodes can share one log.
    tag: String,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// `[#########.....................]  30%`
pub fn progress_bar(offset: u32, image_size: u32) -> String {
    let size = u64::from(image_size.max(1));
    let offset = u64::from(offset.min(image_size));
    let filled = (offset * u64::from(PROGRESS_COLUMNS) / size) as usize;
    let percent = offset * 100 / size;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        ".".repeat(PROGRESS_COLUMNS as usize - filled),
        percent
    )
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &OtaEvent) {
        let tag = &self.tag;
        match event {
            OtaEvent::ServerDiscovered(peer) => {
                info!("{tag}DISCOVER | server 0x{:04X} ep {}", peer.short_addr, peer.endpoint);
            }
            OtaEvent::ServerIeeeAddress { short_addr, ieee } => {
                info!("{tag}DISCOVER | 0x{short_addr:04X} is {ieee:02X?}");
            }
            OtaEvent::QueryResult { status } => info!("{tag}QUERY | {status:?}"),
            OtaEvent::QueryTimedOut => warn!("{tag}QUERY | timed out"),
            OtaEvent::StatusChanged { from, to } => info!("{tag}STATE | {from:?} -> {to:?}"),
            OtaEvent::DownloadStarted {
                file_id,
                image_size,
                server,
            } => info!(
                "{tag}DOWNLOAD | {:04X}/{:04X} v0x{:08X}, {} bytes from 0x{:04X}",
                file_id.manufacturer, file_id.image_type, file_id.version, image_size, server.short_addr
            ),
            OtaEvent::Progress { offset, image_size } => {
                info!("{tag}DOWNLOAD | {} {offset}/{image_size}", progress_bar(*offset, *image_size));
            }
            OtaEvent::DownloadFinished { status } => match status {
                ZclStatus::Success => info!("{tag}DOWNLOAD | finished"),
                other => warn!("{tag}DOWNLOAD | failed: {other:?}"),
            },
            OtaEvent::UpgradeScheduled { delay_secs } => {
                info!("{tag}UPGRADE | apply in {delay_secs} s");
            }
            OtaEvent::UpgradeWaiting => info!("{tag}UPGRADE | waiting for server go-ahead"),
            OtaEvent::ApplyingImage { file_id } => {
                info!("{tag}UPGRADE | applying v0x{:08X}, resetting", file_id.version);
            }
            OtaEvent::ApplyFailed => warn!("{tag}UPGRADE | staged image rejected"),
            OtaEvent::ImageQueried {
                peer,
                file_id,
                status,
            } => info!(
                "{tag}SERVE | 0x{:04X} queried v0x{:08X}: {status:?}",
                peer.short_addr, file_id.version
            ),
            OtaEvent::TransferEnded { peer, status } => {
                info!("{tag}SERVE | 0x{:04X} ended: {status:?}", peer.short_addr);
            }
        }
    }
}

/// Keeps every event; optionally logs them as well.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Vec<OtaEvent>,
    echo: Option<LogEventSink>,
}

impl RecordingSink {
    /// Record and also log through a tagged [`LogEventSink`].
    pub fn logging(tag: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            echo: Some(LogEventSink::tagged(tag)),
        }
    }

    pub fn events(&self) -> &[OtaEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<OtaEvent> {
        core::mem::take(&mut self.events)
    }

    /// Status of the most recent finished download.
    pub fn last_finish(&self) -> Option<ZclStatus> {
        self.events.iter().rev().find_map(|e| match e {
            OtaEvent::DownloadFinished { status } => Some(*status),
            _ => None,
        })
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &OtaEvent) {
        if let Some(log) = self.echo.as_mut() {
            log.emit(event);
        }
        self.events.push(event.clone());
    }
}
