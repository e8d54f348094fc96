//! OTA Upgrade server engine.
//!
//! [`OtaServer`] does not hold images itself.  It validates client requests,
//! forwards them to an asynchronous [`FileProvider`], and relays the
//! provider's answers back with the sequence number of the request they
//! answer.
//!
//! ```text
//!  client ──QNI/QSF/Block req──▶ OtaServer ──request_*──▶ FileProvider
//!     ▲                              │ seq table                │
//!     └──────── response ◀───────────┴◀── NextImage / FileRead ─┘
//! ```

pub mod seq_table;

use log::{debug, info, warn};

use crate::app::dispatch::{Gate, finish, gate, send_command};
use crate::app::events::OtaEvent;
use crate::app::ports::{EventSink, FileProvider, QueryKind, ZclTransport};
use crate::config::ServerConfig;
use crate::events::{EventQueue, FileReadRsp, InboundFrame, NextImageRsp, ServerEvent};
use crate::protocol::frame::default_response;
use crate::protocol::{
    CommandId, Direction, Disposition, FileId, IMAGE_TYPE_WILDCARD, ImageBlockReq, ImageBlockRsp,
    ImageNotify, ImagePageReq, MANUFACTURER_WILDCARD, OTA_MAX_MTU, PeerAddr, QueryImageRsp,
    QueryNextImageReq, QuerySpecificFileReq, SeqCounter, UpgradeEndReq, UpgradeEndRsp,
    VERSION_WILDCARD, WireRecord, ZclHeader, ZclStatus,
};

use self::seq_table::SeqNumTable;

/// Collaborators the server reaches during one call.
pub struct ServerPorts<'a> {
    pub transport: &'a mut dyn ZclTransport,
    pub provider: &'a mut dyn FileProvider,
    pub sink: &'a mut dyn EventSink,
}

pub struct OtaServer {
    config: ServerConfig,
    seq_table: SeqNumTable,
    /// Fallback and server-initiated sequence numbers.
    seq: SeqCounter,
    /// File most recently offered to any client.
    last_offer: Option<FileId>,
    queue: EventQueue<ServerEvent>,
    now_ms: u64,
}

impl OtaServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            seq_table: SeqNumTable::new(),
            seq: SeqCounter::default(),
            last_offer: None,
            queue: EventQueue::new(),
            now_ms: 0,
        }
    }

    /// Queue an event for the next [`poll`](Self::poll).
    pub fn post(&mut self, event: ServerEvent) -> bool {
        self.queue.push(event)
    }

    pub fn post_frame(&mut self, frame: InboundFrame) -> bool {
        self.post(ServerEvent::Frame(frame))
    }

    /// Handle every queued event.
    pub fn poll(&mut self, now_ms: u64, ports: &mut ServerPorts<'_>) {
        self.now_ms = self.now_ms.max(now_ms);
        while let Some(event) = self.queue.pop() {
            match event {
                ServerEvent::Frame(frame) => self.handle_frame(&frame, ports),
                ServerEvent::NextImage(rsp) => self.on_next_image(rsp, ports),
                ServerEvent::FileRead(rsp) => self.on_file_read(rsp, ports),
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Announce an image to `dst` (unicast or broadcast).
    pub fn send_image_notify(
        &mut self,
        dst: PeerAddr,
        notify: &ImageNotify,
        ports: &mut ServerPorts<'_>,
    ) -> bool {
        let seq = self.seq.next_seq();
        info!(
            "OtaServer: image notify to 0x{:04X} (jitter {})",
            dst.short_addr, notify.query_jitter
        );
        send_command(&mut *ports.transport, dst, CommandId::ImageNotify, seq, notify)
    }

    pub fn last_offer(&self) -> Option<FileId> {
        self.last_offer
    }

    pub fn seq_table(&self) -> &SeqNumTable {
        &self.seq_table
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn now_secs(&self) -> u32 {
        (self.now_ms / 1000).min(u64::from(u32::MAX - 1)) as u32
    }

    // ── Inbound frames ────────────────────────────────────────

    fn handle_frame(&mut self, frame: &InboundFrame, ports: &mut ServerPorts<'_>) {
        match gate(frame, self.config.endpoint, Direction::ClientToServer) {
            Gate::Drop => {}
            Gate::Reply { header, status } => {
                finish(&mut *ports.transport, frame, &header, Disposition::Status(status));
            }
            Gate::Handle {
                header,
                command,
                payload,
            } => {
                let src = frame.src;
                let disposition = match command {
                    CommandId::QueryNextImageReq => {
                        match QueryNextImageReq::decode(payload) {
                            Ok(req) => self.forward_query(
                                src,
                                header.seq_num,
                                req.file_id,
                                req.hardware_version,
                                QueryKind::Next,
                                ports,
                            ),
                            Err(e) => malformed(command, e),
                        }
                    }
                    CommandId::QuerySpecificFileReq => match QuerySpecificFileReq::decode(payload) {
                        Ok(req) => self.forward_query(
                            src,
                            header.seq_num,
                            req.file_id,
                            None,
                            QueryKind::Specific {
                                node_addr: req.node_addr,
                                stack_version: req.stack_version,
                            },
                            ports,
                        ),
                        Err(e) => malformed(command, e),
                    },
                    CommandId::ImageBlockReq => match ImageBlockReq::decode(payload) {
                        Ok(req) => self.on_block_req(src, header.seq_num, &req, ports),
                        Err(e) => malformed(command, e),
                    },
                    CommandId::ImagePageReq => match ImagePageReq::decode(payload) {
                        Ok(_) => Disposition::Status(ZclStatus::UnsupClusterCommand),
                        Err(e) => malformed(command, e),
                    },
                    CommandId::UpgradeEndReq => match UpgradeEndReq::decode(payload) {
                        Ok(req) => self.on_upgrade_end(frame, &header, &req, ports),
                        Err(e) => malformed(command, e),
                    },
                    _ => Disposition::Status(ZclStatus::UnsupClusterCommand),
                };
                finish(&mut *ports.transport, frame, &header, disposition);
            }
        }
    }

    fn forward_query(
        &mut self,
        src: PeerAddr,
        seq_num: u8,
        file_id: FileId,
        hardware_version: Option<u16>,
        query: QueryKind,
        ports: &mut ServerPorts<'_>,
    ) -> Disposition {
        let forwarded = self.config.permit
            && match ports
                .provider
                .request_next_image(src, file_id, hardware_version, query)
            {
                Ok(()) => true,
                Err(e) => {
                    warn!("OtaServer: provider refused query from 0x{:04X}: {e}", src.short_addr);
                    false
                }
            };
        if forwarded {
            debug!("OtaServer: query from 0x{:04X} forwarded", src.short_addr);
            self.seq_table.insert(src.short_addr, seq_num);
        } else {
            let rsp = QueryImageRsp::Unavailable(ZclStatus::NoImageAvailable);
            send_command(&mut *ports.transport, src, query_rsp_command(query), seq_num, &rsp);
        }
        Disposition::Responded
    }

    fn on_block_req(
        &mut self,
        src: PeerAddr,
        seq_num: u8,
        req: &ImageBlockReq,
        ports: &mut ServerPorts<'_>,
    ) -> Disposition {
        if self.last_offer != Some(req.file_id) {
            warn!(
                "OtaServer: block request for {:?}, not the offered image",
                req.file_id
            );
            return Disposition::Status(ZclStatus::NoImageAvailable);
        }
        if !self.config.permit {
            return Disposition::Status(ZclStatus::Failure);
        }
        let len = req
            .max_data_size
            .min(self.config.max_mtu)
            .min(OTA_MAX_MTU);
        let server_delay = self.config.min_block_req_delay_ms;

        if req.block_req_delay.is_some_and(|d| d != server_delay) {
            debug!("OtaServer: 0x{:04X} told to pace at {server_delay} ms", src.short_addr);
            let rsp = ImageBlockRsp::WaitForData {
                current_time: 0,
                request_time: 0,
                block_req_delay: server_delay,
            };
            send_command(&mut *ports.transport, src, CommandId::ImageBlockRsp, seq_num, &rsp);
            return Disposition::Responded;
        }

        match ports
            .provider
            .request_file_read(src, req.file_id, req.file_offset, len)
        {
            Ok(()) => {
                self.seq_table.insert(src.short_addr, seq_num);
            }
            Err(e) => {
                warn!("OtaServer: provider cannot read block: {e}");
                let rsp = ImageBlockRsp::WaitForData {
                    current_time: 0,
                    request_time: self.config.send_block_wait_secs,
                    block_req_delay: server_delay,
                };
                send_command(&mut *ports.transport, src, CommandId::ImageBlockRsp, seq_num, &rsp);
            }
        }
        Disposition::Responded
    }

    fn on_upgrade_end(
        &mut self,
        frame: &InboundFrame,
        header: &ZclHeader,
        req: &UpgradeEndReq,
        ports: &mut ServerPorts<'_>,
    ) -> Disposition {
        let src = frame.src;
        info!("OtaServer: 0x{:04X} ended transfer with {:?}", src.short_addr, req.status);
        ports.provider.report_status(src, req.file_id, req.status);
        ports.sink.emit(&OtaEvent::TransferEnded {
            peer: src,
            status: req.status,
        });

        if req.status.is_success() {
            let now = self.now_secs();
            let rsp = UpgradeEndRsp {
                file_id: req.file_id.unwrap_or(FileId::new(
                    MANUFACTURER_WILDCARD,
                    IMAGE_TYPE_WILDCARD,
                    VERSION_WILDCARD,
                )),
                current_time: now,
                upgrade_time: now.saturating_add(self.config.upgrade_delay_secs),
            };
            send_command(&mut *ports.transport, src, CommandId::UpgradeEndRsp, header.seq_num, &rsp);
            return Disposition::Responded;
        }

        if !frame.was_broadcast {
            match default_response(header, ZclStatus::Success) {
                Ok(ack) => {
                    if let Err(e) = ports.transport.send(src, &ack) {
                        warn!("OtaServer: upgrade-end ack failed: {e}");
                    }
                }
                Err(e) => warn!("OtaServer: upgrade-end ack encode failed: {e}"),
            }
        }
        Disposition::Responded
    }

    // ── Provider answers ──────────────────────────────────────

    fn reply_seq(&mut self, peer: PeerAddr) -> u8 {
        match self.seq_table.take(peer.short_addr) {
            Some(seq) => seq,
            None => {
                let seq = self.seq.next_seq();
                debug!("OtaServer: no parked seq for 0x{:04X}, using {seq}", peer.short_addr);
                seq
            }
        }
    }

    fn on_next_image(&mut self, rsp: NextImageRsp, ports: &mut ServerPorts<'_>) {
        let seq = self.reply_seq(rsp.peer);
        let record = if rsp.status.is_success() {
            self.last_offer = Some(rsp.file_id);
            info!(
                "OtaServer: offering {:?} ({} bytes) to 0x{:04X}",
                rsp.file_id, rsp.image_size, rsp.peer.short_addr
            );
            QueryImageRsp::Offer {
                file_id: rsp.file_id,
                image_size: rsp.image_size,
            }
        } else {
            QueryImageRsp::Unavailable(ZclStatus::NoImageAvailable)
        };
        send_command(
            &mut *ports.transport,
            rsp.peer,
            query_rsp_command(rsp.query),
            seq,
            &record,
        );
        ports.sink.emit(&OtaEvent::ImageQueried {
            peer: rsp.peer,
            file_id: rsp.file_id,
            status: rsp.status,
        });
    }

    fn on_file_read(&mut self, rsp: FileReadRsp, ports: &mut ServerPorts<'_>) {
        let seq = self.reply_seq(rsp.peer);
        let record = if rsp.status.is_success() && !rsp.data.is_empty() {
            debug!(
                "OtaServer: block @{} ({} bytes) to 0x{:04X}",
                rsp.offset,
                rsp.data.len(),
                rsp.peer.short_addr
            );
            ImageBlockRsp::Success {
                file_id: rsp.file_id,
                file_offset: rsp.offset,
                data: rsp.data,
            }
        } else {
            warn!(
                "OtaServer: provider read failed ({:?}, {} bytes), aborting 0x{:04X}",
                rsp.status,
                rsp.data.len(),
                rsp.peer.short_addr
            );
            ImageBlockRsp::Abort
        };
        send_command(&mut *ports.transport, rsp.peer, CommandId::ImageBlockRsp, seq, &record);
    }
}

fn query_rsp_command(query: QueryKind) -> CommandId {
    match query {
        QueryKind::Next => CommandId::QueryNextImageRsp,
        QueryKind::Specific { .. } => CommandId::QuerySpecificFileRsp,
    }
}

fn malformed(command: CommandId, e: crate::error::DecodeError) -> Disposition {
    warn!("OtaServer: malformed {command:?}: {e}");
    Disposition::Status(e.into())
}
