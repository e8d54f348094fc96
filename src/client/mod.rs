//! OTA Upgrade client engine.
//!
//! [`OtaClient`] finds an OTA server, asks it for newer firmware, pulls the
//! image block by block into the staging region and hands it to the
//! bootloader.  It owns all protocol state; radio, flash and device
//! services are passed in per call through [`ClientPorts`].
//!
//! ```text
//!            QNI rsp (offer)         last block          End rsp (time)
//!  Normal ───────────────▶ InProgress ─────────▶ Complete ──────────▶ Countdown ──▶ apply
//!    ▲                        │                     │  End rsp (WAIT)                 ▲
//!    │      abort / retries   │                     └────────────▶ UpgradeWait ───────┘
//!    └────────────────────────┴──────────────────────────────────────  bounded waits
//! ```
//!
//! Every wait is a [`ClientTimer`]; expiries and inbound traffic both land
//! in one bounded queue that [`OtaClient::poll`] drains.

pub mod image;
pub mod session;
pub mod staging;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::dispatch::{Gate, finish, gate, send_command};
use crate::app::events::OtaEvent;
use crate::app::ports::{DevicePort, EventSink, NetworkPort, StagingPort};
use crate::config::ClientConfig;
use crate::events::{ClientEvent, EventQueue, InboundFrame};
use crate::protocol::{
    BlockData, CommandId, Direction, Disposition, FileId, IMAGE_TYPE_WILDCARD, IeeeAddr,
    ImageBlockReq, ImageBlockRsp, ImageNotify, MANUFACTURER_WILDCARD, OTA_CLUSTER_ID, PeerAddr,
    QueryImageRsp, QueryNextImageReq, QuerySpecificFileReq, SeqCounter, UPGRADE_TIME_WAIT,
    UpgradeEndReq, UpgradeEndRsp, WireRecord, ZclStatus,
};
use crate::retry::{RetryPolicy, RetryVerdict};
use crate::timers::Timers;

use self::session::TransferSession;
use self::staging::{ImageStager, mark_pending_copy};

/// ZCL `ImageUpgradeStatus` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UpgradeStatus {
    Normal = 0,
    InProgress = 1,
    Complete = 2,
    UpgradeWait = 3,
    Countdown = 4,
}

/// One id per distinct wait the client performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTimer {
    /// Reloading: re-send match-descriptor until a server answers.
    ServerDiscovery,
    /// Reloading: periodic Query-Next-Image.
    QueryServer,
    /// No answer to a Query-Next-Image request.
    ImageQueryTimeout,
    /// Rate-limit gap before the next block request.
    BlockReqDelay,
    /// No answer to a block request.
    BlockRspTimeout,
    /// Server asked us to come back later.
    BlockWait,
    /// Countdown to apply, or the UpgradeWait poll period.
    UpgradeWait,
    /// No answer to an Upgrade-End request.
    UpgradeEndRspTimeout,
}

const CLIENT_TIMER_SLOTS: usize = 8;

const SESSION_TIMERS: [ClientTimer; 6] = [
    ClientTimer::ImageQueryTimeout,
    ClientTimer::BlockReqDelay,
    ClientTimer::BlockRspTimeout,
    ClientTimer::BlockWait,
    ClientTimer::UpgradeWait,
    ClientTimer::UpgradeEndRspTimeout,
];

/// Collaborators the client reaches during one call.
pub struct ClientPorts<'a> {
    pub net: &'a mut dyn NetworkPort,
    pub storage: &'a mut dyn StagingPort,
    pub device: &'a mut dyn DevicePort,
    pub sink: &'a mut dyn EventSink,
}

/// Snapshot of the ZCL OTA client attribute set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaAttributes {
    pub upgrade_server_id: Option<IeeeAddr>,
    pub file_offset: u32,
    pub current_file_version: u32,
    pub current_stack_version: u16,
    pub downloaded_file_version: Option<u32>,
    pub downloaded_stack_version: Option<u16>,
    pub image_upgrade_status: UpgradeStatus,
    pub manufacturer_id: u16,
    pub image_type_id: u16,
    pub minimum_block_period: u16,
}

pub struct OtaClient {
    config: ClientConfig,
    status: UpgradeStatus,
    session: Option<TransferSession>,
    /// Server found by discovery (or set by the application).
    server: Option<PeerAddr>,
    server_ieee: Option<IeeeAddr>,
    /// Minimum gap between block requests (ms).  Kept across sessions once
    /// a server has imposed it.
    min_block_req_delay: u16,
    block_retry: RetryPolicy,
    end_retry: RetryPolicy,
    timers: Timers<ClientTimer, CLIENT_TIMER_SLOTS>,
    queue: EventQueue<ClientEvent>,
    seq: SeqCounter,
    stager: ImageStager,
    now_ms: u64,
}

impl OtaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            status: UpgradeStatus::Normal,
            session: None,
            server: None,
            server_ieee: None,
            min_block_req_delay: config.min_block_req_delay_ms,
            block_retry: RetryPolicy::new(config.max_block_retries),
            end_retry: RetryPolicy::new(config.max_end_req_retries),
            timers: Timers::new(),
            queue: EventQueue::new(),
            seq: SeqCounter::default(),
            stager: ImageStager::new(),
            now_ms: 0,
            config,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Arm discovery and the periodic query.
    pub fn start(&mut self, now_ms: u64, ports: &mut ClientPorts<'_>) {
        self.now_ms = now_ms;
        let interval = self.config.discovery_interval_ms.max(1);
        if self.server.is_none() {
            self.timers
                .start_reload(ClientTimer::ServerDiscovery, now_ms, interval, interval);
        }
        let rate = self.config.query_rate_ms.max(1);
        let first = u32::from(ports.device.random_u16()) % rate + rate;
        self.timers
            .start_reload(ClientTimer::QueryServer, now_ms, first, rate);
        ports.device.set_poll_rate(self.config.idle_poll_rate_ms);
        info!(
            "OtaClient started: {:?}, first query in {} ms",
            self.config.current_file_id(),
            first
        );
    }

    /// Queue an event for the next [`poll`](Self::poll).
    pub fn post(&mut self, event: ClientEvent) -> bool {
        self.queue.push(event)
    }

    /// Convenience for radio adapters.
    pub fn post_frame(&mut self, frame: InboundFrame) -> bool {
        self.post(ClientEvent::Frame(frame))
    }

    /// Fire due timers and handle every queued event.
    pub fn poll(&mut self, now_ms: u64, ports: &mut ClientPorts<'_>) {
        self.now_ms = self.now_ms.max(now_ms);
        loop {
            self.timers.expire(self.now_ms, &mut self.queue);
            let Some(event) = self.queue.pop() else {
                break;
            };
            self.handle(event, ports);
        }
    }

    /// When the client next needs a [`poll`](Self::poll).
    pub fn next_deadline(&self) -> Option<u64> {
        if self.queue.is_empty() {
            self.timers.next_deadline()
        } else {
            Some(self.now_ms)
        }
    }

    /// Ask `server` for a newer image on the next poll.
    pub fn request_next_update(&mut self, server: PeerAddr) -> bool {
        self.server = Some(server);
        self.timers.stop(ClientTimer::ServerDiscovery);
        self.queue.push(ClientEvent::Timer(ClientTimer::QueryServer))
    }

    /// Ask `server` for one named file (Query-Specific-File).
    pub fn request_specific_file(
        &mut self,
        server: PeerAddr,
        node_addr: IeeeAddr,
        file_id: FileId,
        ports: &mut ClientPorts<'_>,
    ) -> bool {
        if self.status != UpgradeStatus::Normal {
            warn!("OtaClient: specific-file query refused in {:?}", self.status);
            return false;
        }
        let req = QuerySpecificFileReq {
            node_addr,
            file_id,
            stack_version: self.config.current_stack_version,
        };
        let seq = self.seq.next_seq();
        let sent = send_command(&mut *ports.net, server, CommandId::QuerySpecificFileReq, seq, &req);
        if sent {
            self.timers.start(
                ClientTimer::ImageQueryTimeout,
                self.now_ms,
                u64::from(self.config.query_timeout_ms),
            );
        }
        sent
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn status(&self) -> UpgradeStatus {
        self.status
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn server(&self) -> Option<PeerAddr> {
        self.server
    }

    /// Consecutive block-request failures in the current session.
    pub fn block_retries(&self) -> u8 {
        self.block_retry.failures()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn attributes(&self) -> OtaAttributes {
        let session = self.session.as_ref();
        OtaAttributes {
            upgrade_server_id: self.server_ieee,
            file_offset: session.map_or(0, |s| s.offset),
            current_file_version: self.config.current_file_version,
            current_stack_version: self.config.current_stack_version,
            downloaded_file_version: session.map(|s| s.file_id.version),
            downloaded_stack_version: session
                .and_then(|s| s.parser.header())
                .map(|h| h.stack_version),
            image_upgrade_status: self.status,
            manufacturer_id: self.config.manufacturer_id,
            image_type_id: self.config.image_type,
            minimum_block_period: self.min_block_req_delay,
        }
    }

    // ── Dispatch ──────────────────────────────────────────────

    fn handle(&mut self, event: ClientEvent, ports: &mut ClientPorts<'_>) {
        match event {
            ClientEvent::Frame(frame) => self.handle_frame(&frame, ports),
            ClientEvent::MatchDescRsp {
                short_addr,
                success,
                endpoints,
            } => self.on_match_desc_rsp(short_addr, success, &endpoints, ports),
            ClientEvent::IeeeAddrRsp { short_addr, ieee } => {
                let for_server = self
                    .session
                    .as_ref()
                    .map(|s| s.server)
                    .or(self.server)
                    .is_some_and(|p| p.short_addr == short_addr);
                if for_server {
                    self.server_ieee = Some(ieee);
                    ports
                        .sink
                        .emit(&OtaEvent::ServerIeeeAddress { short_addr, ieee });
                }
            }
            ClientEvent::Timer(timer) => self.on_timer(timer, ports),
        }
    }

    fn handle_frame(&mut self, frame: &InboundFrame, ports: &mut ClientPorts<'_>) {
        match gate(frame, self.config.endpoint, Direction::ServerToClient) {
            Gate::Drop => {}
            Gate::Reply { header, status } => {
                finish(&mut *ports.net, frame, &header, Disposition::Status(status));
            }
            Gate::Handle {
                header,
                command,
                payload,
            } => {
                let disposition = match command {
                    CommandId::ImageNotify => self.on_image_notify(frame, payload, ports),
                    CommandId::QueryNextImageRsp | CommandId::QuerySpecificFileRsp => {
                        self.on_query_rsp(frame.src, command, payload, ports)
                    }
                    CommandId::ImageBlockRsp => self.on_block_rsp(frame.src, payload, ports),
                    CommandId::UpgradeEndRsp => self.on_upgrade_end_rsp(payload, ports),
                    _ => Disposition::Status(ZclStatus::UnsupClusterCommand),
                };
                finish(&mut *ports.net, frame, &header, disposition);
            }
        }
    }

    fn on_match_desc_rsp(
        &mut self,
        short_addr: u16,
        success: bool,
        endpoints: &[u8],
        ports: &mut ClientPorts<'_>,
    ) {
        if self.server.is_some() || !success {
            return;
        }
        let Some(&endpoint) = endpoints.first() else {
            return;
        };
        let server = PeerAddr::new(short_addr, endpoint);
        self.server = Some(server);
        self.timers.stop(ClientTimer::ServerDiscovery);
        info!("OtaClient: server discovered at 0x{short_addr:04X} ep {endpoint}");
        ports.sink.emit(&OtaEvent::ServerDiscovered(server));
    }

    fn on_timer(&mut self, timer: ClientTimer, ports: &mut ClientPorts<'_>) {
        match timer {
            ClientTimer::ServerDiscovery => {
                if self.server.is_some() {
                    self.timers.stop(ClientTimer::ServerDiscovery);
                } else if let Err(e) = ports.net.match_desc_req(OTA_CLUSTER_ID) {
                    warn!("OtaClient: match-descriptor request failed: {e}");
                }
            }
            ClientTimer::QueryServer => {
                if self.status != UpgradeStatus::Normal || !self.config.permit {
                    return;
                }
                match self.server {
                    Some(server) => self.send_query(server, ports),
                    None => debug!("OtaClient: no server yet, query skipped"),
                }
            }
            ClientTimer::ImageQueryTimeout => {
                if self.status == UpgradeStatus::Normal {
                    warn!("OtaClient: query went unanswered");
                    ports.sink.emit(&OtaEvent::QueryTimedOut);
                }
            }
            ClientTimer::BlockReqDelay | ClientTimer::BlockWait => {
                if self.status == UpgradeStatus::InProgress {
                    self.send_block_req(ports);
                }
            }
            ClientTimer::BlockRspTimeout => {
                if self.status != UpgradeStatus::InProgress {
                    return;
                }
                match self.block_retry.record_failure() {
                    RetryVerdict::Retry { attempt } => {
                        warn!(
                            "OtaClient: block response timeout, retry {}/{}",
                            attempt,
                            self.block_retry.max_retries()
                        );
                        self.send_block_req(ports);
                    }
                    RetryVerdict::Exhausted => {
                        warn!("OtaClient: block retries exhausted, aborting");
                        self.fail_transfer(ZclStatus::Abort, ports);
                    }
                }
            }
            ClientTimer::UpgradeWait => match self.status {
                UpgradeStatus::Countdown => self.upgrade_complete(ZclStatus::Success, ports),
                UpgradeStatus::UpgradeWait => self.escalate_end(ClientTimer::UpgradeWait, ports),
                _ => {}
            },
            ClientTimer::UpgradeEndRspTimeout => {
                if self.status == UpgradeStatus::Complete {
                    self.escalate_end(ClientTimer::UpgradeEndRspTimeout, ports);
                }
            }
        }
    }

    // ── Query ─────────────────────────────────────────────────

    fn send_query(&mut self, server: PeerAddr, ports: &mut ClientPorts<'_>) {
        let req = QueryNextImageReq {
            file_id: self.config.current_file_id(),
            hardware_version: self.config.hardware_version,
        };
        let seq = self.seq.next_seq();
        if send_command(&mut *ports.net, server, CommandId::QueryNextImageReq, seq, &req) {
            self.timers.start(
                ClientTimer::ImageQueryTimeout,
                self.now_ms,
                u64::from(self.config.query_timeout_ms),
            );
        }
    }

    fn on_image_notify(
        &mut self,
        frame: &InboundFrame,
        payload: &[u8],
        ports: &mut ClientPorts<'_>,
    ) -> Disposition {
        let notify = match ImageNotify::decode(payload) {
            Ok(n) => n,
            Err(e) => {
                warn!("OtaClient: malformed image notify: {e}");
                return Disposition::Status(e.into());
            }
        };
        if !self.config.permit || self.status != UpgradeStatus::Normal {
            return Disposition::Status(ZclStatus::Failure);
        }

        if frame.was_broadcast {
            let current = self.config.current_file_id();
            let other_mfr = notify
                .manufacturer
                .is_some_and(|m| m != current.manufacturer && m != MANUFACTURER_WILDCARD);
            let other_type = notify
                .image_type
                .is_some_and(|t| t != current.image_type && t != IMAGE_TYPE_WILDCARD);
            let same_version = notify.file_version == Some(current.version);
            if other_mfr || other_type || same_version {
                debug!("OtaClient: broadcast notify filtered out");
                return Disposition::Ignored;
            }
            // Unicast notifies always query; only broadcasts are thinned.
            let draw = ports.device.random_u16() % 100;
            if draw > u16::from(notify.query_jitter) {
                debug!("OtaClient: notify jitter {} > {}, ignored", draw, notify.query_jitter);
                return Disposition::Ignored;
            }
        }

        self.send_query(frame.src, ports);
        Disposition::Status(ZclStatus::Success)
    }

    fn on_query_rsp(
        &mut self,
        src: PeerAddr,
        command: CommandId,
        payload: &[u8],
        ports: &mut ClientPorts<'_>,
    ) -> Disposition {
        let rsp = match QueryImageRsp::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("OtaClient: malformed query response: {e}");
                return Disposition::Status(e.into());
            }
        };
        if self.status != UpgradeStatus::Normal {
            debug!("OtaClient: query response in {:?} ignored", self.status);
            return Disposition::Status(ZclStatus::Success);
        }
        self.timers.stop(ClientTimer::ImageQueryTimeout);

        let (file_id, image_size) = match rsp {
            QueryImageRsp::Unavailable(status) => {
                info!("OtaClient: no image from 0x{:04X} ({status:?})", src.short_addr);
                ports.sink.emit(&OtaEvent::QueryResult { status });
                return Disposition::Status(ZclStatus::Success);
            }
            QueryImageRsp::Offer {
                file_id,
                image_size,
            } => (file_id, image_size),
        };

        if !file_id.same_product(&self.config.current_file_id()) || image_size == 0 {
            warn!("OtaClient: offer {file_id:?} is not for this device");
            ports.sink.emit(&OtaEvent::QueryResult {
                status: ZclStatus::MalformedCommand,
            });
            return Disposition::Status(ZclStatus::MalformedCommand);
        }
        if let Err(e) = self.stager.begin(&mut *ports.storage, file_id, image_size) {
            warn!("OtaClient: cannot stage offered image: {e}");
            ports.sink.emit(&OtaEvent::QueryResult {
                status: ZclStatus::Failure,
            });
            return Disposition::Status(ZclStatus::Failure);
        }

        self.session = Some(TransferSession::new(file_id, image_size, src));
        if self.server.is_none() {
            self.server = Some(src);
        }
        self.block_retry.reset();
        self.end_retry.reset();
        self.set_status(UpgradeStatus::InProgress, ports);
        if let Err(e) = ports.net.ieee_addr_req(src.short_addr) {
            warn!("OtaClient: IEEE address request failed: {e}");
        }
        ports.device.set_poll_rate(self.config.fast_poll_rate_ms);
        info!(
            "OtaClient: downloading {file_id:?}, {image_size} bytes from 0x{:04X}",
            src.short_addr
        );
        ports.sink.emit(&OtaEvent::QueryResult {
            status: ZclStatus::Success,
        });
        ports.sink.emit(&OtaEvent::DownloadStarted {
            file_id,
            image_size,
            server: src,
        });

        if command == CommandId::QuerySpecificFileRsp {
            self.send_block_req(ports);
        } else {
            self.timers.start(
                ClientTimer::BlockReqDelay,
                self.now_ms,
                u64::from(self.min_block_req_delay),
            );
        }
        Disposition::Status(ZclStatus::Success)
    }

    // ── Block transfer ────────────────────────────────────────

    fn send_block_req(&mut self, ports: &mut ClientPorts<'_>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let req = ImageBlockReq {
            file_id: session.file_id,
            file_offset: session.offset,
            max_data_size: session.next_block_len(self.config.effective_max_data_size()),
            node_addr: None,
            block_req_delay: self
                .config
                .rate_limit_support
                .then_some(self.min_block_req_delay),
        };
        let server = session.server;
        let seq = self.seq.next_seq();
        debug!(
            "OtaClient: block req offset {} len {}",
            req.file_offset, req.max_data_size
        );
        // A lost request is recovered by the response timeout.
        send_command(&mut *ports.net, server, CommandId::ImageBlockReq, seq, &req);
        self.timers.start(
            ClientTimer::BlockRspTimeout,
            self.now_ms,
            u64::from(self.config.block_rsp_timeout_ms),
        );
    }

    fn on_block_rsp(
        &mut self,
        src: PeerAddr,
        payload: &[u8],
        ports: &mut ClientPorts<'_>,
    ) -> Disposition {
        if self.status != UpgradeStatus::InProgress {
            return Disposition::Status(ZclStatus::Success);
        }
        let Some(server) = self.session.as_ref().map(|s| s.server) else {
            return Disposition::Status(ZclStatus::Success);
        };
        if src.short_addr != server.short_addr {
            debug!("OtaClient: block from 0x{:04X} is not our server", src.short_addr);
            return Disposition::Ignored;
        }
        let rsp = match ImageBlockRsp::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("OtaClient: malformed block response: {e}");
                return Disposition::Status(e.into());
            }
        };
        match rsp {
            ImageBlockRsp::Success {
                file_id,
                file_offset,
                data,
            } => self.on_block_data(file_id, file_offset, &data, ports),
            ImageBlockRsp::WaitForData {
                current_time,
                request_time,
                block_req_delay,
            } => {
                self.on_wait_for_data(current_time, request_time, block_req_delay);
                Disposition::Status(ZclStatus::Success)
            }
            ImageBlockRsp::Abort => {
                warn!("OtaClient: server aborted the transfer");
                self.fail_transfer(ZclStatus::Abort, ports);
                Disposition::Status(ZclStatus::Success)
            }
        }
    }

    fn on_block_data(
        &mut self,
        file_id: FileId,
        file_offset: u32,
        data: &BlockData,
        ports: &mut ClientPorts<'_>,
    ) -> Disposition {
        let Some(session) = self.session.as_mut() else {
            return Disposition::Ignored;
        };
        if file_id != session.file_id || file_offset != session.offset {
            warn!(
                "OtaClient: stale block {file_id:?}@{file_offset}, expecting @{}",
                session.offset
            );
            return Disposition::Ignored;
        }
        self.timers.stop(ClientTimer::BlockRspTimeout);
        self.block_retry.reset();

        let stager = &mut self.stager;
        let storage = &mut *ports.storage;
        let fed = session
            .parser
            .feed(data, &mut |chunk: &[u8]| stager.write(&mut *storage, chunk));
        if let Err(e) = fed {
            warn!("OtaClient: image rejected at offset {file_offset}: {e}");
            self.fail_transfer(e.into(), ports);
            return Disposition::Responded;
        }

        session.offset += data.len() as u32;
        let (offset, image_size) = (session.offset, session.image_size);
        debug!("OtaClient: block ok, {offset}/{image_size}");
        ports.sink.emit(&OtaEvent::Progress { offset, image_size });

        if !session.is_complete() {
            self.timers.start(
                ClientTimer::BlockReqDelay,
                self.now_ms,
                u64::from(self.min_block_req_delay),
            );
            return Disposition::Status(ZclStatus::Success);
        }

        // Whole file received.
        if !session.parser.is_complete() {
            warn!("OtaClient: image ended mid-element");
            self.fail_transfer(ZclStatus::InvalidImage, ports);
            return Disposition::Responded;
        }
        if session.parser.payload_len() == 0 {
            warn!("OtaClient: image carries only its header");
            self.fail_transfer(ZclStatus::Failure, ports);
            return Disposition::Responded;
        }
        if let Err(e) = self.stager.finish(&mut *ports.storage) {
            warn!("OtaClient: sealing staged image failed: {e}");
            self.fail_transfer(e.into(), ports);
            return Disposition::Responded;
        }

        info!("OtaClient: download complete");
        self.set_status(UpgradeStatus::Complete, ports);
        self.end_retry.reset();
        self.send_upgrade_end(ZclStatus::Success, ports);
        self.timers.start(
            ClientTimer::UpgradeEndRspTimeout,
            self.now_ms,
            u64::from(self.config.block_rsp_timeout_ms),
        );
        Disposition::Responded
    }

    fn on_wait_for_data(&mut self, current_time: u32, request_time: u32, block_req_delay: u16) {
        let wait_secs = request_time.saturating_sub(current_time);
        self.timers.stop(ClientTimer::BlockRspTimeout);
        if self.config.rate_limit_support && wait_secs == 0 {
            // Server only wants us to slow down.
            self.min_block_req_delay = block_req_delay;
            let gap = u64::from(block_req_delay) + u64::from(self.config.block_request_guard_ms);
            info!("OtaClient: server rate limit {block_req_delay} ms");
            self.timers.start(ClientTimer::BlockReqDelay, self.now_ms, gap);
        } else {
            self.block_retry.reset();
            debug!("OtaClient: server busy, waiting {wait_secs} s");
            self.timers.start(
                ClientTimer::BlockWait,
                self.now_ms,
                u64::from(wait_secs) * 1000,
            );
        }
    }

    // ── Upgrade end ───────────────────────────────────────────

    fn send_upgrade_end(&mut self, status: ZclStatus, ports: &mut ClientPorts<'_>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let req = UpgradeEndReq {
            status,
            file_id: Some(session.file_id),
        };
        let server = session.server;
        let seq = self.seq.next_seq();
        send_command(&mut *ports.net, server, CommandId::UpgradeEndReq, seq, &req);
    }

    fn on_upgrade_end_rsp(&mut self, payload: &[u8], ports: &mut ClientPorts<'_>) -> Disposition {
        let rsp = match UpgradeEndRsp::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("OtaClient: malformed upgrade-end response: {e}");
                return Disposition::Status(e.into());
            }
        };
        let current = self.config.current_file_id();
        let mfr_ok = rsp.file_id.manufacturer == current.manufacturer
            || rsp.file_id.manufacturer == MANUFACTURER_WILDCARD;
        let type_ok = rsp.file_id.image_type == current.image_type
            || rsp.file_id.image_type == IMAGE_TYPE_WILDCARD;
        if !mfr_ok || !type_ok {
            return Disposition::Status(ZclStatus::MalformedCommand);
        }

        let accepted = match self.status {
            UpgradeStatus::Complete => true,
            UpgradeStatus::UpgradeWait => rsp.upgrade_time != UPGRADE_TIME_WAIT,
            _ => false,
        };
        let ours = self
            .session
            .as_ref()
            .is_some_and(|s| rsp.file_id.matches(&s.file_id));
        if !accepted || !ours {
            debug!("OtaClient: upgrade-end response in {:?} dropped", self.status);
            return Disposition::Ignored;
        }

        self.timers.stop(ClientTimer::UpgradeEndRspTimeout);
        if rsp.upgrade_time == UPGRADE_TIME_WAIT {
            self.end_retry.reset();
            self.set_status(UpgradeStatus::UpgradeWait, ports);
            self.timers.start(
                ClientTimer::UpgradeWait,
                self.now_ms,
                u64::from(self.config.upgrade_wait_secs) * 1000,
            );
            info!("OtaClient: server asked us to wait");
            ports.sink.emit(&OtaEvent::UpgradeWaiting);
        } else {
            let delay_secs = rsp.upgrade_time.saturating_sub(rsp.current_time);
            self.set_status(UpgradeStatus::Countdown, ports);
            self.timers.start(
                ClientTimer::UpgradeWait,
                self.now_ms,
                u64::from(delay_secs) * 1000,
            );
            info!("OtaClient: applying in {delay_secs} s");
            ports.sink.emit(&OtaEvent::UpgradeScheduled { delay_secs });
        }
        Disposition::Status(ZclStatus::Success)
    }

    /// Re-send Upgrade-End until the budget runs out, then apply anyway
    /// (when configured to).
    fn escalate_end(&mut self, timer: ClientTimer, ports: &mut ClientPorts<'_>) {
        let period_ms = match timer {
            ClientTimer::UpgradeWait => u64::from(self.config.upgrade_wait_secs) * 1000,
            _ => u64::from(self.config.block_rsp_timeout_ms),
        };
        match self.end_retry.record_failure() {
            RetryVerdict::Exhausted if self.config.apply_after_wait_exhausted => {
                warn!("OtaClient: no go-ahead from server, applying anyway");
                self.upgrade_complete(ZclStatus::Success, ports);
            }
            verdict => {
                if let RetryVerdict::Retry { attempt } = verdict {
                    debug!("OtaClient: upgrade-end retry {attempt}");
                }
                self.send_upgrade_end(ZclStatus::Success, ports);
                self.timers.start(timer, self.now_ms, period_ms);
            }
        }
    }

    // ── Finish ────────────────────────────────────────────────

    /// Abort the session: tell the server, then finish with `status`.
    fn fail_transfer(&mut self, status: ZclStatus, ports: &mut ClientPorts<'_>) {
        self.send_upgrade_end(status, ports);
        self.upgrade_complete(status, ports);
    }

    fn upgrade_complete(&mut self, status: ZclStatus, ports: &mut ClientPorts<'_>) {
        for timer in SESSION_TIMERS {
            self.timers.stop(timer);
        }
        self.stager.abort(&mut *ports.storage);
        let session = self.session.take();
        self.block_retry.reset();
        self.end_retry.reset();
        self.set_status(UpgradeStatus::Normal, ports);
        ports.sink.emit(&OtaEvent::DownloadFinished { status });

        if !status.is_success() || session.is_none() {
            info!("OtaClient: transfer finished with {status:?}");
            ports.device.set_poll_rate(self.config.idle_poll_rate_ms);
            return;
        }
        match mark_pending_copy(&mut *ports.storage) {
            Ok(meta) => {
                info!("OtaClient: {:?} handed to bootloader, resetting", meta.file_id);
                ports.sink.emit(&OtaEvent::ApplyingImage {
                    file_id: meta.file_id,
                });
                ports.device.system_reset();
            }
            Err(e) => {
                warn!("OtaClient: staged image unusable: {e}");
                ports.sink.emit(&OtaEvent::ApplyFailed);
                ports.device.set_poll_rate(self.config.idle_poll_rate_ms);
            }
        }
    }

    fn set_status(&mut self, to: UpgradeStatus, ports: &mut ClientPorts<'_>) {
        if self.status == to {
            return;
        }
        let from = self.status;
        self.status = to;
        info!("OtaClient: {from:?} -> {to:?}");
        ports.sink.emit(&OtaEvent::StatusChanged { from, to });
    }
}
