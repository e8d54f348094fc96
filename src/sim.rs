//! Discrete-event network simulation.
//!
//! One [`OtaServer`] backed by an [`ImageStore`] and any number of
//! [`OtaClient`]s, each with its own loopback radio, in-memory flash and
//! simulated device.  Virtual time jumps straight to the next thing that
//! can happen: a frame arriving or an engine deadline.
//!
//! ```text
//!  ┌──────────┐  outbox   ┌──────────────┐  deliver at   ┌──────────┐
//!  │ client N │ ────────▶ │  in flight   │ ────────────▶ │  server  │
//!  └──────────┘ ◀──────── │ (+latency,   │ ◀──────────── └────┬─────┘
//!       ▲                 │  drop filter)│                    │ provider
//!       └── ZDO answers ──┴──────────────┘      ImageStore ◀──┘
//! ```

use log::{debug, info};

use crate::adapters::device::SimDevice;
use crate::adapters::flash::{MemFlash, NorFlashStaging};
use crate::adapters::image_store::ImageStore;
use crate::adapters::log_sink::RecordingSink;
use crate::adapters::loopback::{LoopbackNet, ZdoRequest};
use crate::client::{ClientPorts, OtaClient};
use crate::config::{ClientConfig, ServerConfig};
use crate::events::{ClientEvent, InboundFrame};
use crate::protocol::{
    FrameBuf, FrameType, IeeeAddr, ImageNotify, OTA_CLUSTER_ID, PeerAddr, ZclHeader, ZclStatus,
};
use crate::server::{OtaServer, ServerPorts};

/// Default one-way frame latency.
pub const DEFAULT_LATENCY_MS: u64 = 20;

/// Flash given to each simulated client unless stated otherwise.
pub const DEFAULT_CLIENT_FLASH: usize = 64 * 1024;

/// One delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub at_ms: u64,
    pub src: PeerAddr,
    pub dst: PeerAddr,
    pub frame_type: FrameType,
    pub command: u8,
    pub seq_num: u8,
}

/// Returns `true` for frames that should be lost in transit.
pub type DropFilter = Box<dyn FnMut(&TraceEntry) -> bool>;

pub struct SimClient {
    pub engine: OtaClient,
    pub net: LoopbackNet,
    pub storage: NorFlashStaging<MemFlash>,
    pub device: SimDevice,
    pub sink: RecordingSink,
}

impl SimClient {
    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.net.short_addr(), self.engine.config().endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Server,
    Client(usize),
}

enum Payload {
    Frame {
        entry: TraceEntry,
        was_broadcast: bool,
        data: FrameBuf,
    },
    Zdo(ClientEvent),
}

struct Delivery {
    at_ms: u64,
    to: Node,
    payload: Payload,
}

pub struct Simulation {
    now_ms: u64,
    latency_ms: u64,
    server: OtaServer,
    server_net: LoopbackNet,
    store: ImageStore,
    server_sink: RecordingSink,
    clients: Vec<SimClient>,
    in_flight: Vec<Delivery>,
    trace: Vec<TraceEntry>,
    drop_filter: Option<DropFilter>,
    dropped: u32,
}

/// Deterministic IEEE address for a simulated node.
pub fn ieee_for(short_addr: u16) -> IeeeAddr {
    let [lo, hi] = short_addr.to_le_bytes();
    [lo, hi, 0x00, 0x00, 0xFF, 0xFE, 0x4B, 0x12]
}

impl Simulation {
    /// Network with a server at short address 0x0000.
    pub fn new(server_config: ServerConfig, store: ImageStore) -> Self {
        Self {
            now_ms: 0,
            latency_ms: DEFAULT_LATENCY_MS,
            server: OtaServer::new(server_config),
            server_net: LoopbackNet::new(0x0000),
            store,
            server_sink: RecordingSink::logging("[srv] "),
            clients: Vec::new(),
            in_flight: Vec::new(),
            trace: Vec::new(),
            drop_filter: None,
            dropped: 0,
        }
    }

    pub fn set_latency(&mut self, latency_ms: u64) {
        self.latency_ms = latency_ms;
    }

    pub fn set_drop_filter(&mut self, filter: impl FnMut(&TraceEntry) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    /// Add a client node; returns its index.
    pub fn add_client(&mut self, config: ClientConfig, short_addr: u16, seed: u32) -> usize {
        self.add_client_with_flash(config, short_addr, seed, DEFAULT_CLIENT_FLASH)
    }

    pub fn add_client_with_flash(
        &mut self,
        config: ClientConfig,
        short_addr: u16,
        seed: u32,
        flash_bytes: usize,
    ) -> usize {
        let idx = self.clients.len();
        self.clients.push(SimClient {
            engine: OtaClient::new(config),
            net: LoopbackNet::new(short_addr),
            storage: NorFlashStaging::new(MemFlash::new(flash_bytes)),
            device: SimDevice::new(seed),
            sink: RecordingSink::logging(format!("[0x{short_addr:04X}] ")),
        });
        idx
    }

    /// Start every client at the current time.
    pub fn start(&mut self) {
        let now = self.now_ms;
        for c in &mut self.clients {
            let mut ports = ClientPorts {
                net: &mut c.net,
                storage: &mut c.storage,
                device: &mut c.device,
                sink: &mut c.sink,
            };
            c.engine.start(now, &mut ports);
        }
        info!("Simulation: {} client(s) started", self.clients.len());
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn server(&self) -> &OtaServer {
        &self.server
    }

    pub fn server_addr(&self) -> PeerAddr {
        PeerAddr::new(self.server_net.short_addr(), self.server.config().endpoint)
    }

    pub fn server_events(&self) -> &RecordingSink {
        &self.server_sink
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ImageStore {
        &mut self.store
    }

    pub fn client(&self, idx: usize) -> &SimClient {
        &self.clients[idx]
    }

    pub fn client_mut(&mut self, idx: usize) -> &mut SimClient {
        &mut self.clients[idx]
    }

    pub fn clients(&self) -> &[SimClient] {
        &self.clients
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Frames lost to the drop filter.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    // ── Driving ───────────────────────────────────────────────

    /// Have the server announce an image.
    pub fn send_image_notify(&mut self, dst: PeerAddr, notify: &ImageNotify) -> bool {
        let mut ports = ServerPorts {
            transport: &mut self.server_net,
            provider: &mut self.store,
            sink: &mut self.server_sink,
        };
        self.server.send_image_notify(dst, notify, &mut ports)
    }

    /// Ask client `idx` to query its server right away.
    pub fn request_next_update(&mut self, idx: usize) -> bool {
        let server = self.server_addr();
        self.clients[idx].engine.request_next_update(server)
    }

    /// Advance to the next event and process it.  Returns `false` when
    /// nothing is left to happen.
    pub fn step(&mut self) -> bool {
        self.collect_outputs();
        let Some(next) = self.next_event_time() else {
            return false;
        };
        self.now_ms = self.now_ms.max(next);
        self.deliver_due();
        self.poll_all();
        true
    }

    /// Step until `done` holds or virtual time passes `limit_ms`.
    /// Returns whether `done` was reached.
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&Simulation) -> bool) -> bool {
        while !done(self) {
            if !self.step() || self.now_ms > limit_ms {
                return done(self);
            }
        }
        true
    }

    /// Step until every client has finished one download (reset or failed)
    /// and the frames that finish sent have reached their peers.
    pub fn run_to_completion(&mut self, limit_ms: u64) -> bool {
        self.run_until(limit_ms, |sim| {
            sim.is_quiet()
                && sim
                    .clients
                    .iter()
                    .all(|c| c.sink.last_finish().is_some())
        })
    }

    /// No frame in flight, unsent or waiting for the server.
    pub fn is_quiet(&self) -> bool {
        self.in_flight.is_empty()
            && !self.server.has_pending()
            && self.server_net.is_idle()
            && self.clients.iter().all(|c| c.net.is_idle())
    }

    /// Final download status per client.
    pub fn outcomes(&self) -> Vec<Option<ZclStatus>> {
        self.clients.iter().map(|c| c.sink.last_finish()).collect()
    }

    // ── Internal ──────────────────────────────────────────────

    fn node_addr(&self, node: Node) -> PeerAddr {
        match node {
            Node::Server => self.server_addr(),
            Node::Client(i) => self.clients[i].addr(),
        }
    }

    fn resolve(&self, short_addr: u16) -> Option<Node> {
        if short_addr == self.server_net.short_addr() {
            return Some(Node::Server);
        }
        self.clients
            .iter()
            .position(|c| c.net.short_addr() == short_addr)
            .map(Node::Client)
    }

    fn collect_outputs(&mut self) {
        let sent = self.server_net.take_outbox();
        for (dst, frame) in sent {
            self.route(Node::Server, dst, frame);
        }
        for i in 0..self.clients.len() {
            let sent = self.clients[i].net.take_outbox();
            for (dst, frame) in sent {
                self.route(Node::Client(i), dst, frame);
            }
            let zdo = self.clients[i].net.take_zdo();
            for req in zdo {
                self.answer_zdo(i, req);
            }
        }
    }

    fn route(&mut self, from: Node, dst: PeerAddr, data: FrameBuf) {
        let Ok((header, _)) = ZclHeader::decode(&data) else {
            debug!("Simulation: unreadable frame dropped");
            return;
        };
        let src = self.node_addr(from);
        let targets: Vec<Node> = if dst.is_broadcast() {
            (0..self.clients.len())
                .map(Node::Client)
                .filter(|&n| n != from)
                .collect()
        } else {
            self.resolve(dst.short_addr).into_iter().collect()
        };
        for to in targets {
            let entry = TraceEntry {
                at_ms: 0,
                src,
                dst: PeerAddr::new(self.node_addr(to).short_addr, dst.endpoint),
                frame_type: header.frame_type,
                command: header.command,
                seq_num: header.seq_num,
            };
            if self.drop_filter.as_mut().is_some_and(|f| f(&entry)) {
                debug!(
                    "Simulation: dropped cmd 0x{:02X} 0x{:04X} -> 0x{:04X}",
                    entry.command, entry.src.short_addr, entry.dst.short_addr
                );
                self.dropped += 1;
                continue;
            }
            self.in_flight.push(Delivery {
                at_ms: self.now_ms + self.latency_ms,
                to,
                payload: Payload::Frame {
                    entry,
                    was_broadcast: dst.is_broadcast(),
                    data: data.clone(),
                },
            });
        }
    }

    fn answer_zdo(&mut self, client: usize, req: ZdoRequest) {
        let server = self.server_addr();
        let event = match req {
            ZdoRequest::MatchDesc { cluster_id } => {
                if cluster_id != OTA_CLUSTER_ID {
                    return;
                }
                let mut endpoints = heapless::Vec::new();
                // One endpoint always fits.
                let _ = endpoints.push(server.endpoint);
                ClientEvent::MatchDescRsp {
                    short_addr: server.short_addr,
                    success: true,
                    endpoints,
                }
            }
            ZdoRequest::IeeeAddr { short_addr } => {
                if self.resolve(short_addr).is_none() {
                    return;
                }
                ClientEvent::IeeeAddrRsp {
                    short_addr,
                    ieee: ieee_for(short_addr),
                }
            }
        };
        self.in_flight.push(Delivery {
            at_ms: self.now_ms + 2 * self.latency_ms,
            to: Node::Client(client),
            payload: Payload::Zdo(event),
        });
    }

    fn next_event_time(&self) -> Option<u64> {
        let deliveries = self.in_flight.iter().map(|d| d.at_ms);
        let clients = self.clients.iter().filter_map(|c| c.engine.next_deadline());
        let server = self.server.has_pending().then_some(self.now_ms);
        deliveries.chain(clients).chain(server).min()
    }

    fn deliver_due(&mut self) {
        let now = self.now_ms;
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.in_flight.len() {
            if self.in_flight[i].at_ms <= now {
                due.push(self.in_flight.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|d| d.at_ms);

        for delivery in due {
            match delivery.payload {
                Payload::Frame {
                    mut entry,
                    was_broadcast,
                    data,
                } => {
                    entry.at_ms = now;
                    self.trace.push(entry);
                    let frame = InboundFrame {
                        src: entry.src,
                        dst_endpoint: entry.dst.endpoint,
                        cluster_id: OTA_CLUSTER_ID,
                        was_broadcast,
                        data,
                    };
                    match delivery.to {
                        Node::Server => {
                            self.server.post_frame(frame);
                        }
                        Node::Client(i) => {
                            self.clients[i].engine.post_frame(frame);
                        }
                    }
                }
                Payload::Zdo(event) => {
                    if let Node::Client(i) = delivery.to {
                        self.clients[i].engine.post(event);
                    }
                }
            }
        }
    }

    fn poll_all(&mut self) {
        let now = self.now_ms;
        loop {
            let mut ports = ServerPorts {
                transport: &mut self.server_net,
                provider: &mut self.store,
                sink: &mut self.server_sink,
            };
            self.server.poll(now, &mut ports);
            let answers = self.store.drain_answers();
            if answers.is_empty() {
                break;
            }
            for answer in answers {
                self.server.post(answer);
            }
        }
        for c in &mut self.clients {
            let mut ports = ClientPorts {
                net: &mut c.net,
                storage: &mut c.storage,
                device: &mut c.device,
                sink: &mut c.sink,
            };
            c.engine.poll(now, &mut ports);
        }
    }
}
