//! Scripted peers for integration tests.
//!
//! [`ClientRig`] drives an [`OtaClient`] by hand-crafting the frames a
//! server would send; [`ServerRig`] does the same for an [`OtaServer`]
//! from the client side.  Both record every frame the engine emits so
//! tests can assert on the full command history.

use zcl_ota::adapters::device::SimDevice;
use zcl_ota::adapters::flash::{MemFlash, NorFlashStaging};
use zcl_ota::adapters::image_store::{ImageStore, build_ota_file};
use zcl_ota::adapters::log_sink::RecordingSink;
use zcl_ota::adapters::loopback::LoopbackNet;
use zcl_ota::client::{ClientPorts, OtaClient};
use zcl_ota::config::{ClientConfig, ServerConfig};
use zcl_ota::events::InboundFrame;
use zcl_ota::protocol::{
    BlockData, CommandId, FileId, OTA_CLUSTER_ID, PeerAddr, WireRecord, ZclHeader, encode_command,
};
use zcl_ota::server::{OtaServer, ServerPorts};

pub const SERVER: PeerAddr = PeerAddr::new(0x0000, 20);
pub const CLIENT: PeerAddr = PeerAddr::new(0x1001, 20);

pub const CURRENT: FileId = FileId::new(0x1234, 0x5678, 1);
pub const NEXT: FileId = FileId::new(0x1234, 0x5678, 2);

/// One frame an engine put on the air.
#[derive(Debug, Clone)]
pub struct Sent {
    pub dst: PeerAddr,
    pub header: ZclHeader,
    pub payload: Vec<u8>,
}

#[allow(dead_code)]
impl Sent {
    pub fn record<R: WireRecord>(&self) -> R {
        R::decode(&self.payload).expect("record decodes")
    }

    pub fn is(&self, command: CommandId) -> bool {
        self.header.command == command as u8
            && self.header.frame_type == zcl_ota::protocol::FrameType::ClusterSpecific
    }
}

fn drain(net: &mut LoopbackNet) -> Vec<Sent> {
    net.take_outbox()
        .into_iter()
        .map(|(dst, frame)| {
            let (header, payload) = ZclHeader::decode(&frame).expect("engine frames decode");
            Sent {
                dst,
                header,
                payload: payload.to_vec(),
            }
        })
        .collect()
}

pub fn frame_from<R: WireRecord>(src: PeerAddr, command: CommandId, seq: u8, record: &R) -> InboundFrame {
    InboundFrame {
        src,
        dst_endpoint: 20,
        cluster_id: OTA_CLUSTER_ID,
        was_broadcast: false,
        data: encode_command(command, seq, true, record).expect("record encodes"),
    }
}

/// OTA file for [`NEXT`] carrying `payload_len` bytes of image data.
pub fn next_image(payload_len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i * 7 % 256) as u8).collect();
    build_ota_file(NEXT, 2, &payload).expect("image builds")
}

pub fn slice(file: &[u8], offset: u32, len: u8) -> BlockData {
    let start = offset as usize;
    let end = (start + usize::from(len)).min(file.len());
    BlockData::from_slice(&file[start..end]).expect("block fits")
}

// ── Client side ───────────────────────────────────────────────

pub struct ClientRig {
    pub client: OtaClient,
    pub net: LoopbackNet,
    pub storage: NorFlashStaging<MemFlash>,
    pub device: SimDevice,
    pub sink: RecordingSink,
    pub now: u64,
    seq: u8,
}

#[allow(dead_code)]
impl ClientRig {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: OtaClient::new(config),
            net: LoopbackNet::new(CLIENT.short_addr),
            storage: NorFlashStaging::new(MemFlash::new(8 * 1024)),
            device: SimDevice::with_fixed_random(0),
            sink: RecordingSink::default(),
            now: 0,
            seq: 100,
        }
    }

    pub fn config() -> ClientConfig {
        ClientConfig {
            manufacturer_id: CURRENT.manufacturer,
            image_type: CURRENT.image_type,
            current_file_version: CURRENT.version,
            ..ClientConfig::default()
        }
    }

    pub fn poll(&mut self) {
        let mut ports = ClientPorts {
            net: &mut self.net,
            storage: &mut self.storage,
            device: &mut self.device,
            sink: &mut self.sink,
        };
        self.client.poll(self.now, &mut ports);
    }

    pub fn start(&mut self) {
        let mut ports = ClientPorts {
            net: &mut self.net,
            storage: &mut self.storage,
            device: &mut self.device,
            sink: &mut self.sink,
        };
        self.client.start(self.now, &mut ports);
    }

    /// Move the clock forward and let timers fire.
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        self.poll();
    }

    /// Jump to the client's next deadline.
    pub fn run_to_deadline(&mut self) {
        if let Some(at) = self.client.next_deadline() {
            self.now = self.now.max(at);
        }
        self.poll();
    }

    /// Deliver a server command and poll.
    pub fn from_server<R: WireRecord>(&mut self, command: CommandId, record: &R) {
        self.seq = self.seq.wrapping_add(1);
        let frame = frame_from(SERVER, command, self.seq, record);
        self.client.post_frame(frame);
        self.poll();
    }

    pub fn sent(&mut self) -> Vec<Sent> {
        drain(&mut self.net)
    }
}

// ── Server side ───────────────────────────────────────────────

pub struct ServerRig {
    pub server: OtaServer,
    pub net: LoopbackNet,
    pub store: ImageStore,
    pub sink: RecordingSink,
    pub now: u64,
}

#[allow(dead_code)]
impl ServerRig {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            server: OtaServer::new(config),
            net: LoopbackNet::new(SERVER.short_addr),
            store: ImageStore::new(),
            sink: RecordingSink::default(),
            now: 0,
        }
    }

    pub fn with_next_image(payload_len: usize) -> Self {
        let mut rig = Self::new(ServerConfig::default());
        rig.store.add_image(NEXT, next_image(payload_len));
        rig
    }

    /// Handle queued frames only; provider answers stay pending.
    pub fn poll_frames(&mut self) {
        let mut ports = ServerPorts {
            transport: &mut self.net,
            provider: &mut self.store,
            sink: &mut self.sink,
        };
        self.server.poll(self.now, &mut ports);
    }

    /// Post the provider's pending answers and handle them.
    pub fn answer_provider(&mut self) {
        for answer in self.store.drain_answers() {
            self.server.post(answer);
        }
        self.poll_frames();
    }

    /// Poll until the provider has nothing more to say.
    pub fn settle(&mut self) {
        self.poll_frames();
        loop {
            let answers = self.store.drain_answers();
            if answers.is_empty() {
                break;
            }
            for answer in answers {
                self.server.post(answer);
            }
            self.poll_frames();
        }
    }

    pub fn from_client<R: WireRecord>(&mut self, src: PeerAddr, command: CommandId, seq: u8, record: &R) {
        self.server.post_frame(frame_from(src, command, seq, record));
        self.settle();
    }

    pub fn sent(&mut self) -> Vec<Sent> {
        drain(&mut self.net)
    }
}
