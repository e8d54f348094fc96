//! Property and fuzz-style tests for robustness of core data structures.

use std::collections::HashMap;

use proptest::prelude::*;

use zcl_ota::adapters::device::SimDevice;
use zcl_ota::adapters::flash::{MemFlash, NorFlashStaging};
use zcl_ota::adapters::image_store::build_ota_file;
use zcl_ota::adapters::log_sink::RecordingSink;
use zcl_ota::adapters::loopback::LoopbackNet;
use zcl_ota::client::image::ImageParser;
use zcl_ota::client::staging::{CopyStatus, read_meta};
use zcl_ota::client::{ClientPorts, OtaClient, UpgradeStatus};
use zcl_ota::config::ClientConfig;
use zcl_ota::events::InboundFrame;
use zcl_ota::protocol::{
    BlockData, CommandId, DefaultRsp, FileId, ImageBlockReq, ImageBlockRsp, ImageNotify,
    ImagePageReq, OTA_CLUSTER_ID, PeerAddr, QueryImageRsp, QueryNextImageReq,
    QuerySpecificFileReq, UpgradeEndReq, UpgradeEndRsp, WireRecord, ZclHeader, ZclStatus,
    encode_command,
};
use zcl_ota::server::seq_table::{SEQ_TABLE_CAP, SeqNumTable};

const SERVER: PeerAddr = PeerAddr::new(0x0000, 20);
const CURRENT: FileId = FileId::new(0x1234, 0x5678, 1);
const NEXT: FileId = FileId::new(0x1234, 0x5678, 2);

struct Node {
    client: OtaClient,
    net: LoopbackNet,
    storage: NorFlashStaging<MemFlash>,
    device: SimDevice,
    sink: RecordingSink,
    now: u64,
    seq: u8,
}

impl Node {
    fn new(max_block_retries: u8) -> Self {
        let config = ClientConfig {
            manufacturer_id: CURRENT.manufacturer,
            image_type: CURRENT.image_type,
            current_file_version: CURRENT.version,
            max_block_retries,
            ..ClientConfig::default()
        };
        Self {
            client: OtaClient::new(config),
            net: LoopbackNet::new(0x1001),
            storage: NorFlashStaging::new(MemFlash::new(8 * 1024)),
            device: SimDevice::new(1),
            sink: RecordingSink::default(),
            now: 0,
            seq: 0,
        }
    }

    fn poll(&mut self) {
        let mut ports = ClientPorts {
            net: &mut self.net,
            storage: &mut self.storage,
            device: &mut self.device,
            sink: &mut self.sink,
        };
        self.client.poll(self.now, &mut ports);
    }

    fn deliver<R: WireRecord>(&mut self, command: CommandId, record: &R) {
        self.seq = self.seq.wrapping_add(1);
        self.client.post_frame(InboundFrame {
            src: SERVER,
            dst_endpoint: 20,
            cluster_id: OTA_CLUSTER_ID,
            was_broadcast: false,
            data: encode_command(command, self.seq, true, record).unwrap(),
        });
        self.poll();
    }

    fn offer(&mut self, image_size: u32) {
        self.deliver(
            CommandId::QueryNextImageRsp,
            &QueryImageRsp::Offer {
                file_id: NEXT,
                image_size,
            },
        );
    }

    fn block(&mut self, file: &[u8], offset: u32, len: usize) {
        let start = offset as usize;
        let end = (start + len).min(file.len());
        self.deliver(
            CommandId::ImageBlockRsp,
            &ImageBlockRsp::Success {
                file_id: NEXT,
                file_offset: offset,
                data: BlockData::from_slice(&file[start..end]).unwrap(),
            },
        );
    }

    fn offset(&self) -> u32 {
        self.client.session().map_or(0, |s| s.offset)
    }
}

fn image(payload_len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i * 31 % 256) as u8).collect();
    build_ota_file(NEXT, 2, &payload).unwrap()
}

// ── Client transfer properties ────────────────────────────────

proptest! {
    /// Re-delivering blocks any number of times never corrupts the staged
    /// image or moves the offset past the data actually received.
    #[test]
    fn duplicate_blocks_are_harmless(
        payload_len in 1usize..600,
        repeats in proptest::collection::vec(1usize..4, 1..64),
    ) {
        let file = image(payload_len);
        let mut node = Node::new(10);
        node.offer(file.len() as u32);

        let mut i = 0;
        while node.client.status() == UpgradeStatus::InProgress {
            let offset = node.offset();
            let times = repeats[i % repeats.len()];
            for _ in 0..times {
                node.block(&file, offset, 64);
            }
            i += 1;
        }
        prop_assert_eq!(node.client.status(), UpgradeStatus::Complete);
        let meta = read_meta(&mut node.storage).unwrap();
        prop_assert_eq!(meta.image_len as usize, payload_len);
        prop_assert_eq!(meta.copy_status, CopyStatus::Default);
    }

    /// Whatever offsets the server answers with, the client's offset never
    /// moves backwards and only advances on the expected one.
    #[test]
    fn offset_is_monotonic(
        offsets in proptest::collection::vec(0u32..1100, 1..80),
    ) {
        let file = image(938);
        let mut node = Node::new(10);
        node.offer(file.len() as u32);
        for requested in offsets {
            if node.client.status() != UpgradeStatus::InProgress {
                break;
            }
            let before = node.offset();
            let offset = requested.min(file.len() as u32 - 1);
            node.block(&file, offset, 64);
            let after = node.offset();
            if node.client.status() == UpgradeStatus::InProgress {
                prop_assert!(after >= before);
                if offset == before {
                    prop_assert_eq!(after, (before + 64).min(file.len() as u32));
                } else {
                    prop_assert_eq!(after, before);
                }
            }
        }
    }

    /// With no server answers at all, the client gives up after exactly
    /// `max + 1` block timeouts and is back in Normal.
    #[test]
    fn silence_always_ends_in_abort(max_retries in 0u8..8) {
        let mut node = Node::new(max_retries);
        let timeout = u64::from(node.client.config().block_rsp_timeout_ms);
        node.offer(500);
        for _ in 0..max_retries {
            node.now += timeout;
            node.poll();
            prop_assert_eq!(node.client.status(), UpgradeStatus::InProgress);
        }
        node.now += timeout;
        node.poll();
        prop_assert_eq!(node.client.status(), UpgradeStatus::Normal);
        prop_assert_eq!(node.sink.last_finish(), Some(ZclStatus::Abort));
        prop_assert!(node.client.session().is_none());
    }

    /// Splitting a file at arbitrary points forwards the same payload.
    #[test]
    fn parser_is_chunking_independent(
        payload_len in 0usize..400,
        cuts in proptest::collection::vec(1usize..80, 1..40),
    ) {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        let file = build_ota_file(NEXT, 2, &payload).unwrap();
        let mut parser = ImageParser::new(NEXT, file.len() as u32);
        let mut out = Vec::new();
        let mut rest = file.as_slice();
        let mut i = 0;
        while !rest.is_empty() {
            let n = cuts[i % cuts.len()].min(rest.len());
            parser
                .feed(&rest[..n], &mut |chunk: &[u8]| {
                    out.extend_from_slice(chunk);
                    Ok(())
                })
                .unwrap();
            rest = &rest[n..];
            i += 1;
        }
        prop_assert!(parser.is_complete());
        prop_assert_eq!(out, payload);
    }
}

// ── Sequence table ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SeqOp {
    Insert(u16, u8),
    Take(u16),
}

fn seq_op() -> impl Strategy<Value = SeqOp> {
    prop_oneof![
        (0u16..6, any::<u8>()).prop_map(|(a, s)| SeqOp::Insert(a, s)),
        (0u16..6).prop_map(SeqOp::Take),
    ]
}

proptest! {
    /// The table behaves like a bounded map keyed by short address.
    #[test]
    fn seq_table_matches_bounded_map(ops in proptest::collection::vec(seq_op(), 0..200)) {
        let mut table = SeqNumTable::new();
        let mut model: HashMap<u16, u8> = HashMap::new();
        for op in ops {
            match op {
                SeqOp::Insert(addr, seq) => {
                    let fits = model.contains_key(&addr) || model.len() < SEQ_TABLE_CAP;
                    prop_assert_eq!(table.insert(addr, seq), fits);
                    if fits {
                        model.insert(addr, seq);
                    }
                }
                SeqOp::Take(addr) => {
                    prop_assert_eq!(table.take(addr), model.remove(&addr));
                }
            }
            prop_assert_eq!(table.len(), model.len());
            prop_assert!(table.len() <= SEQ_TABLE_CAP);
        }
    }
}

// ── Decoders never panic ──────────────────────────────────────

proptest! {
    #[test]
    fn decoders_tolerate_garbage(bytes in proptest::collection::vec(any::<u8>(), 0..96)) {
        let _ = ZclHeader::decode(&bytes);
        let _ = ImageNotify::decode(&bytes);
        let _ = QueryNextImageReq::decode(&bytes);
        let _ = QueryImageRsp::decode(&bytes);
        let _ = ImageBlockReq::decode(&bytes);
        let _ = ImagePageReq::decode(&bytes);
        let _ = ImageBlockRsp::decode(&bytes);
        let _ = UpgradeEndReq::decode(&bytes);
        let _ = UpgradeEndRsp::decode(&bytes);
        let _ = QuerySpecificFileReq::decode(&bytes);
        let _ = DefaultRsp::decode(&bytes);
    }

    /// Garbage on the cluster never wedges the client.
    #[test]
    fn client_survives_garbage_frames(
        frames in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..80), 1..20),
    ) {
        let mut node = Node::new(3);
        for data in frames {
            let Ok(data) = zcl_ota::protocol::FrameBuf::from_slice(&data) else {
                continue;
            };
            node.client.post_frame(InboundFrame {
                src: SERVER,
                dst_endpoint: 20,
                cluster_id: OTA_CLUSTER_ID,
                was_broadcast: false,
                data,
            });
            node.poll();
        }
        // Whatever state it reached, time alone brings it back to Normal.
        for _ in 0..64 {
            if node.client.status() == UpgradeStatus::Normal {
                break;
            }
            match node.client.next_deadline() {
                Some(at) => node.now = node.now.max(at),
                None => break,
            }
            node.poll();
        }
        prop_assert_eq!(node.client.status(), UpgradeStatus::Normal);
    }
}
