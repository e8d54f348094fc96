//! Server engine against scripted clients.

use zcl_ota::app::events::OtaEvent;
use zcl_ota::config::ServerConfig;
use zcl_ota::events::InboundFrame;
use zcl_ota::protocol::frame::build_frame;
use zcl_ota::protocol::{
    CommandId, DefaultRsp, Direction, FileId, ImageBlockReq, ImageBlockRsp, ImageNotify, ImagePageReq,
    OTA_CLUSTER_ID, PeerAddr, QueryImageRsp, QueryNextImageReq, QuerySpecificFileReq,
    UpgradeEndReq, UpgradeEndRsp, ZCL_CMD_DEFAULT_RSP, ZclHeader, ZclStatus,
};

use crate::mock_ports::{CLIENT, CURRENT, NEXT, ServerRig, next_image};

fn query(rig: &mut ServerRig, src: PeerAddr, seq: u8) {
    rig.from_client(
        src,
        CommandId::QueryNextImageReq,
        seq,
        &QueryNextImageReq {
            file_id: CURRENT,
            hardware_version: None,
        },
    );
}

fn block_req(file_id: FileId, offset: u32, delay: Option<u16>) -> ImageBlockReq {
    ImageBlockReq {
        file_id,
        file_offset: offset,
        max_data_size: 64,
        node_addr: None,
        block_req_delay: delay,
    }
}

#[test]
fn query_is_answered_with_request_sequence() {
    let mut rig = ServerRig::with_next_image(500);
    query(&mut rig, CLIENT, 42);
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is(CommandId::QueryNextImageRsp));
    assert_eq!(sent[0].header.seq_num, 42);
    assert_eq!(sent[0].header.direction, Direction::ServerToClient);
    assert_eq!(sent[0].dst, CLIENT);
    assert_eq!(
        sent[0].record::<QueryImageRsp>(),
        QueryImageRsp::Offer {
            file_id: NEXT,
            image_size: next_image(500).len() as u32,
        }
    );
    assert_eq!(rig.server.last_offer(), Some(NEXT));
    assert!(rig.server.seq_table().is_empty());
}

#[test]
fn query_without_newer_image_gets_no_image() {
    let mut rig = ServerRig::new(ServerConfig::default());
    query(&mut rig, CLIENT, 7);
    let sent = rig.sent();
    assert_eq!(
        sent[0].record::<QueryImageRsp>(),
        QueryImageRsp::Unavailable(ZclStatus::NoImageAvailable)
    );
    assert_eq!(sent[0].header.seq_num, 7);
    assert_eq!(rig.server.last_offer(), None);
}

#[test]
fn offline_provider_answers_immediately() {
    let mut rig = ServerRig::with_next_image(500);
    rig.store.set_offline(true);
    query(&mut rig, CLIENT, 3);
    let sent = rig.sent();
    assert_eq!(
        sent[0].record::<QueryImageRsp>(),
        QueryImageRsp::Unavailable(ZclStatus::NoImageAvailable)
    );
    assert!(rig.server.seq_table().is_empty());
}

#[test]
fn specific_file_query_uses_its_own_response_command() {
    let mut rig = ServerRig::with_next_image(100);
    rig.from_client(
        CLIENT,
        CommandId::QuerySpecificFileReq,
        9,
        &QuerySpecificFileReq {
            node_addr: [1, 2, 3, 4, 5, 6, 7, 8],
            file_id: NEXT,
            stack_version: 2,
        },
    );
    let sent = rig.sent();
    assert!(sent[0].is(CommandId::QuerySpecificFileRsp));
    assert!(matches!(
        sent[0].record::<QueryImageRsp>(),
        QueryImageRsp::Offer { file_id, .. } if file_id == NEXT
    ));
}

#[test]
fn blocks_are_served_from_the_provider() {
    let mut rig = ServerRig::with_next_image(500);
    let file = next_image(500);
    query(&mut rig, CLIENT, 1);
    rig.sent();

    rig.from_client(CLIENT, CommandId::ImageBlockReq, 2, &block_req(NEXT, 64, Some(0)));
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header.seq_num, 2);
    match sent[0].record::<ImageBlockRsp>() {
        ImageBlockRsp::Success {
            file_id,
            file_offset,
            data,
        } => {
            assert_eq!(file_id, NEXT);
            assert_eq!(file_offset, 64);
            assert_eq!(data.as_slice(), &file[64..128]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn block_for_unoffered_file_is_refused() {
    let mut rig = ServerRig::with_next_image(500);
    query(&mut rig, CLIENT, 1);
    rig.sent();
    let other = FileId::new(NEXT.manufacturer, NEXT.image_type, 77);
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 5, &block_req(other, 0, None));
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header.command, ZCL_CMD_DEFAULT_RSP);
    let rsp: DefaultRsp = sent[0].record();
    assert_eq!(rsp.command_id, CommandId::ImageBlockReq as u8);
    assert_eq!(rsp.status, ZclStatus::NoImageAvailable);
}

#[test]
fn delay_mismatch_tells_client_to_slow_down() {
    let mut rig = ServerRig::new(ServerConfig {
        min_block_req_delay_ms: 500,
        ..ServerConfig::default()
    });
    rig.store.add_image(NEXT, next_image(500));
    query(&mut rig, CLIENT, 1);
    rig.sent();

    rig.from_client(CLIENT, CommandId::ImageBlockReq, 2, &block_req(NEXT, 0, Some(0)));
    assert_eq!(
        rig.sent()[0].record::<ImageBlockRsp>(),
        ImageBlockRsp::WaitForData {
            current_time: 0,
            request_time: 0,
            block_req_delay: 500,
        }
    );

    // Matching delay, or no rate-limit support at all, is served.
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 3, &block_req(NEXT, 0, Some(500)));
    assert!(matches!(rig.sent()[0].record::<ImageBlockRsp>(), ImageBlockRsp::Success { .. }));
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 4, &block_req(NEXT, 0, None));
    assert!(matches!(rig.sent()[0].record::<ImageBlockRsp>(), ImageBlockRsp::Success { .. }));
}

#[test]
fn busy_provider_makes_client_wait() {
    let mut rig = ServerRig::with_next_image(500);
    query(&mut rig, CLIENT, 1);
    rig.sent();
    rig.store.set_busy_reads(1);
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 2, &block_req(NEXT, 0, Some(0)));
    assert_eq!(
        rig.sent()[0].record::<ImageBlockRsp>(),
        ImageBlockRsp::WaitForData {
            current_time: 0,
            request_time: rig.server.config().send_block_wait_secs,
            block_req_delay: 0,
        }
    );
}

#[test]
fn failed_read_aborts_transfer() {
    let mut rig = ServerRig::with_next_image(500);
    query(&mut rig, CLIENT, 1);
    rig.sent();
    rig.store.set_failing_reads(true);
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 2, &block_req(NEXT, 0, Some(0)));
    assert_eq!(rig.sent()[0].record::<ImageBlockRsp>(), ImageBlockRsp::Abort);
}

#[test]
fn read_past_end_of_file_aborts_instead_of_empty_block() {
    let mut rig = ServerRig::with_next_image(500);
    let file_len = next_image(500).len() as u32;
    query(&mut rig, CLIENT, 1);
    rig.sent();
    rig.from_client(CLIENT, CommandId::ImageBlockReq, 2, &block_req(NEXT, file_len, Some(0)));
    assert_eq!(rig.sent()[0].record::<ImageBlockRsp>(), ImageBlockRsp::Abort);
}

#[test]
fn successful_end_schedules_upgrade() {
    let mut rig = ServerRig::with_next_image(500);
    rig.now = 120_000;
    rig.from_client(
        CLIENT,
        CommandId::UpgradeEndReq,
        11,
        &UpgradeEndReq {
            status: ZclStatus::Success,
            file_id: Some(NEXT),
        },
    );
    let sent = rig.sent();
    assert!(sent[0].is(CommandId::UpgradeEndRsp));
    assert_eq!(sent[0].header.seq_num, 11);
    let rsp: UpgradeEndRsp = sent[0].record();
    assert_eq!(rsp.file_id, NEXT);
    assert_eq!(rsp.current_time, 120);
    assert_eq!(rsp.upgrade_time, 120 + rig.server.config().upgrade_delay_secs);
    assert_eq!(rig.store.reports(), &[(CLIENT, Some(NEXT), ZclStatus::Success)]);
    assert!(rig.sink.events().contains(&OtaEvent::TransferEnded {
        peer: CLIENT,
        status: ZclStatus::Success,
    }));
}

#[test]
fn failed_end_is_acknowledged_with_default_response() {
    let mut rig = ServerRig::with_next_image(500);
    rig.from_client(
        CLIENT,
        CommandId::UpgradeEndReq,
        12,
        &UpgradeEndReq {
            status: ZclStatus::InvalidImage,
            file_id: Some(NEXT),
        },
    );
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    let rsp: DefaultRsp = sent[0].record();
    assert_eq!(rsp.command_id, CommandId::UpgradeEndReq as u8);
    assert_eq!(rsp.status, ZclStatus::Success);
    assert_eq!(sent[0].header.seq_num, 12);
}

#[test]
fn fourth_concurrent_query_is_still_answered() {
    let mut rig = ServerRig::with_next_image(500);
    let peers: Vec<PeerAddr> = (0..4).map(|i| PeerAddr::new(0x2000 + i, 20)).collect();
    for (i, peer) in peers.iter().enumerate() {
        rig.server.post_frame(crate::mock_ports::frame_from(
            *peer,
            CommandId::QueryNextImageReq,
            50 + i as u8,
            &QueryNextImageReq {
                file_id: CURRENT,
                hardware_version: None,
            },
        ));
    }
    rig.poll_frames();
    assert_eq!(rig.server.seq_table().len(), 3);

    rig.answer_provider();
    let sent = rig.sent();
    assert_eq!(sent.len(), 4);
    for (i, peer) in peers.iter().enumerate() {
        let rsp = sent.iter().find(|s| s.dst == *peer).expect("every peer answered");
        assert!(matches!(rsp.record::<QueryImageRsp>(), QueryImageRsp::Offer { .. }));
        if i < 3 {
            assert_eq!(rsp.header.seq_num, 50 + i as u8);
        }
    }
    assert!(rig.server.seq_table().is_empty());
}

#[test]
fn malformed_request_gets_malformed_status() {
    let mut rig = ServerRig::with_next_image(500);
    let header = ZclHeader::cluster(Direction::ClientToServer, 21, CommandId::ImageBlockReq as u8);
    rig.server.post_frame(InboundFrame {
        src: CLIENT,
        dst_endpoint: 20,
        cluster_id: OTA_CLUSTER_ID,
        was_broadcast: false,
        data: build_frame(&header, &[0x00, 0x01, 0x02]).unwrap(),
    });
    rig.settle();
    let rsp: DefaultRsp = rig.sent()[0].record();
    assert_eq!(rsp.status, ZclStatus::MalformedCommand);
}

#[test]
fn page_request_is_unsupported() {
    let mut rig = ServerRig::with_next_image(500);
    rig.from_client(
        CLIENT,
        CommandId::ImagePageReq,
        22,
        &ImagePageReq {
            file_id: NEXT,
            file_offset: 0,
            max_data_size: 64,
            page_size: 256,
            response_spacing: 0,
            node_addr: None,
        },
    );
    let rsp: DefaultRsp = rig.sent()[0].record();
    assert_eq!(rsp.status, ZclStatus::UnsupClusterCommand);
}

#[test]
fn manufacturer_specific_command_is_refused() {
    let mut rig = ServerRig::with_next_image(500);
    let mut header =
        ZclHeader::cluster(Direction::ClientToServer, 23, CommandId::QueryNextImageReq as u8);
    header.manufacturer_code = Some(0x1234);
    rig.server.post_frame(InboundFrame {
        src: CLIENT,
        dst_endpoint: 20,
        cluster_id: OTA_CLUSTER_ID,
        was_broadcast: false,
        data: build_frame(&header, &[0u8; 9]).unwrap(),
    });
    rig.settle();
    let rsp: DefaultRsp = rig.sent()[0].record();
    assert_eq!(rsp.status, ZclStatus::UnsupManuClusterCommand);
    assert!(rig.store.calls().is_empty());
}

#[test]
fn image_notify_goes_out_with_fresh_sequence() {
    let mut rig = ServerRig::with_next_image(500);
    let broadcast = PeerAddr::new(PeerAddr::BROADCAST, 20);
    let mut ports = zcl_ota::server::ServerPorts {
        transport: &mut rig.net,
        provider: &mut rig.store,
        sink: &mut rig.sink,
    };
    assert!(rig
        .server
        .send_image_notify(broadcast, &ImageNotify::for_file(NEXT, 50), &mut ports));
    let sent = rig.sent();
    assert!(sent[0].is(CommandId::ImageNotify));
    assert!(sent[0].header.disable_default_rsp);
    assert_eq!(sent[0].record::<ImageNotify>(), ImageNotify::for_file(NEXT, 50));
}
