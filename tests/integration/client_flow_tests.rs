//! Client engine against a scripted server.

use zcl_ota::app::events::OtaEvent;
use zcl_ota::client::staging::{CopyStatus, CrcStatus, read_meta};
use zcl_ota::client::UpgradeStatus;
use zcl_ota::config::ClientConfig;
use zcl_ota::protocol::{
    BlockData, CommandId, DefaultRsp, FileId, ImageBlockReq, ImageBlockRsp, QueryImageRsp, UPGRADE_TIME_WAIT,
    UpgradeEndReq, UpgradeEndRsp, ZclStatus,
};

use crate::mock_ports::{ClientRig, NEXT, SERVER, Sent, next_image, slice};

fn offer(rig: &mut ClientRig, image_size: u32) {
    rig.from_server(
        CommandId::QueryNextImageRsp,
        &QueryImageRsp::Offer {
            file_id: NEXT,
            image_size,
        },
    );
}

/// Answer every block request with data from `file`.  Returns the offsets
/// requested and whatever the client sent after its last request.
fn serve_blocks(rig: &mut ClientRig, file: &[u8]) -> (Vec<u32>, Vec<Sent>) {
    let mut offsets = Vec::new();
    loop {
        let sent = rig.sent();
        let Some(req) = sent.iter().find(|s| s.is(CommandId::ImageBlockReq)) else {
            return (offsets, sent);
        };
        let req: ImageBlockReq = req.record();
        offsets.push(req.file_offset);
        rig.from_server(
            CommandId::ImageBlockRsp,
            &ImageBlockRsp::Success {
                file_id: req.file_id,
                file_offset: req.file_offset,
                data: slice(file, req.file_offset, req.max_data_size),
            },
        );
    }
}

fn end_rsp(rig: &mut ClientRig, current_time: u32, upgrade_time: u32) {
    rig.from_server(
        CommandId::UpgradeEndRsp,
        &UpgradeEndRsp {
            file_id: NEXT,
            current_time,
            upgrade_time,
        },
    );
}

fn last_end_req(sent: &[Sent]) -> UpgradeEndReq {
    sent.iter()
        .rev()
        .find(|s| s.is(CommandId::UpgradeEndReq))
        .expect("upgrade end sent")
        .record()
}

#[test]
fn full_download_counts_down_and_resets() {
    let mut rig = ClientRig::new(ClientRig::config());
    let file = next_image(938);
    assert_eq!(file.len(), 1000);

    offer(&mut rig, 1000);
    assert_eq!(rig.client.status(), UpgradeStatus::InProgress);

    let (offsets, after) = serve_blocks(&mut rig, &file);
    let expected: Vec<u32> = (0..16).map(|i| i * 64).collect();
    assert_eq!(offsets, expected);
    assert_eq!(rig.client.status(), UpgradeStatus::Complete);

    let end = last_end_req(&after);
    assert_eq!(end.status, ZclStatus::Success);
    assert_eq!(end.file_id, Some(NEXT));
    assert!(after.iter().all(|s| s.dst == SERVER));

    end_rsp(&mut rig, 100, 160);
    assert_eq!(rig.client.status(), UpgradeStatus::Countdown);
    assert!(rig.sink.events().contains(&OtaEvent::UpgradeScheduled { delay_secs: 60 }));

    rig.advance(59_999);
    assert_eq!(rig.device.resets(), 0);
    rig.advance(1);
    assert_eq!(rig.device.resets(), 1);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert_eq!(rig.sink.last_finish(), Some(ZclStatus::Success));

    let meta = read_meta(&mut rig.storage).unwrap();
    assert_eq!(meta.file_id, NEXT);
    assert_eq!(meta.image_len, 938);
    assert_eq!(meta.crc_status, CrcStatus::Valid);
    assert_eq!(meta.copy_status, CopyStatus::NeedCopy);
}

#[test]
fn progress_tracks_offset_attribute() {
    let mut rig = ClientRig::new(ClientRig::config());
    let file = next_image(200);
    offer(&mut rig, file.len() as u32);
    let req: ImageBlockReq = rig.sent()[0].record();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::Success {
            file_id: NEXT,
            file_offset: 0,
            data: slice(&file, 0, req.max_data_size),
        },
    );
    let attrs = rig.client.attributes();
    assert_eq!(attrs.file_offset, 64);
    assert_eq!(attrs.downloaded_file_version, Some(NEXT.version));
    assert_eq!(attrs.image_upgrade_status, UpgradeStatus::InProgress);
}

#[test]
fn block_timeouts_escalate_to_abort() {
    let config = ClientRig::config();
    let timeout = u64::from(config.block_rsp_timeout_ms);
    let retries = config.max_block_retries;
    let mut rig = ClientRig::new(config);
    offer(&mut rig, 500);
    assert_eq!(rig.sent().len(), 1);

    for attempt in 1..=retries {
        rig.advance(timeout);
        let sent = rig.sent();
        assert_eq!(sent.len(), 1, "retry {attempt} re-sends the block request");
        let req: ImageBlockReq = sent[0].record();
        assert_eq!(req.file_offset, 0);
        assert_eq!(rig.client.block_retries(), attempt);
    }

    rig.advance(timeout);
    let sent = rig.sent();
    assert_eq!(last_end_req(&sent).status, ZclStatus::Abort);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert!(rig.client.session().is_none());
    assert_eq!(rig.sink.last_finish(), Some(ZclStatus::Abort));
    assert_eq!(rig.device.resets(), 0);
}

#[test]
fn largest_retry_budget_still_aborts() {
    let config = ClientConfig {
        max_block_retries: u8::MAX,
        ..ClientRig::config()
    };
    let timeout = u64::from(config.block_rsp_timeout_ms);
    let mut rig = ClientRig::new(config);
    offer(&mut rig, 500);
    for _ in 0..u8::MAX {
        rig.advance(timeout);
    }
    assert_eq!(rig.client.status(), UpgradeStatus::InProgress);
    assert_eq!(rig.client.block_retries(), u8::MAX);
    rig.advance(timeout);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert_eq!(rig.sink.last_finish(), Some(ZclStatus::Abort));
}

#[test]
fn empty_blocks_never_hold_the_session_open() {
    let config = ClientRig::config();
    let timeout = u64::from(config.block_rsp_timeout_ms);
    let retries = config.max_block_retries;
    let mut rig = ClientRig::new(config);
    offer(&mut rig, 500);
    rig.sent();

    let empty = ImageBlockRsp::Success {
        file_id: NEXT,
        file_offset: 0,
        data: BlockData::new(),
    };
    for _ in 0..=retries {
        rig.from_server(CommandId::ImageBlockRsp, &empty);
        if let Some(session) = rig.client.session() {
            assert_eq!(session.offset, 0);
        }
        rig.advance(timeout);
    }
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert_eq!(rig.sink.last_finish(), Some(ZclStatus::Abort));
}

#[test]
fn duplicate_block_is_not_written_twice() {
    let mut rig = ClientRig::new(ClientRig::config());
    let file = next_image(300);
    offer(&mut rig, file.len() as u32);
    rig.sent();

    let first = ImageBlockRsp::Success {
        file_id: NEXT,
        file_offset: 0,
        data: slice(&file, 0, 64),
    };
    rig.from_server(CommandId::ImageBlockRsp, &first);
    rig.sent();
    rig.from_server(CommandId::ImageBlockRsp, &first);
    assert_eq!(rig.client.session().unwrap().offset, 64);
    // Stale block: no default response, no new request.
    assert!(rig.sent().is_empty());
}

#[test]
fn block_for_another_file_is_ignored() {
    let mut rig = ClientRig::new(ClientRig::config());
    let file = next_image(300);
    offer(&mut rig, file.len() as u32);
    rig.sent();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::Success {
            file_id: FileId::new(NEXT.manufacturer, NEXT.image_type, 9),
            file_offset: 0,
            data: slice(&file, 0, 64),
        },
    );
    assert_eq!(rig.client.session().unwrap().offset, 0);
    assert!(rig.sent().is_empty());
}

#[test]
fn wait_for_data_defers_next_request() {
    let mut rig = ClientRig::new(ClientRig::config());
    offer(&mut rig, 500);
    rig.sent();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::WaitForData {
            current_time: 10,
            request_time: 40,
            block_req_delay: 0,
        },
    );
    rig.advance(29_999);
    assert!(rig.sent().is_empty());
    rig.advance(1);
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is(CommandId::ImageBlockReq));
}

#[test]
fn rate_limit_is_adopted() {
    let config = ClientRig::config();
    let guard = u64::from(config.block_request_guard_ms);
    let mut rig = ClientRig::new(config);
    offer(&mut rig, 500);
    rig.sent();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::WaitForData {
            current_time: 0,
            request_time: 0,
            block_req_delay: 500,
        },
    );
    assert_eq!(rig.client.attributes().minimum_block_period, 500);
    rig.advance(500 + guard - 1);
    assert!(rig.sent().is_empty());
    rig.advance(1);
    let req: ImageBlockReq = rig.sent()[0].record();
    assert_eq!(req.block_req_delay, Some(500));
}

#[test]
fn adopted_rate_limit_outlives_the_session() {
    let mut rig = ClientRig::new(ClientRig::config());
    offer(&mut rig, 500);
    rig.sent();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::WaitForData {
            current_time: 0,
            request_time: 0,
            block_req_delay: 500,
        },
    );
    rig.from_server(CommandId::ImageBlockRsp, &ImageBlockRsp::Abort);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert_eq!(rig.client.attributes().minimum_block_period, 500);
    rig.sent();

    offer(&mut rig, 500);
    let req: ImageBlockReq = rig.sent()[0].record();
    assert_eq!(req.block_req_delay, Some(500));
    assert_eq!(rig.client.attributes().minimum_block_period, 500);
}

#[test]
fn server_abort_ends_session() {
    let mut rig = ClientRig::new(ClientRig::config());
    offer(&mut rig, 500);
    rig.sent();
    rig.from_server(CommandId::ImageBlockRsp, &ImageBlockRsp::Abort);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert_eq!(last_end_req(&rig.sent()).status, ZclStatus::Abort);
    assert_eq!(rig.device.poll_rate(), Some(rig.client.config().idle_poll_rate_ms));
}

#[test]
fn corrupt_header_is_invalid_image() {
    let mut rig = ClientRig::new(ClientRig::config());
    let mut file = next_image(300);
    file[0] ^= 0xFF;
    offer(&mut rig, file.len() as u32);
    rig.sent();
    rig.from_server(
        CommandId::ImageBlockRsp,
        &ImageBlockRsp::Success {
            file_id: NEXT,
            file_offset: 0,
            data: slice(&file, 0, 64),
        },
    );
    assert_eq!(last_end_req(&rig.sent()).status, ZclStatus::InvalidImage);
    assert_eq!(rig.sink.last_finish(), Some(ZclStatus::InvalidImage));
}

#[test]
fn offer_for_other_product_is_malformed() {
    let mut rig = ClientRig::new(ClientRig::config());
    rig.from_server(
        CommandId::QueryNextImageRsp,
        &QueryImageRsp::Offer {
            file_id: FileId::new(0x9999, NEXT.image_type, 2),
            image_size: 500,
        },
    );
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    let rsp: DefaultRsp = sent[0].record();
    assert_eq!(rsp.status, ZclStatus::MalformedCommand);
}

#[test]
fn oversized_offer_is_refused() {
    let mut rig = ClientRig::new(ClientRig::config());
    offer(&mut rig, 1 << 20);
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    let rsp: DefaultRsp = rig.sent()[0].record();
    assert_eq!(rsp.status, ZclStatus::Failure);
}

#[test]
fn no_image_keeps_client_idle() {
    let mut rig = ClientRig::new(ClientRig::config());
    rig.from_server(
        CommandId::QueryNextImageRsp,
        &QueryImageRsp::Unavailable(ZclStatus::NoImageAvailable),
    );
    assert_eq!(rig.client.status(), UpgradeStatus::Normal);
    assert!(rig.sink.events().contains(&OtaEvent::QueryResult {
        status: ZclStatus::NoImageAvailable
    }));
}

#[test]
fn upgrade_wait_then_scheduled() {
    let mut rig = ClientRig::new(ClientRig::config());
    let file = next_image(100);
    offer(&mut rig, file.len() as u32);
    serve_blocks(&mut rig, &file);
    assert_eq!(rig.client.status(), UpgradeStatus::Complete);

    end_rsp(&mut rig, 0, UPGRADE_TIME_WAIT);
    assert_eq!(rig.client.status(), UpgradeStatus::UpgradeWait);

    // A repeated WAIT while waiting is dropped.
    end_rsp(&mut rig, 0, UPGRADE_TIME_WAIT);
    assert_eq!(rig.client.status(), UpgradeStatus::UpgradeWait);

    end_rsp(&mut rig, 50, 55);
    assert_eq!(rig.client.status(), UpgradeStatus::Countdown);
    rig.advance(5_000);
    assert_eq!(rig.device.resets(), 1);
}

#[test]
fn upgrade_wait_polls_then_applies_when_budget_spent() {
    let config = ClientConfig {
        upgrade_wait_secs: 10,
        max_end_req_retries: 2,
        ..ClientRig::config()
    };
    let mut rig = ClientRig::new(config);
    let file = next_image(100);
    offer(&mut rig, file.len() as u32);
    serve_blocks(&mut rig, &file);
    end_rsp(&mut rig, 0, UPGRADE_TIME_WAIT);
    rig.sent();

    for _ in 0..2 {
        rig.advance(10_000);
        assert_eq!(last_end_req(&rig.sent()).status, ZclStatus::Success);
        assert_eq!(rig.client.status(), UpgradeStatus::UpgradeWait);
    }
    rig.advance(10_000);
    assert_eq!(rig.device.resets(), 1);
}

#[test]
fn missing_end_response_is_retried_then_applied() {
    let config = ClientRig::config();
    let timeout = u64::from(config.block_rsp_timeout_ms);
    let retries = config.max_end_req_retries;
    let mut rig = ClientRig::new(config);
    let file = next_image(100);
    offer(&mut rig, file.len() as u32);
    serve_blocks(&mut rig, &file);

    for _ in 0..retries {
        rig.advance(timeout);
        assert!(rig.sent().iter().any(|s| s.is(CommandId::UpgradeEndReq)));
    }
    assert_eq!(rig.device.resets(), 0);
    rig.advance(timeout);
    assert_eq!(rig.device.resets(), 1);
}

#[test]
fn query_times_out_without_answer() {
    let config = ClientRig::config();
    let query_timeout = u64::from(config.query_timeout_ms);
    let mut rig = ClientRig::new(config);
    assert!(rig.client.request_next_update(SERVER));
    rig.poll();
    let sent = rig.sent();
    assert!(sent[0].is(CommandId::QueryNextImageReq));
    rig.advance(query_timeout);
    assert!(rig.sink.events().contains(&OtaEvent::QueryTimedOut));
}

#[test]
fn specific_file_response_requests_first_block_at_once() {
    let config = ClientConfig {
        min_block_req_delay_ms: 1_000,
        ..ClientRig::config()
    };
    let mut rig = ClientRig::new(config);
    rig.from_server(
        CommandId::QuerySpecificFileRsp,
        &QueryImageRsp::Offer {
            file_id: NEXT,
            image_size: 300,
        },
    );
    let sent = rig.sent();
    assert!(sent.iter().any(|s| s.is(CommandId::ImageBlockReq)));
}

#[test]
fn poll_rate_follows_download() {
    let mut rig = ClientRig::new(ClientRig::config());
    rig.start();
    let idle = rig.client.config().idle_poll_rate_ms;
    let fast = rig.client.config().fast_poll_rate_ms;
    offer(&mut rig, 500);
    rig.from_server(CommandId::ImageBlockRsp, &ImageBlockRsp::Abort);
    assert_eq!(rig.device.poll_rate_history(), &[idle, fast, idle]);
}

#[test]
fn discovery_stops_once_server_known() {
    let mut rig = ClientRig::new(ClientRig::config());
    rig.start();
    let interval = u64::from(rig.client.config().discovery_interval_ms);
    rig.advance(interval);
    assert_eq!(rig.net.match_desc_requests(), 1);
    rig.client.request_next_update(SERVER);
    rig.poll();
    rig.advance(interval * 3);
    assert_eq!(rig.net.match_desc_requests(), 1);
    assert_eq!(rig.client.server(), Some(SERVER));
}
