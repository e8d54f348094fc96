//! Fuzz target: ZCL header and OTA command decoders
//!
//! Splits arbitrary bytes into a header and payload, runs the payload
//! through the decoder of whichever command the header names, and asserts
//! that anything that decodes re-encodes to a record that decodes to the
//! same value.
//!
//! cargo fuzz run fuzz_frame_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use zcl_ota::protocol::{
    CommandId, DefaultRsp, ImageBlockReq, ImageBlockRsp, ImageNotify, ImagePageReq,
    QueryImageRsp, QueryNextImageReq, QuerySpecificFileReq, UpgradeEndReq, UpgradeEndRsp,
    WireRecord, ZCL_CMD_DEFAULT_RSP, ZclHeader,
};

fn check<R: WireRecord + PartialEq + core::fmt::Debug>(payload: &[u8]) {
    let Ok(record) = R::decode(payload) else {
        return;
    };
    let bytes = record.to_payload().expect("decoded record re-encodes");
    let again = R::decode(&bytes).expect("re-encoded record decodes");
    assert_eq!(record, again);
}

fuzz_target!(|data: &[u8]| {
    let Ok((header, payload)) = ZclHeader::decode(data) else {
        return;
    };
    if header.command == ZCL_CMD_DEFAULT_RSP {
        check::<DefaultRsp>(payload);
    }
    match CommandId::from_u8(header.command) {
        Some(CommandId::ImageNotify) => check::<ImageNotify>(payload),
        Some(CommandId::QueryNextImageReq) => check::<QueryNextImageReq>(payload),
        Some(CommandId::QueryNextImageRsp | CommandId::QuerySpecificFileRsp) => {
            check::<QueryImageRsp>(payload);
        }
        Some(CommandId::ImageBlockReq) => check::<ImageBlockReq>(payload),
        Some(CommandId::ImagePageReq) => check::<ImagePageReq>(payload),
        Some(CommandId::ImageBlockRsp) => check::<ImageBlockRsp>(payload),
        Some(CommandId::UpgradeEndReq) => check::<UpgradeEndReq>(payload),
        Some(CommandId::UpgradeEndRsp) => check::<UpgradeEndRsp>(payload),
        Some(CommandId::QuerySpecificFileReq) => check::<QuerySpecificFileReq>(payload),
        None => {}
    }
});
