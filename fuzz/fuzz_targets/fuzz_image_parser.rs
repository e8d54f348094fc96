//! Fuzz target: `ImageParser::feed`
//!
//! Feeds arbitrary bytes, in arbitrary chunk sizes, into the streaming OTA
//! file parser and asserts that it never panics and never forwards more
//! payload than it was given.
//!
//! cargo fuzz run fuzz_image_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use zcl_ota::client::image::ImageParser;
use zcl_ota::protocol::FileId;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk.max(1));
    let mut parser = ImageParser::new(FileId::new(0x1234, 0x5678, 2), rest.len() as u32);
    let mut forwarded = 0usize;
    for piece in rest.chunks(chunk) {
        let fed = parser.feed(piece, &mut |bytes: &[u8]| {
            forwarded += bytes.len();
            Ok(())
        });
        if fed.is_err() {
            break;
        }
    }
    assert!(forwarded <= rest.len());
    assert_eq!(forwarded as u32, parser.payload_len());
});
