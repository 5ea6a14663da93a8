#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate ripple_ws;

use ripple_ws::RingBuffer;

fuzz_target!(|data: &[u8]| {
    let buffer = RingBuffer::from_partially_read(data, data.len().max(16));

    ripple_ws::protocol::frame::FrameHeader::parse(&buffer).ok();
});
