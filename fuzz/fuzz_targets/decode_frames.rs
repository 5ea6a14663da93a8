#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate ripple_ws;

use ripple_ws::{protocol::frame::FrameCodec, RingBuffer};

fuzz_target!(|data: &[u8]| {
    let mut buffer = RingBuffer::with_capacity(1024);
    let mut codec = FrameCodec::default();
    let mut output = Vec::new();

    // Feed the input in pieces so frames straddle the end of the storage.
    for chunk in data.chunks(97) {
        buffer.write(chunk);
        loop {
            match codec.decode(&mut buffer, &mut output) {
                Ok(Some(_)) => output.clear(),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
