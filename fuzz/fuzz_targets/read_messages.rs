#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate ripple_ws;

use std::io;

use ripple_ws::WebSocket;

// Serves the upgrade response, then the fuzz input, then reports `WouldBlock`.
struct Replay {
    data: Vec<u8>,
    pos: usize,
}

impl io::Read for Replay {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.data.len() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl io::Write for Replay {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let mut input =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
            .to_vec();
    input.extend_from_slice(data);

    let mut ws = WebSocket::new(());
    if ws.open_with_stream("ws://localhost/", Replay { data: input, pos: 0 }).is_ok() {
        ws.on_writable();
        ws.on_readable();
        ws.close();
        ws.on_readable();
    }
});
