//! Fragmented messages and the closing handshake, seen from the host.

use std::{
    cell::RefCell,
    io::{self, ErrorKind, Read, Write},
    rc::Rc,
    sync::mpsc::{channel, Receiver, Sender},
};

use bytes::Bytes;
use ripple_ws::{
    error::ProtocolError, ConnectionState, Error, Event, Handler, InputStream, Message, WebSocket,
    WebSocketConfig,
};

const RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

#[derive(Debug, Default)]
struct MockIo {
    input: Vec<u8>,
    output: Vec<u8>,
}

impl Read for MockIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.drain(..n);
        Ok(n)
    }
}

impl Write for MockIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn connect<H: Handler>(handler: H) -> WebSocket<MockIo, H> {
    let mut ws = WebSocket::new(handler);
    ws.open_with_stream("ws://localhost/", MockIo::default()).unwrap();
    ws.on_writable();
    let io = ws.get_mut().unwrap();
    io.input.extend_from_slice(RESPONSE);
    ws.on_readable();
    assert_eq!(ws.state(), ConnectionState::Streaming);
    ws.get_mut().unwrap().output.clear();
    ws
}

fn receive<H: Handler>(ws: &mut WebSocket<MockIo, H>, bytes: &[u8]) {
    ws.get_mut().unwrap().input.extend_from_slice(bytes);
    ws.on_readable();
}

fn written<H: Handler>(ws: &mut WebSocket<MockIo, H>) -> Vec<u8> {
    ws.get_mut().map(|io| std::mem::take(&mut io.output)).unwrap_or_default()
}

fn channel_ws() -> (WebSocket<MockIo, Sender<Event>>, Receiver<Event>) {
    let (tx, rx) = channel();
    let mut ws = connect(tx);
    assert_eq!(rx.try_recv().unwrap(), Event::Connected);
    written(&mut ws);
    (ws, rx)
}

/// Everything the handler saw, in order.
#[derive(Debug, Default, Clone)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

struct Recorder(Log);

impl Handler for Recorder {
    fn on_message(&mut self, text: &str) {
        self.0.push(format!("message {text}"));
    }

    fn on_receive_stream(&mut self, stream: &mut InputStream) {
        self.0.push(format!("stream binary={}", stream.is_binary()));
        let log = self.0.clone();
        stream.set_sink(move |payload: &[u8], last: bool| {
            let kind = if last { "close" } else { "fragment" };
            log.push(format!("{kind} {}", String::from_utf8_lossy(payload)));
        });
    }

    fn on_pong(&mut self) {
        self.0.push("pong".into());
    }

    fn on_error(&mut self, message: &str, _error: &Error) {
        self.0.push(format!("error {message}"));
    }

    fn on_close(&mut self, reason: &str) {
        self.0.push(format!("closed {reason}"));
    }
}

const FRAGMENTED: &[u8] = &[
    0x01, 0x03, b'H', b'e', b'l', // text, FIN=0
    0x00, 0x03, b'l', b'o', b' ', // continuation, FIN=0
    0x89, 0x00, // ping in between
    0x80, 0x03, b'y', b'o', b'u', // continuation, FIN=1
    0x81, 0x02, b'o', b'k',
];

#[test]
fn fragmented_message_reaches_sink() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    receive(&mut ws, FRAGMENTED);

    assert_eq!(
        log.take(),
        vec!["stream binary=false", "fragment Hel", "fragment lo ", "close you", "message ok"]
    );
    assert_eq!(written(&mut ws), vec![0x8a, 0x80, 1, 2, 3, 4]);
    assert_eq!(ws.state(), ConnectionState::Streaming);
}

#[test]
fn fragmented_message_byte_by_byte() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    for byte in FRAGMENTED {
        receive(&mut ws, &[*byte]);
    }

    assert_eq!(
        log.take(),
        vec!["stream binary=false", "fragment Hel", "fragment lo ", "close you", "message ok"]
    );
}

#[test]
fn binary_stream_through_channel() {
    let (mut ws, rx) = channel_ws();
    receive(&mut ws, &[0x02, 0x02, 0xde, 0xad, 0x80, 0x02, 0xbe, 0xef]);

    assert_eq!(
        rx.try_iter().collect::<Vec<_>>(),
        vec![
            Event::StreamStarted { binary: true },
            Event::Fragment(Bytes::from_static(&[0xde, 0xad])),
            Event::StreamEnded(Bytes::from_static(&[0xbe, 0xef])),
        ]
    );
}

#[test]
fn stream_without_sink_is_dropped() {
    let (tx, rx) = channel();
    let mut ws = connect(DropStreams(tx));
    receive(&mut ws, &[0x01, 0x01, b'a', 0x80, 0x01, b'b', 0x81, 0x01, b'c']);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["c".to_owned()]);

    struct DropStreams(Sender<String>);

    impl Handler for DropStreams {
        fn on_message(&mut self, text: &str) {
            self.0.send(text.to_owned()).unwrap();
        }
    }
}

#[test]
fn invalid_utf8_in_text_stream() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    receive(&mut ws, &[0x01, 0x01, 0xff, 0x80, 0x01, b'x']);

    assert_eq!(
        log.take(),
        vec!["stream binary=false", "fragment \u{fffd}", "error Invalid fragment", "close x"]
    );
    assert_eq!(ws.state(), ConnectionState::Streaming);
}

#[test]
fn continuation_without_start_is_a_protocol_error() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    receive(&mut ws, &[0x80, 0x01, b'x']);

    assert_eq!(log.take(), vec!["error Error while streaming"]);
    assert_eq!(ws.state(), ConnectionState::Closing);
    assert_eq!(written(&mut ws), vec![0x88, 0x00]);
}

#[test]
fn new_message_inside_stream_is_a_protocol_error() {
    let (mut ws, rx) = channel_ws();
    receive(&mut ws, &[0x01, 0x01, b'a', 0x81, 0x01, b'b']);

    let events: Vec<Event> = rx.try_iter().collect();
    assert_eq!(events[..2], [Event::StreamStarted { binary: false }, Event::Fragment("a".into())]);
    assert!(matches!(&events[2], Event::Error(msg) if msg.contains("protocol error")));
    assert_eq!(ws.state(), ConnectionState::Closing);
}

#[test]
fn output_stream_round() {
    let (mut ws, _rx) = channel_ws();
    let mut stream = ws.open_write_stream(true).unwrap();
    assert!(stream.is_binary());
    ws.write_fragment(&mut stream, &[0x10, 0x20]).unwrap();
    assert!(!stream.is_first_fragment());
    ws.send_ping().unwrap();
    ws.close_stream(&mut stream).unwrap();
    assert!(stream.is_closed());

    assert_eq!(
        written(&mut ws),
        vec![
            0x02, 0x82, 1, 2, 3, 4, 0x10 ^ 1, 0x20 ^ 2, //
            0x89, 0x80, 1, 2, 3, 4, //
            0x80, 0x80, 1, 2, 3, 4,
        ]
    );
    assert!(matches!(ws.close_stream(&mut stream), Err(Error::AlreadyClosed)));
}

#[test]
fn output_stream_excludes_messages() {
    let (mut ws, _rx) = channel_ws();
    let mut stream = ws.open_write_stream(false).unwrap();
    assert!(matches!(
        ws.send_binary(b"x"),
        Err(Error::Protocol(ProtocolError::OutputStreamOpen))
    ));
    ws.close_stream(&mut stream).unwrap();
    ws.send_binary(b"x").unwrap();
}

#[test]
fn output_stream_needs_streaming() {
    let mut ws: WebSocket<MockIo, ()> = WebSocket::new(());
    assert!(matches!(ws.open_write_stream(false), Err(Error::AlreadyClosed)));
}

#[test]
fn peer_close_round_trip() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    receive(&mut ws, &[0x81, 0x02, b'h', b'i', 0x88, 0x02, 0x03, 0xe8]);

    assert_eq!(log.take(), vec!["message hi", "closed Clean close"]);
    assert_eq!(ws.state(), ConnectionState::Idle);
    assert!(ws.get_ref().is_none());

    // Nothing left to report on later events.
    ws.on_readable();
    ws.on_writable();
    ws.on_end();
    assert!(log.take().is_empty());
}

#[test]
fn peer_close_with_other_code() {
    let (mut ws, rx) = channel_ws();
    receive(&mut ws, &[0x88, 0x02, 0x03, 0xe9]);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Event::Closed("No reason given".into())]);
}

#[test]
fn our_close_completes_on_answer() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    ws.close();
    assert_eq!(ws.state(), ConnectionState::Closing);
    assert_eq!(written(&mut ws), vec![0x88, 0x00]);

    // Repeated closes send nothing more.
    ws.close();
    assert!(written(&mut ws).is_empty());

    receive(&mut ws, &[0x82, 0x01, 0x00, 0x8a, 0x00]);
    assert!(log.take().is_empty());
    assert_eq!(ws.state(), ConnectionState::Closing);

    receive(&mut ws, &[0x88, 0x00]);
    assert_eq!(log.take(), vec!["closed Close handshake completed"]);
    assert_eq!(ws.state(), ConnectionState::Idle);
}

#[test]
fn close_while_a_stream_arrives() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    receive(&mut ws, &[0x01, 0x01, b'a']);
    assert_eq!(log.take(), vec!["stream binary=false", "fragment a"]);

    ws.close();
    assert_eq!(written(&mut ws), vec![0x88, 0x00]);

    // The rest of the message is still valid input and is skipped.
    receive(&mut ws, &[0x80, 0x01, b'b', 0x88, 0x00]);
    assert_eq!(log.take(), vec!["closed Close handshake completed"]);
    assert_eq!(ws.state(), ConnectionState::Idle);
}

#[test]
fn bytes_after_a_protocol_error_are_dropped() {
    let log = Log::default();
    let mut ws = connect(Recorder(log.clone()));
    // An unexpected continuation followed by a frame with RSV1 set.
    receive(&mut ws, &[0x80, 0x01, b'x', 0xc1, 0x00]);
    assert_eq!(log.take(), vec!["error Error while streaming"]);
    assert_eq!(ws.state(), ConnectionState::Closing);

    receive(&mut ws, &[0x88, 0x00]);
    assert_eq!(log.take(), vec!["closed Close handshake completed"]);
    assert_eq!(ws.state(), ConnectionState::Idle);
}

#[test]
fn tiny_read_buffer_fits_headers() {
    let (tx, rx) = channel();
    let mut ws = WebSocket::with_config(tx, WebSocketConfig::default().read_buffer_size(2));
    ws.open_with_stream("ws://localhost/", MockIo::default()).unwrap();
    ws.on_writable();
    receive(&mut ws, RESPONSE);
    assert_eq!(rx.try_recv().unwrap(), Event::Connected);

    receive(&mut ws, &[0x82, 126, 0x00, 0x03, 1, 2, 3]);
    assert_eq!(rx.try_recv().unwrap(), Event::Message(Message::binary(vec![1u8, 2, 3])));
    assert_eq!(ws.state(), ConnectionState::Streaming);
}

#[test]
fn end_while_closing_goes_idle() {
    let (mut ws, rx) = channel_ws();
    ws.close();
    ws.on_end();
    assert_eq!(ws.state(), ConnectionState::Idle);
    assert!(rx.try_recv().is_err());
}

#[test]
fn transport_error_while_streaming_starts_closing() {
    let (mut ws, rx) = channel_ws();
    ws.on_transport_error(io::Error::new(ErrorKind::ConnectionReset, "reset"));
    assert!(matches!(rx.try_recv().unwrap(), Event::Error(msg) if msg.starts_with("Transport error")));
    assert_eq!(ws.state(), ConnectionState::Closing);
}

#[test]
fn whole_messages_both_kinds() {
    let (mut ws, rx) = channel_ws();
    receive(&mut ws, &[0x81, 0x03, b'a', b'b', b'c', 0x82, 0x02, 0x01, 0x02]);
    assert_eq!(
        rx.try_iter().collect::<Vec<_>>(),
        vec![
            Event::Message(Message::text("abc")),
            Event::Message(Message::binary(vec![1u8, 2])),
        ]
    );
}
