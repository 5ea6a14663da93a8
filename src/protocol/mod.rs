//! Client WebSocket connection driven by transport events.

pub mod frame;

mod fragment;
mod handler;
mod message;

pub use self::{
    fragment::{InputStream, OutputStream, StreamSink},
    frame::MaskKey,
    handler::{Event, Handler},
    message::Message,
};

use std::io::{self, ErrorKind, Read, Write};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use log::*;
use url::Url;

use self::frame::{
    coding::{Data, OpCode},
    data_opcode, Decoded, Frame, FrameCodec, FrameEvent, CLOSE_FRAME,
};
use crate::{
    buffer::RingBuffer,
    client::{self, Connector},
    error::{CapacityError, Error, ProtocolError, Result, UrlError},
    handshake::client::{ClientHandshake, Response, RESERVED_HEADERS},
};

/// Reason reported when our close is answered by the peer.
const CLOSE_HANDSHAKE_COMPLETED: &str = "Close handshake completed";

/// Smallest read buffer used; any frame header fits it whole.
const MIN_READ_BUFFER_SIZE: usize = 16;

/// The settings for a WebSocket connection.
///
/// # Example
///
/// ```
/// # use ripple_ws::protocol::{MaskKey, WebSocketConfig};
/// let conf = WebSocketConfig::default()
///     .read_buffer_size(256 * 1024)
///     .mask(MaskKey::Random);
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// Capacity of the ring buffer incoming frames are assembled in; a frame must fit it
    /// whole. The default value is 64 KiB + 16 bytes, enough for any 16-bit length frame.
    /// Values below 16 bytes are raised to 16.
    pub read_buffer_size: usize,
    /// The max size of bytes queued for sending but not yet accepted by the transport.
    /// Sends beyond it fail with [`CapacityError::WriteBufferFull`]. The default value is
    /// 16 MiB.
    pub max_write_buffer_size: usize,
    /// How outgoing frames are masked. The default is [`MaskKey::Fixed`].
    pub mask: MaskKey,
    /// Check the server's `Sec-WebSocket-Accept` header. Off by default.
    pub verify_accept_key: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: (64 * 1024) + 16,
            max_write_buffer_size: 16 << 20,
            mask: MaskKey::default(),
            verify_accept_key: false,
        }
    }
}

impl WebSocketConfig {
    /// Set [`Self::read_buffer_size`].
    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// Set [`Self::max_write_buffer_size`].
    pub fn max_write_buffer_size(mut self, max_write_buffer_size: usize) -> Self {
        self.max_write_buffer_size = max_write_buffer_size;
        self
    }

    /// Set [`Self::mask`].
    pub fn mask(mut self, mask: MaskKey) -> Self {
        self.mask = mask;
        self
    }

    /// Set [`Self::verify_accept_key`].
    pub fn verify_accept_key(mut self, verify_accept_key: bool) -> Self {
        self.verify_accept_key = verify_accept_key;
        self
    }
}

/// The lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Idle,
    /// The upgrade request is being sent or its response awaited.
    Upgrading,
    /// Frames flow in both directions.
    Streaming,
    /// Our close frame is out; waiting for the peer's.
    Closing,
}

/// Per-connection framing state, alive from the upgrade until the connection is idle.
#[derive(Debug)]
struct Session {
    input: RingBuffer,
    codec: FrameCodec,
    /// Receive: the fragmented message in progress.
    incoming: Option<InputStream>,
    /// Send: whether an output stream is open.
    writing: bool,
}

impl Session {
    fn new(leftover: &[u8], config: &WebSocketConfig) -> Self {
        Session {
            input: RingBuffer::from_partially_read(
                leftover,
                config.read_buffer_size.max(MIN_READ_BUFFER_SIZE),
            ),
            codec: FrameCodec::new(config.mask),
            incoming: None,
            writing: false,
        }
    }

    /// Decode and dispatch every complete frame in the buffer.
    ///
    /// Returns the close reason if the peer closed the connection.
    fn dispatch<H: Handler>(
        &mut self,
        handler: &mut H,
        output: &mut Vec<u8>,
    ) -> Result<Option<&'static str>> {
        while let Some(Decoded { event, .. }) = self.codec.decode(&mut self.input, output)? {
            match event {
                FrameEvent::Message(Message::Text(text)) => handler.on_message(&text),
                FrameEvent::Message(Message::Binary(data)) => handler.on_binary(&data),
                FrameEvent::InvalidUtf8 => {
                    handler.on_error("Text message is not valid UTF-8", &Error::Utf8)
                }
                FrameEvent::StreamStart { binary, payload } => {
                    let mut stream = InputStream::new(binary);
                    handler.on_receive_stream(&mut stream);
                    if let Err(e) = stream.push(&payload) {
                        handler.on_error("Invalid fragment", &e);
                    }
                    self.incoming = Some(stream);
                }
                FrameEvent::StreamFragment(payload) => {
                    if let Some(stream) = self.incoming.as_mut() {
                        if let Err(e) = stream.push(&payload) {
                            handler.on_error("Invalid fragment", &e);
                        }
                    }
                }
                FrameEvent::StreamEnd(payload) => {
                    if let Some(stream) = self.incoming.take() {
                        if let Err(e) = stream.finish(&payload) {
                            handler.on_error("Invalid fragment", &e);
                        }
                    }
                }
                FrameEvent::Ping => trace!("Received ping, pong queued"),
                FrameEvent::Pong => handler.on_pong(),
                FrameEvent::Close(code) => return Ok(Some(FrameEvent::close_reason(code))),
            }
        }
        Ok(None)
    }

    /// Drop everything up to the peer's close frame. Returns whether it arrived.
    fn drain_until_close(&mut self) -> Result<bool> {
        // Replies to whatever arrives now are never sent.
        let mut discarded = Vec::new();
        while let Some(Decoded { event, consumed }) =
            self.codec.decode(&mut self.input, &mut discarded)?
        {
            if let FrameEvent::Close(code) = event {
                debug!("Peer answered our close (code {:?})", code);
                return Ok(true);
            }
            trace!("Dropping {} bytes received while closing", consumed);
            discarded.clear();
        }
        Ok(false)
    }
}

/// Internal state, owning what only exists in that phase.
#[derive(Debug)]
enum State {
    Idle,
    Upgrading(ClientHandshake),
    Streaming(Session),
    Closing(Session),
}

/// What reading the transport in a framed state came to.
enum Progress {
    /// Everything available was processed.
    Blocked,
    /// The transport reported end of stream.
    End,
    /// The peer's close frame arrived.
    Closed(&'static str),
}

/// A client WebSocket connection.
///
/// The connection never blocks and owns no thread. The host opens it, then reports
/// transport readiness through [`on_readable`](Self::on_readable),
/// [`on_writable`](Self::on_writable), [`on_transport_error`](Self::on_transport_error)
/// and [`on_end`](Self::on_end); everything that happens is delivered to the
/// [`Handler`].
#[derive(Debug)]
pub struct WebSocket<S, H> {
    stream: Option<S>,
    state: State,
    handler: H,
    config: WebSocketConfig,
    url: Option<Url>,
    extra_headers: HeaderMap,
    /// Send: encoded bytes the transport has not accepted yet.
    out_buffer: Vec<u8>,
    response: Option<Response>,
}

impl<S: Read + Write, H: Handler> WebSocket<S, H> {
    /// An idle connection reporting to `handler`.
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, WebSocketConfig::default())
    }

    /// An idle connection with custom settings.
    pub fn with_config(handler: H, config: WebSocketConfig) -> Self {
        WebSocket {
            stream: None,
            state: State::Idle,
            handler,
            config,
            url: None,
            extra_headers: HeaderMap::new(),
            out_buffer: Vec::new(),
            response: None,
        }
    }

    /// The current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            State::Idle => ConnectionState::Idle,
            State::Upgrading(_) => ConnectionState::Upgrading,
            State::Streaming(_) => ConnectionState::Streaming,
            State::Closing(_) => ConnectionState::Closing,
        }
    }

    /// The connection's settings.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// The URL of the last `open`.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// The server's answer to the upgrade request, once it arrived.
    pub fn handshake_response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Returns a shared reference to the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns a mutable reference to the handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Returns a shared reference to the transport, if there is one.
    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Returns a mutable reference to the transport, if there is one.
    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Add a header to every future upgrade request.
    ///
    /// Headers the handshake writes itself are refused with
    /// [`ProtocolError::ReservedHeader`]; `Origin` replaces the default one.
    pub fn set_extra_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        if RESERVED_HEADERS.contains(&name) {
            return Err(Error::Protocol(ProtocolError::ReservedHeader(name)));
        }
        self.extra_headers.insert(name, HeaderValue::from_str(value)?);
        Ok(())
    }

    /// Connect to `url` through `connector` and start the upgrade.
    ///
    /// The URL must be `ws://` or `wss://` with a host name. Failures are reported through
    /// [`Handler::on_error`] as well as returned; the connection then stays idle.
    pub fn open<C>(&mut self, url: &str, connector: &mut C) -> Result<()>
    where
        C: Connector<Stream = S>,
    {
        let connected = Url::parse(url)
            .map_err(|e| Error::Url(UrlError::Parse(e)))
            .and_then(|url| {
                let (host, port, mode) = client::target(&url)?;
                debug!("Opening {}", url);
                Ok((url, connector.connect(&host, port, mode)?))
            });
        match connected {
            Ok((url, stream)) => self.start(url, stream),
            Err(e) => self.refuse(e),
        }
    }

    /// Start the upgrade over a transport the host already opened.
    ///
    /// `stream` must be connected to the host `url` names and be in non-blocking mode.
    pub fn open_with_stream(&mut self, url: &str, stream: S) -> Result<()> {
        let parsed =
            Url::parse(url).map_err(|e| Error::Url(UrlError::Parse(e))).and_then(|url| {
                client::target(&url)?;
                Ok(url)
            });
        match parsed {
            Ok(url) => self.start(url, stream),
            Err(e) => self.refuse(e),
        }
    }

    fn start(&mut self, url: Url, stream: S) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            debug!("Reopening, dropping the current connection");
            self.enter_idle();
        }
        let handshake =
            match ClientHandshake::new(&url, &self.extra_headers, self.config.verify_accept_key) {
                Ok(handshake) => handshake,
                Err(e) => return self.refuse(e),
            };
        debug!("Upgrading {}", url);
        self.url = Some(url);
        self.response = None;
        self.stream = Some(stream);
        self.state = State::Upgrading(handshake);
        Ok(())
    }

    fn refuse(&mut self, error: Error) -> Result<()> {
        self.handler.on_error("Unable to open connection", &error);
        Err(error)
    }

    /// The transport has data to read.
    pub fn on_readable(&mut self) {
        match self.state {
            State::Idle => trace!("Readable while idle, ignored"),
            State::Upgrading(_) => self.read_handshake(),
            State::Streaming(_) => self.read_streaming(),
            State::Closing(_) => self.read_closing(),
        }
    }

    /// The transport accepts more data.
    pub fn on_writable(&mut self) {
        match self.state {
            State::Idle => trace!("Writable while idle, ignored"),
            State::Upgrading(ref mut handshake) => {
                let Some(stream) = self.stream.as_mut() else { return };
                if let Err(e) = handshake.write_request(stream) {
                    self.fail_handshake(e);
                }
            }
            State::Streaming(_) => {
                if let Err(e) = self.flush() {
                    self.fail_streaming("Unable to write", e);
                }
            }
            State::Closing(_) => {
                if let Err(e) = self.flush() {
                    debug!("Unable to flush while closing: {}", e);
                    self.enter_idle();
                }
            }
        }
    }

    /// The transport failed.
    pub fn on_transport_error(&mut self, error: io::Error) {
        match self.state {
            State::Idle => debug!("Transport error while idle: {}", error),
            State::Upgrading(_) => self.fail_handshake(error.into()),
            State::Streaming(_) => self.fail_streaming("Transport error", error.into()),
            State::Closing(_) => {
                debug!("Transport error while closing: {}", error);
                self.enter_idle();
            }
        }
    }

    /// The transport reached end of stream.
    pub fn on_end(&mut self) {
        match self.state {
            State::Idle => {}
            State::Upgrading(_) => self.fail_handshake(Error::ConnectionClosed),
            State::Streaming(_) => {
                self.handler
                    .on_error("Unexpected close during streaming", &Error::ConnectionClosed);
                self.enter_idle();
            }
            State::Closing(_) => {
                debug!("Transport ended while closing");
                self.enter_idle();
            }
        }
    }

    /// Send a text message.
    ///
    /// Outside [`ConnectionState::Streaming`] the message is dropped with a warning.
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        self.send_data(text.as_bytes(), false)
    }

    /// Send a binary message.
    ///
    /// Outside [`ConnectionState::Streaming`] the message is dropped with a warning.
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_data(data, true)
    }

    fn send_data(&mut self, data: &[u8], binary: bool) -> Result<()> {
        if let State::Streaming(Session { writing: true, .. }) = self.state {
            return Err(Error::Protocol(ProtocolError::OutputStreamOpen));
        }
        self.queue(|codec, output| codec.encode_message(data, binary, output))
    }

    /// Send a ping with an empty payload.
    pub fn send_ping(&mut self) -> Result<()> {
        self.queue(|codec, output| codec.encode_ping(output))
    }

    /// Start sending a fragmented message.
    ///
    /// Only one output stream may be open at a time, and no whole messages can be sent
    /// until it is closed.
    pub fn open_write_stream(&mut self, binary: bool) -> Result<OutputStream> {
        match self.state {
            State::Streaming(ref session) if session.writing => {
                Err(Error::Protocol(ProtocolError::OutputStreamOpen))
            }
            State::Streaming(ref mut session) => {
                session.writing = true;
                Ok(OutputStream::new(binary))
            }
            _ => Err(Error::AlreadyClosed),
        }
    }

    /// Send `data` as the next fragment of `stream`.
    ///
    /// A rejected fragment leaves `stream` as it was.
    pub fn write_fragment(&mut self, stream: &mut OutputStream, data: &[u8]) -> Result<()> {
        let opcode = fragment_opcode(stream.next_frame()?, stream.is_binary());
        let frame = Frame::message(Bytes::copy_from_slice(data), opcode, false);
        self.queue(|codec, output| codec.encode(frame, output))?;
        stream.commit(false);
        Ok(())
    }

    /// Finish `stream` with an empty final frame.
    ///
    /// If the frame is rejected the stream stays open and can be closed again.
    pub fn close_stream(&mut self, stream: &mut OutputStream) -> Result<()> {
        let opcode = fragment_opcode(stream.next_frame()?, stream.is_binary());
        let frame = Frame::message(Bytes::new(), opcode, true);
        self.queue(|codec, output| codec.encode(frame, output))?;
        stream.commit(true);
        if let State::Streaming(ref mut session) = self.state {
            session.writing = false;
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// While streaming a close frame is sent and the peer's answer is awaited; during the
    /// upgrade the transport is dropped right away.
    pub fn close(&mut self) {
        match self.state {
            State::Streaming(_) => self.enter_closing(false),
            State::Upgrading(_) => self.enter_idle(),
            State::Idle | State::Closing(_) => debug!("Close while {:?}, ignored", self.state()),
        }
    }

    /// Append what `encode` produces to the send queue and flush.
    ///
    /// On `Err` from `encode` or a full queue nothing is queued.
    fn queue<F>(&mut self, encode: F) -> Result<()>
    where
        F: FnOnce(&FrameCodec, &mut Vec<u8>) -> Result<()>,
    {
        let State::Streaming(ref session) = self.state else {
            warn!("Dropping a frame sent while {:?}", self.state());
            return Ok(());
        };
        let queued = self.out_buffer.len();
        if let Err(e) = encode(&session.codec, &mut self.out_buffer) {
            self.out_buffer.truncate(queued);
            return Err(e);
        }
        if self.out_buffer.len() > self.config.max_write_buffer_size {
            self.out_buffer.truncate(queued);
            return Err(Error::Capacity(CapacityError::WriteBufferFull));
        }
        self.flush().map_err(|e| {
            self.handler.on_error("Unable to write", &e);
            self.enter_closing(false);
            e
        })
    }

    /// Write as much of the send queue as the transport accepts.
    fn flush(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.out_buffer.is_empty() {
            match stream.write(&self.out_buffer) {
                Ok(0) => return Err(Error::Io(ErrorKind::WriteZero.into())),
                Ok(n) => {
                    trace!("Wrote {} of {} queued bytes", n, self.out_buffer.len());
                    self.out_buffer.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match stream.flush() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn read_handshake(&mut self) {
        let (State::Upgrading(handshake), Some(stream)) = (&mut self.state, self.stream.as_mut())
        else {
            return;
        };
        match handshake.read_response(stream) {
            Ok(None) => {}
            Ok(Some((response, leftover))) => {
                debug!("Connection upgraded, {} bytes already received", leftover.len());
                self.response = Some(response);
                self.state = State::Streaming(Session::new(&leftover, &self.config));
                self.handler.on_connect();
                self.read_streaming();
            }
            Err(e) => self.fail_handshake(e),
        }
    }

    fn read_streaming(&mut self) {
        match self.pump_streaming() {
            Ok(Progress::Blocked) => {
                if let Err(e) = self.flush() {
                    self.fail_streaming("Unable to write", e);
                }
            }
            Ok(Progress::Closed(reason)) => {
                // The echo is best effort, the transport is dropped right after.
                if let Err(e) = self.flush() {
                    debug!("Unable to echo close: {}", e);
                }
                self.handler.on_close(reason);
                self.enter_idle();
            }
            Ok(Progress::End) => self.on_end(),
            Err(e) => self.fail_streaming("Error while streaming", e),
        }
    }

    fn pump_streaming(&mut self) -> Result<Progress> {
        let (State::Streaming(session), Some(stream)) = (&mut self.state, self.stream.as_mut())
        else {
            return Ok(Progress::Blocked);
        };
        loop {
            if let Some(reason) = session.dispatch(&mut self.handler, &mut self.out_buffer)? {
                return Ok(Progress::Closed(reason));
            }
            match session.input.read_from(stream) {
                Ok(0) if session.input.available_to_write() == 0 => return Ok(Progress::Blocked),
                Ok(0) => return Ok(Progress::End),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_closing(&mut self) {
        match self.pump_closing() {
            Ok(Progress::Blocked) => {}
            Ok(Progress::Closed(reason)) => {
                self.handler.on_close(reason);
                self.enter_idle();
            }
            Ok(Progress::End) => {
                debug!("Transport ended before the peer answered our close");
                self.enter_idle();
            }
            Err(e) => {
                debug!("Error while closing: {}", e);
                self.enter_idle();
            }
        }
    }

    fn pump_closing(&mut self) -> Result<Progress> {
        let (State::Closing(session), Some(stream)) = (&mut self.state, self.stream.as_mut())
        else {
            return Ok(Progress::Blocked);
        };
        loop {
            if session.drain_until_close()? {
                return Ok(Progress::Closed(CLOSE_HANDSHAKE_COMPLETED));
            }
            match session.input.read_from(stream) {
                Ok(0) if session.input.available_to_write() == 0 => return Ok(Progress::Blocked),
                Ok(0) => return Ok(Progress::End),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fail_handshake(&mut self, error: Error) {
        self.handler.on_error("Handshake failed", &error);
        self.enter_idle();
    }

    fn fail_streaming(&mut self, message: &str, error: Error) {
        self.handler.on_error(message, &error);
        self.enter_closing(true);
    }

    /// Send our close and wait for the peer's.
    ///
    /// The codec keeps its fragment state so the rest of a message the peer is sending
    /// still decodes. With `discard_input` the unread bytes are dropped; they are what
    /// failed to decode.
    fn enter_closing(&mut self, discard_input: bool) {
        let mut session = match std::mem::replace(&mut self.state, State::Idle) {
            State::Streaming(session) => session,
            other => {
                self.state = other;
                return;
            }
        };
        debug!("Closing");
        session.incoming = None;
        session.writing = false;
        if discard_input {
            let dropped = session.input.consume(session.input.available_to_read());
            trace!("Discarded {} unread bytes", dropped);
        }
        self.state = State::Closing(session);
        self.out_buffer.extend_from_slice(&CLOSE_FRAME);
        if let Err(e) = self.flush() {
            debug!("Unable to send close: {}", e);
            self.enter_idle();
        }
    }

    fn enter_idle(&mut self) {
        debug!("Connection idle");
        self.state = State::Idle;
        self.out_buffer.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.flush() {
                trace!("Flush on teardown failed: {}", e);
            }
        }
    }
}

/// Text/Binary for the first frame of a fragmented message, continuation after.
fn fragment_opcode(first: bool, binary: bool) -> OpCode {
    if first {
        data_opcode(binary)
    } else {
        OpCode::Data(Data::Continue)
    }
}
