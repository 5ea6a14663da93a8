//! Connection events delivered to the host.

use std::sync::mpsc::Sender;

use bytes::Bytes;

use super::{
    fragment::{InputStream, StreamSink},
    Message,
};
use crate::error::Error;

/// Receiver of connection events.
///
/// Every method defaults to doing nothing, so an implementation only overrides what it
/// cares about. Payload slices are borrowed for the duration of the call.
pub trait Handler {
    /// The handshake succeeded and the connection is streaming.
    fn on_connect(&mut self) {}

    /// A complete text message arrived.
    fn on_message(&mut self, _text: &str) {}

    /// A complete binary message arrived.
    fn on_binary(&mut self, _data: &[u8]) {}

    /// A fragmented message started; attach a sink to `stream` to receive it.
    fn on_receive_stream(&mut self, _stream: &mut InputStream) {}

    /// The peer answered a ping.
    fn on_pong(&mut self) {}

    /// Something went wrong; `message` says in which phase.
    fn on_error(&mut self, _message: &str, _error: &Error) {}

    /// The connection closed.
    fn on_close(&mut self, _reason: &str) {}
}

/// A no-op handler.
impl Handler for () {}

/// Connection events as values, for hosts that would rather drain a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// See [`Handler::on_connect`].
    Connected,
    /// A complete message.
    Message(Message),
    /// A fragmented message started.
    StreamStarted {
        /// Whether the message is binary.
        binary: bool,
    },
    /// A non-final fragment of the current stream.
    Fragment(Bytes),
    /// The final fragment of the current stream.
    StreamEnded(Bytes),
    /// See [`Handler::on_pong`].
    Pong,
    /// See [`Handler::on_error`]; carries the message and the formatted error.
    Error(String),
    /// See [`Handler::on_close`].
    Closed(String),
}

/// Forwards stream fragments into the channel.
#[derive(Debug)]
struct ChannelSink(Sender<Event>);

impl StreamSink for ChannelSink {
    fn on_fragment(&mut self, payload: &[u8]) {
        let _ = self.0.send(Event::Fragment(Bytes::copy_from_slice(payload)));
    }

    fn on_close(&mut self, payload: &[u8]) {
        let _ = self.0.send(Event::StreamEnded(Bytes::copy_from_slice(payload)));
    }
}

// A dropped receiver means nobody listens anymore; events are discarded.
impl Handler for Sender<Event> {
    fn on_connect(&mut self) {
        let _ = self.send(Event::Connected);
    }

    fn on_message(&mut self, text: &str) {
        let _ = self.send(Event::Message(Message::text(text)));
    }

    fn on_binary(&mut self, data: &[u8]) {
        let _ = self.send(Event::Message(Message::Binary(Bytes::copy_from_slice(data))));
    }

    fn on_receive_stream(&mut self, stream: &mut InputStream) {
        let _ = self.send(Event::StreamStarted { binary: stream.is_binary() });
        stream.set_sink(ChannelSink(self.clone()));
    }

    fn on_pong(&mut self) {
        let _ = self.send(Event::Pong);
    }

    fn on_error(&mut self, message: &str, error: &Error) {
        let _ = self.send(Event::Error(format!("{message}: {error}")));
    }

    fn on_close(&mut self, reason: &str) {
        let _ = self.send(Event::Closed(reason.to_owned()));
    }
}
