//! Fragmented messages in both directions.
//!
//! A fragmented message is never assembled in memory: received fragments are passed to a
//! [`StreamSink`] one by one, and sent fragments are framed as soon as they are written.

use std::fmt;

use log::*;

use crate::error::{Error, Result};

/// Receiver of the fragments of one incoming message.
pub trait StreamSink {
    /// A non-final fragment arrived, the first one included.
    fn on_fragment(&mut self, payload: &[u8]);
    /// The final fragment arrived; the stream is finished.
    fn on_close(&mut self, payload: &[u8]);
}

impl<F> StreamSink for F
where
    F: FnMut(&[u8], bool),
{
    fn on_fragment(&mut self, payload: &[u8]) {
        self(payload, false)
    }

    fn on_close(&mut self, payload: &[u8]) {
        self(payload, true)
    }
}

/// Incremental UTF-8 check over fragment boundaries.
#[derive(Debug, Default)]
struct Utf8Validator {
    incomplete: Option<utf8::Incomplete>,
}

impl Utf8Validator {
    fn extend(&mut self, tail: &[u8]) -> Result<()> {
        let mut input = tail;
        if let Some(mut incomplete) = self.incomplete.take() {
            match incomplete.try_complete(input) {
                Some((Ok(_), rest)) => input = rest,
                Some((Err(_), _)) => return Err(Error::Utf8),
                None => {
                    self.incomplete = Some(incomplete);
                    return Ok(());
                }
            }
        }
        match utf8::decode(input) {
            Ok(_) => Ok(()),
            Err(utf8::DecodeError::Incomplete { incomplete_suffix, .. }) => {
                self.incomplete = Some(incomplete_suffix);
                Ok(())
            }
            Err(utf8::DecodeError::Invalid { .. }) => Err(Error::Utf8),
        }
    }

    fn finish(&self) -> Result<()> {
        match self.incomplete {
            Some(_) => Err(Error::Utf8),
            None => Ok(()),
        }
    }
}

/// An incoming fragmented message.
///
/// Handed to [`Handler::on_receive_stream`](crate::protocol::Handler::on_receive_stream)
/// when the first fragment arrives. Attach a sink there to receive the payloads; without
/// one the fragments are dropped.
pub struct InputStream {
    binary: bool,
    fragments: usize,
    sink: Option<Box<dyn StreamSink>>,
    /// Text streams only; `None` once invalid data was reported.
    utf8: Option<Utf8Validator>,
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("binary", &self.binary)
            .field("fragments", &self.fragments)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl InputStream {
    pub(crate) fn new(binary: bool) -> Self {
        InputStream {
            binary,
            fragments: 0,
            sink: None,
            utf8: if binary { None } else { Some(Utf8Validator::default()) },
        }
    }

    /// Whether the message is binary rather than text.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Number of fragments received so far.
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Route the fragments of this message to `sink`.
    pub fn set_sink(&mut self, sink: impl StreamSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Deliver a non-final fragment.
    ///
    /// Fails with [`Error::Utf8`] the first time a text stream turns out to be invalid;
    /// the fragment is delivered regardless.
    pub(crate) fn push(&mut self, payload: &[u8]) -> Result<()> {
        self.fragments += 1;
        trace!("Stream fragment #{} of {} bytes", self.fragments, payload.len());
        if let Some(sink) = self.sink.as_mut() {
            sink.on_fragment(payload);
        }
        self.validate(payload, false)
    }

    /// Deliver the final fragment and finish the stream.
    pub(crate) fn finish(mut self, payload: &[u8]) -> Result<()> {
        self.fragments += 1;
        debug!("Stream finished after {} fragments", self.fragments);
        if let Some(sink) = self.sink.as_mut() {
            sink.on_close(payload);
        }
        self.validate(payload, true)
    }

    fn validate(&mut self, payload: &[u8], last: bool) -> Result<()> {
        let Some(validator) = self.utf8.as_mut() else {
            return Ok(());
        };
        let checked = validator.extend(payload).and_then(|()| {
            if last {
                validator.finish()
            } else {
                Ok(())
            }
        });
        if checked.is_err() {
            self.utf8 = None;
        }
        checked
    }
}

/// An outgoing fragmented message.
///
/// Created by [`WebSocket::open_write_stream`](crate::WebSocket::open_write_stream) and
/// driven through [`WebSocket::write_fragment`](crate::WebSocket::write_fragment) and
/// [`WebSocket::close_stream`](crate::WebSocket::close_stream).
#[allow(missing_copy_implementations)]
#[derive(Debug)]
pub struct OutputStream {
    binary: bool,
    first: bool,
    closed: bool,
}

impl OutputStream {
    pub(crate) fn new(binary: bool) -> Self {
        OutputStream { binary, first: true, closed: false }
    }

    /// Whether the message is binary rather than text.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Whether no fragment has been written yet.
    pub fn is_first_fragment(&self) -> bool {
        self.first
    }

    /// Whether the final frame has been sent.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the next frame opens the message, or `AlreadyClosed`.
    ///
    /// Nothing changes until the frame is queued and [`commit`](Self::commit) is called.
    pub(crate) fn next_frame(&self) -> Result<bool> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.first)
    }

    /// Record a queued frame; `last` when it carried FIN.
    pub(crate) fn commit(&mut self, last: bool) {
        self.first = false;
        self.closed = last;
    }
}
