//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;

use bytes::Bytes;
use log::*;

pub use self::{
    frame::{Frame, FrameHeader, MAX_CONTROL_PAYLOAD_LEN, MAX_PAYLOAD_LEN},
    mask::{apply_mask, generate_mask, MaskKey, FIXED_MASK},
};
pub(crate) use self::frame::data_opcode;

use self::coding::{CloseCode, Control, Data, OpCode};
use crate::{
    buffer::RingBuffer,
    error::{CapacityError, Error, ProtocolError, Result},
    protocol::Message,
};

/// The bare close frame sent when closing or answering a peer's close.
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// What a single decoded frame means to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete, unfragmented message.
    Message(Message),
    /// A complete text message whose payload is not valid UTF-8.
    InvalidUtf8,
    /// The first frame of a fragmented message.
    StreamStart {
        /// Whether the message is binary rather than text.
        binary: bool,
        /// Payload of the first fragment.
        payload: Bytes,
    },
    /// A middle fragment of the message announced by `StreamStart`.
    StreamFragment(Bytes),
    /// The final fragment of the message announced by `StreamStart`.
    StreamEnd(Bytes),
    /// The peer pinged us; a pong has already been queued.
    Ping,
    /// The peer answered a ping.
    Pong,
    /// The peer closed the connection; the close frame has already been echoed.
    Close(Option<CloseCode>),
}

impl FrameEvent {
    /// The reason reported to the host for a `Close` event.
    pub fn close_reason(code: Option<CloseCode>) -> &'static str {
        code.map_or(CloseCode::Other(0).reason(), CloseCode::reason)
    }
}

/// A successfully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Number of bytes the frame occupied in the read buffer.
    pub consumed: usize,
    /// What the frame means.
    pub event: FrameEvent,
}

/// Incremental decoder and encoder for client-side frames.
///
/// The codec keeps only the state that has to survive between frames of one fragmented
/// message; every byte it looks at stays in the [`RingBuffer`] until a whole frame is
/// present.
#[allow(missing_copy_implementations)]
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Receive: the kind of the fragmented message in progress, `Some(true)` for binary.
    incoming: Option<bool>,
    /// Send: how outgoing frames are masked.
    mask: MaskKey,
}

impl FrameCodec {
    /// Create a codec masking outgoing frames according to `mask`.
    pub fn new(mask: MaskKey) -> Self {
        FrameCodec { incoming: None, mask }
    }

    /// Whether a fragmented message is being received.
    pub fn is_receiving_stream(&self) -> bool {
        self.incoming.is_some()
    }

    /// Decode one frame from the unread bytes of `input`.
    ///
    /// Returns `Ok(None)` when the frame is not complete yet; nothing is consumed then and
    /// the call should be repeated once more bytes arrived. Replies the protocol demands
    /// (pong, close echo) are appended to `output`.
    pub fn decode(
        &mut self,
        input: &mut RingBuffer,
        output: &mut Vec<u8>,
    ) -> Result<Option<Decoded>> {
        let Some((header, header_size, payload_len)) = FrameHeader::parse(input)? else {
            return Ok(None);
        };
        let frame_len = header_size + payload_len;

        // A frame that does not fit the buffer would wait for more data forever.
        if frame_len > input.capacity() {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: frame_len,
                max_size: input.capacity(),
            }));
        }
        self.check(&header, payload_len)?;

        if frame_len > input.available_to_read() {
            trace!("Need {} bytes, have {}", frame_len, input.available_to_read());
            return Ok(None);
        }

        input.consume(header_size);
        let payload = input.get_data(payload_len);
        let is_final = header.is_final;

        let event = match header.opcode {
            OpCode::Control(Control::Ping) => {
                self.encode(Frame::pong(payload), output)?;
                FrameEvent::Ping
            }
            OpCode::Control(Control::Pong) => FrameEvent::Pong,
            OpCode::Control(Control::Close) => {
                let code = match payload[..] {
                    [hi, lo, ..] => Some(CloseCode::from(u16::from_be_bytes([hi, lo]))),
                    _ => None,
                };
                debug!("Received close frame with code {:?}", code);
                output.extend_from_slice(&CLOSE_FRAME);
                FrameEvent::Close(code)
            }
            OpCode::Data(Data::Continue) if is_final => {
                self.incoming = None;
                FrameEvent::StreamEnd(payload.into())
            }
            OpCode::Data(Data::Continue) => FrameEvent::StreamFragment(payload.into()),
            OpCode::Data(data) if !is_final => {
                let binary = data == Data::Binary;
                self.incoming = Some(binary);
                FrameEvent::StreamStart { binary, payload: payload.into() }
            }
            OpCode::Data(Data::Binary) => FrameEvent::Message(Message::Binary(payload.into())),
            OpCode::Data(_) => match String::from_utf8(payload) {
                Ok(text) => FrameEvent::Message(Message::Text(text)),
                Err(_) => FrameEvent::InvalidUtf8,
            },
            OpCode::Control(Control::Reserved(i)) => {
                return Err(Error::Protocol(ProtocolError::InvalidOpcode(i)))
            }
        };

        Ok(Some(Decoded { consumed: frame_len, event }))
    }

    /// Reject frames a client must never accept, before anything is consumed.
    fn check(&self, header: &FrameHeader, payload_len: usize) -> Result<()> {
        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values. (RFC 6455)
        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }
        // A client MUST close a connection if it detects a masked frame. (RFC 6455)
        if header.mask.is_some() {
            return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
        }
        match header.opcode {
            OpCode::Control(_) if !header.is_final => {
                Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
            }
            OpCode::Control(_) if payload_len > MAX_CONTROL_PAYLOAD_LEN => {
                Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
            }
            OpCode::Control(Control::Close) if payload_len == 1 => {
                Err(Error::Protocol(ProtocolError::InvalidCloseSequence))
            }
            OpCode::Data(Data::Continue) if self.incoming.is_none() => {
                Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame))
            }
            OpCode::Data(data @ (Data::Text | Data::Binary)) if self.incoming.is_some() => {
                Err(Error::Protocol(ProtocolError::ExpectedFragment(data)))
            }
            _ => Ok(()),
        }
    }

    /// Mask `frame` with the configured key and append it to `output`.
    pub fn encode(&self, mut frame: Frame, output: &mut Vec<u8>) -> Result<()> {
        frame.set_mask(self.mask.next_key());
        trace!("Encoding frame {}", frame);
        frame.format_into_buf(output)
    }

    /// Append a complete, unfragmented message to `output`.
    pub fn encode_message(&self, data: &[u8], binary: bool, output: &mut Vec<u8>) -> Result<()> {
        self.encode(Frame::message(Bytes::copy_from_slice(data), data_opcode(binary), true), output)
    }

    /// Append a ping with an empty payload to `output`.
    pub fn encode_ping(&self, output: &mut Vec<u8>) -> Result<()> {
        self.encode(Frame::ping(Bytes::new()), output)
    }
}
