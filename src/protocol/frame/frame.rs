use std::fmt;

use bytes::Bytes;
use log::*;

use super::{
    coding::{Control, Data, OpCode},
    mask::apply_mask,
};
use crate::{
    buffer::RingBuffer,
    error::{CapacityError, Error, ProtocolError, Result},
};

/// Largest payload expressible without the 64-bit length form.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD_LEN: usize = 125;

/// A struct representing a WebSocket frame header.
#[allow(missing_copy_implementations)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions.
    pub rsv1: bool,
    /// Reserved for protocol extensions.
    pub rsv2: bool,
    /// Reserved for protocol extensions.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Control(Control::Close),
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Parse a header from the unread bytes of `input` without consuming anything.
    ///
    /// Returns the header, the header size in bytes and the payload length, or `None`
    /// if the header itself is not complete yet.
    pub fn parse(input: &RingBuffer) -> Result<Option<(Self, usize, usize)>> {
        let (Some(first), Some(second)) = (input.peek(0), input.peek(1)) else {
            return Ok(None);
        };

        let opcode = OpCode::from(first & 0x0F);
        if opcode.is_reserved() {
            return Err(Error::Protocol(ProtocolError::InvalidOpcode(first & 0x0F)));
        }

        let mut header_size = 2;
        let payload_len = match second & 0x7F {
            126 => {
                let (Some(hi), Some(lo)) = (input.peek(2), input.peek(3)) else {
                    return Ok(None);
                };
                header_size += 2;
                u16::from_be_bytes([hi, lo]) as usize
            }
            127 => return Err(Error::Protocol(ProtocolError::UnsupportedPayloadLength)),
            len => len as usize,
        };

        let mask = if second & 0x80 != 0 {
            let mut mask = [0u8; 4];
            for (i, byte) in mask.iter_mut().enumerate() {
                match input.peek(header_size + i) {
                    Some(b) => *byte = b,
                    None => return Ok(None),
                }
            }
            header_size += 4;
            Some(mask)
        } else {
            None
        };

        let header = FrameHeader {
            is_final: first & 0x80 != 0,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode,
            mask,
        };
        trace!("Parsed header {:?}, payload length {}", header, payload_len);
        Ok(Some((header, header_size, payload_len)))
    }

    /// Get the size of the header formatted with given payload length.
    pub fn len(&self, payload_len: usize) -> usize {
        let length_field = if payload_len > MAX_CONTROL_PAYLOAD_LEN { 2 } else { 0 };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        2 + length_field + mask
    }

    /// Format a header for given payload size.
    pub fn format(&self, payload_len: usize, output: &mut Vec<u8>) -> Result<()> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: payload_len,
                max_size: MAX_PAYLOAD_LEN,
            }));
        }

        let code: u8 = self.opcode.into();
        let one = code
            | if self.is_final { 0x80 } else { 0 }
            | if self.rsv1 { 0x40 } else { 0 }
            | if self.rsv2 { 0x20 } else { 0 }
            | if self.rsv3 { 0x10 } else { 0 };
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };

        if payload_len <= MAX_CONTROL_PAYLOAD_LEN {
            output.extend_from_slice(&[one, mask_bit | payload_len as u8]);
        } else {
            output.extend_from_slice(&[one, mask_bit | 126]);
            output.extend_from_slice(&(payload_len as u16).to_be_bytes());
        }

        if let Some(ref mask) = self.mask {
            output.extend_from_slice(mask);
        }

        Ok(())
    }
}

/// A struct representing an outgoing WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Get the length of the frame.
    /// This is the length of the header + the length of the payload.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len(self.payload.len()) + self.payload.len()
    }

    /// Check if the frame is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mask the frame with `key` when it is formatted.
    #[inline]
    pub fn set_mask(&mut self, key: [u8; 4]) -> &mut Self {
        self.header.mask = Some(key);
        self
    }

    /// Create a new data frame.
    #[inline]
    pub fn message(data: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(matches!(opcode, OpCode::Data(_)), "Invalid opcode for data frame.");
        Frame {
            header: FrameHeader { is_final, opcode, ..FrameHeader::default() },
            payload: data.into(),
        }
    }

    /// Create a new Pong control frame.
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader {
                opcode: OpCode::Control(Control::Pong),
                ..FrameHeader::default()
            },
            payload: data.into(),
        }
    }

    /// Create a new Ping control frame.
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader {
                opcode: OpCode::Control(Control::Ping),
                ..FrameHeader::default()
            },
            payload: data.into(),
        }
    }

    /// Write a frame out to a buffer, masking the payload if the header carries a mask.
    pub fn format_into_buf(self, output: &mut Vec<u8>) -> Result<()> {
        output.reserve(self.len());
        self.header.format(self.payload.len(), output)?;
        let start = output.len();
        output.extend_from_slice(&self.payload);
        if let Some(mask) = self.header.mask {
            apply_mask(&mut output[start..], mask);
        }
        Ok(())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use std::fmt::Write;

        write!(
            f,
            "
<FRAME>
final: {}
opcode: {}
length: {}
payload length: {}
payload: 0x{}
            ",
            self.header.is_final,
            self.header.opcode,
            self.len(),
            self.payload.len(),
            self.payload.iter().fold(String::new(), |mut output, byte| {
                _ = write!(output, "{byte:02x}");
                output
            })
        )
    }
}

/// Shorthand for the opcode of a text or binary message.
pub(crate) fn data_opcode(binary: bool) -> OpCode {
    OpCode::Data(if binary { Data::Binary } else { Data::Text })
}
