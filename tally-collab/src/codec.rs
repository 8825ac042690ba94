//! Tagged binary framing for everything that travels through a room.
//!
//! Wire format (lib0 encoding):
//! ```text
//! ┌────────────────┬──────────────────────────────┐
//! │ kind           │ payload                      │
//! │ varUint        │ varUint length • bytes       │
//! └────────────────┴──────────────────────────────┘
//!
//! kind:
//!   0 = Sync      (handshake step or document update)
//!   1 = Presence  (presence delta)
//! ```
//!
//! The codec holds no state. Decoding hands back a [`MessageReader`] over the
//! payload so the caller pulls typed sub-fields in the order they were written
//! with a [`MessageWriter`].

use yrs::encoding::write::Write;

use crate::error::{Result, SessionError};

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Sync = 0,
    Presence = 1,
}

impl MessageKind {
    fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(MessageKind::Sync),
            1 => Ok(MessageKind::Presence),
            other => Err(SessionError::MalformedMessage(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// Frame a payload under the given kind.
pub fn encode(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 6);
    buf.write_var(kind as u32);
    buf.write_buf(payload);
    buf
}

/// Split a frame into its kind and a reader over the payload.
pub fn decode(bytes: &[u8]) -> Result<(MessageKind, MessageReader<'_>)> {
    let mut frame = MessageReader::new(bytes);
    let kind = MessageKind::from_tag(frame.read_var_u64()?)?;
    let payload = frame.read_slice()?;
    frame.finish()?;
    Ok((kind, MessageReader::new(payload)))
}

fn malformed(what: impl std::fmt::Display) -> SessionError {
    SessionError::MalformedMessage(what.to_string())
}

/// Sequential reader over a payload, decoding the lib0 layout written by
/// [`MessageWriter`].
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of buffer"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte & 0x7F > 1) {
                return Err(malformed("varint overflows 64 bits"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte < 0x80 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| malformed(format!("varint {value} exceeds u32")))
    }

    fn read_slice(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.read_var_u64()?)
            .map_err(|_| malformed("length prefix exceeds usize"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                malformed(format!(
                    "length prefix {len} exceeds remaining {} bytes",
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.read_slice().map(<[u8]>::to_vec)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_slice()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| malformed(format!("invalid utf-8: {e}")))
    }

    /// Unread bytes, without consuming them.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Consume the reader, rejecting unread bytes.
    pub fn finish(self) -> Result<()> {
        if self.has_remaining() {
            return Err(malformed(format!(
                "{} unread bytes at end of payload",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Builder for payload sub-fields, mirror of [`MessageReader`].
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_var_u64(&mut self, value: u64) -> &mut Self {
        self.buf.write_var(value);
        self
    }

    pub fn write_var_u32(&mut self, value: u32) -> &mut Self {
        self.buf.write_var(value);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.write_buf(bytes);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.buf.write_string(value);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
