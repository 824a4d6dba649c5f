//! Primitive field codecs: fixed-width integers, length-encoded integers and
//! strings, NUL-terminated strings.
//!
//! Every read is bounds-checked and reports a [`DecodeError`] instead of
//! reading past the end of the payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Byte-level decoding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated packet: needed {needed} bytes, {available} available")]
    TruncatedPacket { needed: usize, available: usize },

    #[error("malformed field: {0}")]
    MalformedField(&'static str),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Length-encoded NULL marker
pub const LENENC_NULL: u8 = 0xFB;

/// Cursor over a packet payload
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `offset`
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        if self.pos > self.data.len() || self.remaining() < len {
            return Err(DecodeError::TruncatedPacket {
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> DecodeResult<()> {
        self.take(len).map(|_| ())
    }

    pub fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> DecodeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> DecodeResult<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32(&mut self) -> DecodeResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> DecodeResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Length-encoded integer; `None` is the NULL marker (0xfb)
    pub fn lenenc_int_or_null(&mut self) -> DecodeResult<Option<u64>> {
        match self.u8()? {
            first @ 0x00..=0xFA => Ok(Some(first as u64)),
            LENENC_NULL => Ok(None),
            0xFC => self.u16().map(|v| Some(v as u64)),
            0xFD => self.u24().map(|v| Some(v as u64)),
            0xFE => self.u64().map(Some),
            _ => Err(DecodeError::MalformedField("length-encoded integer prefix 0xff")),
        }
    }

    /// Length-encoded integer where NULL is not allowed
    pub fn lenenc_int(&mut self) -> DecodeResult<u64> {
        self.lenenc_int_or_null()?
            .ok_or(DecodeError::MalformedField("unexpected NULL length-encoded integer"))
    }

    /// Length-encoded byte string
    pub fn lenenc_bytes(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.lenenc_int()?;
        let len = usize::try_from(len)
            .map_err(|_| DecodeError::MalformedField("length-encoded string too long"))?;
        self.take(len)
    }

    pub fn fixed_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        self.take(len)
    }

    /// NUL-terminated byte string (terminator consumed, not returned)
    pub fn nul_bytes(&mut self) -> DecodeResult<&'a [u8]> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::MalformedField("missing NUL terminator"))?;
        let bytes = &rest[..end];
        self.pos += end + 1;
        Ok(bytes)
    }

    pub fn nul_string(&mut self) -> DecodeResult<String> {
        self.nul_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Everything after the cursor
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

/// Decode a length-encoded integer at `offset`, returning the value (or
/// `None` for NULL) and the offset just past it
pub fn get_lenenc_int(buf: &[u8], offset: usize) -> DecodeResult<(Option<u64>, usize)> {
    let mut reader = PacketReader::at(buf, offset);
    let value = reader.lenenc_int_or_null()?;
    Ok((value, reader.offset()))
}

pub fn get_lenenc_string(buf: &[u8], offset: usize) -> DecodeResult<(Bytes, usize)> {
    let mut reader = PacketReader::at(buf, offset);
    let value = Bytes::copy_from_slice(reader.lenenc_bytes()?);
    Ok((value, reader.offset()))
}

pub fn get_fixed_string(buf: &[u8], offset: usize, len: usize) -> DecodeResult<(Bytes, usize)> {
    let mut reader = PacketReader::at(buf, offset);
    let value = Bytes::copy_from_slice(reader.fixed_bytes(len)?);
    Ok((value, reader.offset()))
}

pub fn get_nul_string(buf: &[u8], offset: usize) -> DecodeResult<(String, usize)> {
    let mut reader = PacketReader::at(buf, offset);
    let value = reader.nul_string()?;
    Ok((value, reader.offset()))
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16_777_216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

pub fn put_nul_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_slice(value);
    buf.put_u8(0);
}
