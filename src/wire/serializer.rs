//! Minimal big-endian binary (de)serialization used by every wire packet.
//!
//! This mirrors the `Reader`/`Writer`/`Serializer` split used throughout this
//! codebase's own wire types (see `p2p::packet`), but is self-contained here
//! since the core has no dependency on any blockchain-specific serializer.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Error produced while decoding a wire value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("not enough bytes: needed {needed}, had {available}")]
    NotEnoughBytes { needed: usize, available: usize },
    #[error("invalid value")]
    InvalidValue,
    #[error("trailing bytes after decode")]
    TrailingBytes,
}

/// Cursor over a received packet payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if self.remaining() < n {
            return Err(ReaderError::NotEnoughBytes {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        self.take(n)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn finish(self) -> Result<(), ReaderError> {
        if self.remaining() != 0 {
            return Err(ReaderError::TrailingBytes);
        }
        Ok(())
    }
}

/// Append-only output buffer for an outgoing packet payload.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

/// Implemented by every wire type: fixed-endian encode/decode plus a
/// cheap-to-compute encoded length used to size the packet header.
pub trait Serializer: Sized {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn encoded_len(&self) -> usize;

    fn to_bytes(&self) -> BytesMut {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(buf);
        let value = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

