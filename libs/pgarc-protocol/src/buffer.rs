use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer operation would read or write past the allocated size")]
    OutOfRange,
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// A growable, byte-ordered binary buffer with an explicit cursor.
///
/// `allocate` resets the cursor and zero-fills, `clear` zero-fills in place
/// and resets the cursor, and every read/write advances `curr_pos` by the
/// width it consumed. Multi-byte integers are big-endian ("network byte
/// order").
#[derive(Debug, Default)]
pub struct ProtocolBuffer {
    buf: BytesMut,
    curr_pos: usize,
}

impl ProtocolBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(size: usize) -> Self {
        let mut pb = Self {
            buf: BytesMut::new(),
            curr_pos: 0,
        };
        pb.allocate(size);
        pb
    }

    /// Allocates a fresh zero-filled buffer of `size` bytes, discarding any
    /// previous contents, and resets the cursor to the first byte.
    pub fn allocate(&mut self, size: usize) {
        self.buf = BytesMut::zeroed(size);
        self.curr_pos = 0;
    }

    /// Zero-fills the existing buffer in place and resets the cursor.
    pub fn clear(&mut self) {
        for b in self.buf.iter_mut() {
            *b = 0;
        }
        self.curr_pos = 0;
    }

    pub fn first(&mut self) {
        self.curr_pos = 0;
    }

    pub fn last(&mut self) {
        self.curr_pos = self.buf.len();
    }

    pub fn pos(&self) -> usize {
        self.curr_pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.curr_pos
    }

    pub fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        if self.remaining() < data.len() {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.curr_pos += data.len();
        Ok(data.len())
    }

    pub fn write_byte(&mut self, value: u8) -> Result<usize> {
        if self.remaining() < 1 {
            return Err(BufferError::OutOfRange);
        }
        self.buf[self.curr_pos] = value;
        self.curr_pos += 1;
        Ok(1)
    }

    pub fn write_short(&mut self, value: i16) -> Result<usize> {
        if self.remaining() < 2 {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        (&mut self.buf[start..start + 2]).put_i16(value);
        self.curr_pos += 2;
        Ok(2)
    }

    pub fn write_int(&mut self, value: i32) -> Result<usize> {
        if self.remaining() < 4 {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        (&mut self.buf[start..start + 4]).put_i32(value);
        self.curr_pos += 4;
        Ok(4)
    }

    pub fn read_buffer(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.remaining() < out.len() {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        out.copy_from_slice(&self.buf[start..start + out.len()]);
        self.curr_pos += out.len();
        Ok(out.len())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(BufferError::OutOfRange);
        }
        let v = self.buf[self.curr_pos];
        self.curr_pos += 1;
        Ok(v)
    }

    pub fn read_short(&mut self) -> Result<i16> {
        if self.remaining() < 2 {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        let v = (&self.buf[start..start + 2]).get_i16();
        self.curr_pos += 2;
        Ok(v)
    }

    pub fn read_int(&mut self) -> Result<i32> {
        if self.remaining() < 4 {
            return Err(BufferError::OutOfRange);
        }
        let start = self.curr_pos;
        let v = (&self.buf[start..start + 4]).get_i32();
        self.curr_pos += 4;
        Ok(v)
    }

    pub fn read_uint(&mut self) -> Result<u32> {
        self.read_int().map(|v| v as u32)
    }

    pub fn ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_int_then_read_int_roundtrips_for_any_value() {
        for v in [0i32, 1, -1, i32::MIN, i32::MAX, 0x0102_0304u32 as i32] {
            let mut buf = ProtocolBuffer::with_capacity(4);
            buf.write_int(v).unwrap();
            buf.first();
            assert_eq!(buf.read_int().unwrap(), v);
        }
    }

    #[test]
    fn write_short_then_read_short_roundtrips() {
        let mut buf = ProtocolBuffer::with_capacity(2);
        buf.write_short(0x0506).unwrap();
        buf.first();
        assert_eq!(buf.read_short().unwrap(), 0x0506);
    }

    #[test]
    fn write_byte_then_read_byte_roundtrips() {
        let mut buf = ProtocolBuffer::with_capacity(1);
        buf.write_byte(0x7f).unwrap();
        buf.first();
        assert_eq!(buf.read_byte().unwrap(), 0x7f);
    }

    #[test]
    fn write_buffer_then_read_buffer_roundtrips_arbitrary_payload() {
        let payload = b"arbitrary payload bytes, any length";
        let mut buf = ProtocolBuffer::with_capacity(payload.len());
        buf.write_buffer(payload).unwrap();
        buf.first();
        let mut out = vec![0u8; payload.len()];
        buf.read_buffer(&mut out).unwrap();
        assert_eq!(&out, payload);
    }

    #[test]
    fn scenario_s4_protocol_buffer_round_trip() {
        let mut buf = ProtocolBuffer::with_capacity(6);
        buf.write_int(0x0102_0304).unwrap();
        buf.write_short(0x0506).unwrap();
        buf.first();
        let v = buf.read_int().unwrap();
        let w = buf.read_short().unwrap();
        assert_eq!(v, 0x0102_0304);
        assert_eq!(w, 0x0506);
    }

    #[test]
    fn write_past_allocated_size_is_out_of_range() {
        let mut buf = ProtocolBuffer::with_capacity(1);
        buf.write_byte(1).unwrap();
        assert_eq!(buf.write_byte(2), Err(BufferError::OutOfRange));
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let mut buf = ProtocolBuffer::with_capacity(1);
        buf.first();
        let _ = buf.read_byte().unwrap();
        assert_eq!(buf.read_byte(), Err(BufferError::OutOfRange));
    }

    #[test]
    fn allocate_resets_cursor_and_clear_zero_fills() {
        let mut buf = ProtocolBuffer::with_capacity(4);
        buf.write_int(42).unwrap();
        buf.allocate(4);
        assert_eq!(buf.pos(), 0);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);

        buf.write_int(7).unwrap();
        buf.clear();
        assert_eq!(buf.pos(), 0);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
    }
}
