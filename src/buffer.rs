//! Wire codec (C1): primitive big-endian readers/writers over a byte cursor.
//!
//! Every primitive read is a plain slice index plus a `from_be_bytes` — no
//! allocation, no copy, until a value is actually retained (e.g. a relation
//! name copied into the relation cache). Short reads fail `Truncated`;
//! out-of-range tag/kind bytes are the caller's concern and fail `Malformed`.

use crate::errors::{ReplicationError, ReplicationResult};
use crate::utils::{buf_recv_i16, buf_recv_i32, buf_recv_i64, buf_recv_u32, buf_recv_u64};

/// Length-prefixed strings longer than this are rejected rather than
/// allocated, as a guard against a corrupt or hostile length field.
const MAX_STRING_LENGTH: usize = 1024 * 1024;

/// A buffer reader that manages position and provides meaningful parsing methods.
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        if !self.has_bytes(1) {
            return Err(ReplicationError::truncated("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> ReplicationResult<i16> {
        if !self.has_bytes(2) {
            return Err(ReplicationError::truncated("not enough bytes for i16"));
        }
        let value = buf_recv_i16(&self.buffer[self.position..]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> ReplicationResult<u16> {
        if !self.has_bytes(2) {
            return Err(ReplicationError::truncated("not enough bytes for u16"));
        }
        let value = u16::from_be_bytes(self.buffer[self.position..self.position + 2].try_into().unwrap());
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> ReplicationResult<u32> {
        if !self.has_bytes(4) {
            return Err(ReplicationError::truncated("not enough bytes for u32"));
        }
        let value = buf_recv_u32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> ReplicationResult<i32> {
        if !self.has_bytes(4) {
            return Err(ReplicationError::truncated("not enough bytes for i32"));
        }
        let value = buf_recv_i32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        if !self.has_bytes(8) {
            return Err(ReplicationError::truncated("not enough bytes for u64"));
        }
        let value = buf_recv_u64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        if !self.has_bytes(8) {
            return Err(ReplicationError::truncated("not enough bytes for i64"));
        }
        let value = buf_recv_i64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    /// A 64-bit LSN is wire-identical to a u64; named separately so call
    /// sites read as protocol fields rather than arithmetic.
    pub fn read_lsn(&mut self) -> ReplicationResult<u64> {
        self.read_u64()
    }

    pub fn read_null_terminated_string(&mut self) -> ReplicationResult<String> {
        let start_pos = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(ReplicationError::truncated("string not null-terminated"));
        }
        let string_bytes = &self.buffer[start_pos..self.position];
        let string_value = String::from_utf8_lossy(string_bytes).into_owned();
        self.position += 1;
        Ok(string_value)
    }

    /// Read a length-prefixed string (32-bit length followed by UTF-8 data).
    pub fn read_length_prefixed_string(&mut self) -> ReplicationResult<String> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(ReplicationError::malformed("negative string length"));
        }
        let length = length as usize;
        if length > MAX_STRING_LENGTH {
            return Err(ReplicationError::malformed(
                "string length exceeds maximum allowed size",
            ));
        }
        if !self.has_bytes(length) {
            return Err(ReplicationError::truncated("string data truncated"));
        }
        let string_bytes = &self.buffer[self.position..self.position + length];
        let string_value = String::from_utf8_lossy(string_bytes).into_owned();
        self.position += length;
        Ok(string_value)
    }

    /// Read a length-prefixed binary payload (32-bit length followed by raw bytes),
    /// used for the `b` (binary-format) tuple column kind.
    pub fn read_length_prefixed_bytes(&mut self) -> ReplicationResult<Vec<u8>> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(ReplicationError::malformed("negative binary value length"));
        }
        let length = length as usize;
        if length > MAX_STRING_LENGTH {
            return Err(ReplicationError::malformed(
                "binary value length exceeds maximum allowed size",
            ));
        }
        self.read_bytes(length)
    }

    pub fn peek_u8(&self) -> ReplicationResult<u8> {
        if !self.has_bytes(1) {
            return Err(ReplicationError::truncated("no bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }

    pub fn set_position(&mut self, position: usize) -> ReplicationResult<()> {
        if position > self.buffer.len() {
            return Err(ReplicationError::truncated("position out of bounds"));
        }
        self.position = position;
        Ok(())
    }

    pub(crate) fn read_char(&mut self) -> ReplicationResult<char> {
        Ok(self.read_u8()? as char)
    }

    pub(crate) fn read_bytes(&mut self, count: usize) -> ReplicationResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(ReplicationError::truncated("not enough bytes"));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes.to_vec())
    }
}

/// A buffer writer that manages position and provides meaningful writing
/// methods for constructing feedback frames with automatic position tracking.
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn write_u8(&mut self, value: u8) -> ReplicationResult<()> {
        if !self.has_space(1) {
            return Err(ReplicationError::malformed("not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> ReplicationResult<()> {
        if !self.has_space(8) {
            return Err(ReplicationError::malformed("not enough space for u64"));
        }
        crate::utils::buf_send_u64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> ReplicationResult<()> {
        if !self.has_space(8) {
            return Err(ReplicationError::malformed("not enough space for i64"));
        }
        crate::utils::buf_send_i64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    pub(crate) fn write_char(&mut self, message_type: char) -> ReplicationResult<()> {
        self.write_u8(message_type as u8)
    }

    pub(crate) fn write_u32(&mut self, value: u32) -> ReplicationResult<()> {
        if !self.has_space(4) {
            return Err(ReplicationError::malformed("not enough space for u32"));
        }
        crate::utils::buf_send_u32(value, &mut self.buffer[self.position..]);
        self.position += 4;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_primitives() {
        let data = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0x00010203);
        assert_eq!(reader.read_u32().unwrap(), 0x04050607);
    }

    #[test]
    fn truncated_read_fails_truncated_not_malformed() {
        let data = [0x00u8, 0x01];
        let mut reader = BufferReader::new(&data);
        match reader.read_u32() {
            Err(ReplicationError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn length_prefixed_string_roundtrips() {
        let mut buf = vec![0u8; 4 + 5];
        {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u32(5).unwrap();
        }
        buf[4..9].copy_from_slice(b"hello");
        let mut reader = BufferReader::new(&buf);
        assert_eq!(reader.read_length_prefixed_string().unwrap(), "hello");
    }

    #[test]
    fn negative_length_is_malformed() {
        let mut buf = [0u8; 4];
        buf_recv_write_negative(&mut buf);
        let mut reader = BufferReader::new(&buf);
        match reader.read_length_prefixed_string() {
            Err(ReplicationError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    fn buf_recv_write_negative(buf: &mut [u8; 4]) {
        buf.copy_from_slice(&(-1i32).to_be_bytes());
    }
}
