//! Binary encoding primitives for the wire format
//!
//! Little-endian integers, CompactSize var-ints and length-prefixed byte
//! strings. Writing goes through `bytes::BufMut`; reading is bounds-checked
//! and never panics on truncated input.

use crate::crypto::Hash256;
use bytes::BufMut;
use thiserror::Error;

/// Upper bound for any single length prefix we are willing to honour
pub const MAX_VAR_LENGTH: u64 = 32 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Non-canonical var-int encoding")]
    NonCanonicalVarInt,
    #[error("Length prefix too large: {0}")]
    TooLarge(u64),
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes between two positions already consumed by this reader
    pub fn slice(&self, from: usize, to: usize) -> &'a [u8] {
        &self.data[from.min(self.data.len())..to.min(self.data.len())]
    }

    /// Fails unless every byte has been consumed
    pub fn finish(&self) -> Result<(), EncodingError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(EncodingError::TrailingBytes(n)),
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, EncodingError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, EncodingError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, EncodingError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, EncodingError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, EncodingError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, EncodingError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, EncodingError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, EncodingError> {
        Ok(Hash256(self.read_array()?))
    }

    /// CompactSize unsigned integer
    pub fn read_var_int(&mut self) -> Result<u64, EncodingError> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xfd => {
                let v = self.read_u16_le()? as u64;
                if v < 0xfd {
                    return Err(EncodingError::NonCanonicalVarInt);
                }
                v
            }
            0xfe => {
                let v = self.read_u32_le()? as u64;
                if v <= 0xffff {
                    return Err(EncodingError::NonCanonicalVarInt);
                }
                v
            }
            0xff => {
                let v = self.read_u64_le()?;
                if v <= 0xffff_ffff {
                    return Err(EncodingError::NonCanonicalVarInt);
                }
                v
            }
            n => n as u64,
        };
        Ok(value)
    }

    /// Var-int used as a count or length; rejects absurd values
    pub fn read_length(&mut self) -> Result<usize, EncodingError> {
        let len = self.read_var_int()?;
        if len > MAX_VAR_LENGTH {
            return Err(EncodingError::TooLarge(len));
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, EncodingError> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String, EncodingError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)
    }
}

/// Append a CompactSize var-int
pub fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Append a var-int length followed by the bytes
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Encoded size of a CompactSize var-int
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_int_boundaries() {
        for (value, size) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (0x1_0000_0000, 9)] {
            let mut buf = Vec::new();
            write_var_int(&mut buf, value);
            assert_eq!(buf.len(), size);
            assert_eq!(var_int_size(value), size);

            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.read_var_int().unwrap(), value);
            assert!(reader.finish().is_ok());
        }
    }

    #[test]
    fn test_non_canonical_var_int_rejected() {
        let mut reader = ByteReader::new(&[0xfd, 0x10, 0x00]);
        assert_eq!(reader.read_var_int(), Err(EncodingError::NonCanonicalVarInt));
    }

    #[test]
    fn test_truncated_input() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);
        assert!(matches!(
            reader.read_u32_le(),
            Err(EncodingError::UnexpectedEnd { needed: 4, remaining: 2 })
        ));
    }

    #[test]
    fn test_var_bytes_and_trailing() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"abc");
        buf.push(0xaa);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_var_bytes().unwrap(), b"abc".to_vec());
        assert_eq!(reader.finish(), Err(EncodingError::TrailingBytes(1)));
    }
}
