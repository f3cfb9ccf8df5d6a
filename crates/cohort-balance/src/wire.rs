//! Wire-format primitives for decoding user data blobs.

use bytes::Buf;
use cohort_common::{Error, Result};

/// Decoder for reading big-endian protocol primitives from a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Create a new decoder
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Number of bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Read an i16
    pub fn read_i16(&mut self) -> Result<i16> {
        if self.buf.remaining() < 2 {
            return Err(Error::MalformedUserData("not enough bytes for i16".into()));
        }
        Ok(self.buf.get_i16())
    }

    /// Read an i32
    pub fn read_i32(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(Error::MalformedUserData("not enough bytes for i32".into()));
        }
        Ok(self.buf.get_i32())
    }

    /// Read a length-prefixed string (i16 length)
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_i16()?;
        if len < 0 {
            return Err(Error::MalformedUserData(format!(
                "negative string length {}",
                len
            )));
        }

        let len = len as usize;
        if self.buf.remaining() < len {
            return Err(Error::MalformedUserData(format!(
                "not enough bytes for string of length {}",
                len
            )));
        }

        let mut bytes = vec![0u8; len];
        self.buf.copy_to_slice(&mut bytes);

        String::from_utf8(bytes)
            .map_err(|e| Error::MalformedUserData(format!("invalid UTF-8 in string: {}", e)))
    }
}
