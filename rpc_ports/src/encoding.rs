//! Typed binary streams used to serialize calls and their payloads.
//!
//! Wraps a byte sink/source with typed writes and reads for the primitives
//! the call headers need (`u8`, `u64`, `bool`, durations) and delegates
//! everything user-typed (argument tuples, return values) to serde/bincode.
//! Both endpoints of a connection must use this module, which keeps the byte
//! order consistent (little-endian throughout).

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// Stream for serializing calls into a byte sink.
pub struct OutputStream<'a> {
    sink: &'a mut dyn Write,
}

impl<'a> OutputStream<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Self { sink }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Durations travel as whole nanoseconds in a `u64`.
    pub fn write_duration(&mut self, value: Duration) -> Result<()> {
        self.write_u64(value.as_nanos().min(u64::MAX as u128) as u64)
    }

    /// Serializes any serde value (tuples, strings, user types).
    pub fn write_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        bincode::serialize_into(&mut *self.sink, value).map_err(|e| {
            log::error!("value serialization failed: {e}");
            RpcError::Internal
        })
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes).map_err(|e| {
            log::error!("stream write failed: {e}");
            RpcError::Internal
        })
    }
}

/// Stream for deserializing calls from a received frame.
pub struct InputStream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> InputStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The raw sub-slice between two stream positions. Used to retain the
    /// still-encoded form of a value that was just validated.
    pub fn bytes_between(&self, start: usize, end: usize) -> &'a [u8] {
        &self.buf[start..end]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).map_err(|_| RpcError::InvalidData)?;
        Ok(byte[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes).map_err(|_| RpcError::InvalidData)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(RpcError::InvalidData),
        }
    }

    pub fn read_duration(&mut self) -> Result<Duration> {
        Ok(Duration::from_nanos(self.read_u64()?))
    }

    /// Deserializes any serde value, consuming exactly its encoding.
    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        bincode::deserialize_from(&mut *self).map_err(|e| {
            log::debug!("value deserialization failed: {e}");
            RpcError::InvalidData
        })
    }
}

impl Read for InputStream<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Encodes a single value to a fresh byte vector.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    OutputStream::new(&mut bytes).write_value(value)?;
    Ok(bytes)
}

/// Decodes a single value from a byte slice.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        log::debug!("value deserialization failed: {e}");
        RpcError::InvalidData
    })
}
