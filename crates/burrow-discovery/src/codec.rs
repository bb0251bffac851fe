//! Compact binary encoding shared by every wire message.
//!
//! Unsigned integers use a prefix scheme: values below `0xfd` take one byte,
//! larger values are tagged `0xfd` (u16), `0xfe` (u32) or `0xff` (u64) and
//! follow in little endian. Buffers are length-prefixed. IPv4 addresses take
//! six bytes: four octets then a big-endian port.

use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Decoding failures. Callers drop the message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended early
    #[error("unexpected end of buffer")]
    Truncated,

    /// A field held an impossible value
    #[error("invalid {0}")]
    Invalid(&'static str),
}

/// Result of a decode step.
pub type CodecResult<T> = Result<T, CodecError>;

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Empty encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one byte
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Write a fixed little-endian u32
    pub fn u32_le(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a compact unsigned integer
    pub fn uint(&mut self, value: u64) -> &mut Self {
        if value < 0xfd {
            self.buf.push(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buf.push(0xfd);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= u64::from(u32::MAX) {
            self.buf.push(0xfe);
            self.buf.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.buf.push(0xff);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// Write raw bytes with no prefix
    pub fn fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a length-prefixed buffer
    pub fn buffer(&mut self, bytes: &[u8]) -> &mut Self {
        self.uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a six-byte IPv4 address
    pub fn address(&mut self, addr: SocketAddrV4) -> &mut Self {
        self.buf.extend_from_slice(&addr.ip().octets());
        self.buf.extend_from_slice(&addr.port().to_be_bytes());
        self
    }

    /// Write a counted list of addresses
    pub fn addresses(&mut self, addrs: &[SocketAddrV4]) -> &mut Self {
        self.uint(addrs.len() as u64);
        for addr in addrs {
            self.address(*addr);
        }
        self
    }

    /// Take the encoded bytes
    #[must_use]
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Cursor over an encoded message.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Read one byte
    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a fixed little-endian u32
    pub fn u32_le(&mut self) -> CodecResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| CodecError::Truncated)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a compact unsigned integer
    pub fn uint(&mut self) -> CodecResult<u64> {
        match self.u8()? {
            0xfd => {
                let bytes: [u8; 2] = self.take(2)?.try_into().map_err(|_| CodecError::Truncated)?;
                Ok(u64::from(u16::from_le_bytes(bytes)))
            }
            0xfe => {
                let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| CodecError::Truncated)?;
                Ok(u64::from(u32::from_le_bytes(bytes)))
            }
            0xff => {
                let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| CodecError::Truncated)?;
                Ok(u64::from_le_bytes(bytes))
            }
            small => Ok(u64::from(small)),
        }
    }

    /// Read `N` raw bytes
    pub fn fixed<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        self.take(N)?.try_into().map_err(|_| CodecError::Truncated)
    }

    /// Read a length-prefixed buffer
    pub fn buffer(&mut self) -> CodecResult<&'a [u8]> {
        let len = usize::try_from(self.uint()?).map_err(|_| CodecError::Invalid("length"))?;
        self.take(len)
    }

    /// Read a six-byte IPv4 address
    pub fn address(&mut self) -> CodecResult<SocketAddrV4> {
        let octets: [u8; 4] = self.fixed()?;
        let port: [u8; 2] = self.fixed()?;
        Ok(SocketAddrV4::new(
            Ipv4Addr::from(octets),
            u16::from_be_bytes(port),
        ))
    }

    /// Read a counted list of addresses
    pub fn addresses(&mut self, max: usize) -> CodecResult<Vec<SocketAddrV4>> {
        let count = usize::try_from(self.uint()?).map_err(|_| CodecError::Invalid("count"))?;
        if count > max {
            return Err(CodecError::Invalid("address count"));
        }
        (0..count).map(|_| self.address()).collect()
    }

    /// Bytes not consumed yet
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
