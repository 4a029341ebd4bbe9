// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! XDR (RFC 4506) primitive codec.
//!
//! ONC-RPC and all VXI-11 structures are XDR-encoded: 4-byte big-endian
//! integers, length-prefixed opaque data padded to 4-byte boundaries, and
//! booleans as 0/1 integers. The decoder never panics on truncated input;
//! every read is bounds-checked.

use thiserror::Error;

/// Faults while decoding XDR data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    /// Input ended before the value was complete.
    #[error("Unexpected end of XDR data: needed {needed} byte(s), {available} available")]
    UnexpectedEof {
        /// Bytes the value required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A boolean field held something other than 0 or 1.
    #[error("Invalid XDR boolean value: {0}")]
    InvalidBool(u32),

    /// A string field held invalid UTF-8.
    #[error("Invalid UTF-8 in XDR string")]
    InvalidUtf8,

    /// A length prefix exceeded the sanity bound.
    #[error("XDR opaque length {length} exceeds limit {limit}")]
    LengthOutOfBounds {
        /// Declared length.
        length: usize,
        /// Enforced bound.
        limit: usize,
    },
}

/// Upper bound on opaque/string lengths; anything larger is a framing bug.
const MAX_OPAQUE_LEN: usize = 16 * 1024 * 1024;

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

// =============================================================================
// Encoder
// =============================================================================

/// Serializes XDR primitives into a growable buffer.
#[derive(Debug, Default)]
pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an unsigned 32-bit integer.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a signed 32-bit integer.
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a boolean as a 0/1 integer.
    pub fn put_bool(&mut self, value: bool) {
        self.put_u32(u32::from(value));
    }

    /// Appends variable-length opaque data with its length prefix and pad.
    pub fn put_opaque(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat(0u8).take(padding(data.len())));
    }

    /// Appends a string (identical wire form to opaque).
    pub fn put_string(&mut self, value: &str) {
        self.put_opaque(value.as_bytes());
    }

    /// Bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` when nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Reads XDR primitives from a byte slice.
#[derive(Debug)]
pub struct XdrDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    /// Wraps a byte slice for decoding.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], XdrError> {
        if self.remaining() < count {
            return Err(XdrError::UnexpectedEof {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Reads an unsigned 32-bit integer.
    pub fn get_u32(&mut self) -> Result<u32, XdrError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a signed 32-bit integer.
    pub fn get_i32(&mut self) -> Result<i32, XdrError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a boolean, rejecting values other than 0 and 1.
    pub fn get_bool(&mut self) -> Result<bool, XdrError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::InvalidBool(other)),
        }
    }

    /// Reads variable-length opaque data, consuming its pad bytes.
    pub fn get_opaque(&mut self) -> Result<Vec<u8>, XdrError> {
        let length = self.get_u32()? as usize;
        if length > MAX_OPAQUE_LEN {
            return Err(XdrError::LengthOutOfBounds {
                length,
                limit: MAX_OPAQUE_LEN,
            });
        }
        let data = self.take(length)?.to_vec();
        self.take(padding(length))?;
        Ok(data)
    }

    /// Reads a string, validating UTF-8.
    pub fn get_string(&mut self) -> Result<String, XdrError> {
        let bytes = self.get_opaque()?;
        String::from_utf8(bytes).map_err(|_| XdrError::InvalidUtf8)
    }

    /// Skips a fixed number of raw bytes.
    pub fn skip(&mut self, count: usize) -> Result<(), XdrError> {
        self.take(count).map(|_| ())
    }
}

// =============================================================================
// Tests
// =============================================================================
