// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! VXI-11 wire structures and protocol constants.
//!
//! Structures follow the VXI-11 specification's XDR definitions exactly and
//! must round-trip bit-identically against reference client libraries.

use crate::xdr::{XdrDecoder, XdrEncoder, XdrError};

// =============================================================================
// Program numbers and procedures
// =============================================================================

/// DEVICE_CORE program number.
pub const DEVICE_CORE_PROG: u32 = 0x0607AF;
/// DEVICE_CORE version served by this gateway.
pub const DEVICE_CORE_VERS: u32 = 1;
/// DEVICE_ASYNC program number (abort channel).
pub const DEVICE_ASYNC_PROG: u32 = 0x0607B0;
/// DEVICE_INTR program number (interrupt channel, not implemented).
pub const DEVICE_INTR_PROG: u32 = 0x0607B1;

/// DEVICE_CORE procedure numbers.
pub mod proc {
    /// create_link.
    pub const CREATE_LINK: u32 = 10;
    /// device_write.
    pub const DEVICE_WRITE: u32 = 11;
    /// device_read.
    pub const DEVICE_READ: u32 = 12;
    /// device_readstb.
    pub const DEVICE_READSTB: u32 = 13;
    /// device_trigger.
    pub const DEVICE_TRIGGER: u32 = 14;
    /// device_clear.
    pub const DEVICE_CLEAR: u32 = 15;
    /// device_remote.
    pub const DEVICE_REMOTE: u32 = 16;
    /// device_local.
    pub const DEVICE_LOCAL: u32 = 17;
    /// device_lock.
    pub const DEVICE_LOCK: u32 = 18;
    /// device_unlock.
    pub const DEVICE_UNLOCK: u32 = 19;
    /// destroy_link.
    pub const DESTROY_LINK: u32 = 23;
    /// device_abort (DEVICE_ASYNC program).
    pub const DEVICE_ABORT: u32 = 1;
}

/// Device_Flags bits.
pub mod flags {
    /// Block until the device lock frees.
    pub const WAIT_LOCK: u32 = 1 << 0;
    /// End of message accompanies this write.
    pub const END: u32 = 1 << 3;
    /// The term character in Device_ReadParms is meaningful.
    pub const TERM_CHR_SET: u32 = 1 << 7;
}

// =============================================================================
// Wire structures
// =============================================================================

/// Arguments of create_link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLinkParms {
    /// Opaque client identifier.
    pub client_id: i32,
    /// Lock the device as part of link creation.
    pub lock_device: bool,
    /// Lock wait bound in milliseconds (0 = wait indefinitely).
    pub lock_timeout_ms: u32,
    /// Logical device name.
    pub device: String,
}

impl CreateLinkParms {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_i32(self.client_id);
        enc.put_bool(self.lock_device);
        enc.put_u32(self.lock_timeout_ms);
        enc.put_string(&self.device);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            client_id: dec.get_i32()?,
            lock_device: dec.get_bool()?,
            lock_timeout_ms: dec.get_u32()?,
            device: dec.get_string()?,
        })
    }
}

/// Results of create_link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateLinkResp {
    /// VXI-11 error code.
    pub error: u32,
    /// The allocated link id.
    pub lid: u32,
    /// TCP port of the abort channel.
    pub abort_port: u16,
    /// Largest device_write the server accepts.
    pub max_recv_size: u32,
}

impl CreateLinkResp {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.error);
        enc.put_u32(self.lid);
        enc.put_u32(u32::from(self.abort_port));
        enc.put_u32(self.max_recv_size);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            error: dec.get_u32()?,
            lid: dec.get_u32()?,
            abort_port: dec.get_u32()? as u16,
            max_recv_size: dec.get_u32()?,
        })
    }
}

/// Arguments of device_write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWriteParms {
    /// Target link.
    pub lid: u32,
    /// I/O deadline in milliseconds.
    pub io_timeout_ms: u32,
    /// Lock wait bound in milliseconds.
    pub lock_timeout_ms: u32,
    /// Device_Flags.
    pub flags: u32,
    /// Command bytes.
    pub data: Vec<u8>,
}

impl DeviceWriteParms {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.lid);
        enc.put_u32(self.io_timeout_ms);
        enc.put_u32(self.lock_timeout_ms);
        enc.put_u32(self.flags);
        enc.put_opaque(&self.data);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            lid: dec.get_u32()?,
            io_timeout_ms: dec.get_u32()?,
            lock_timeout_ms: dec.get_u32()?,
            flags: dec.get_u32()?,
            data: dec.get_opaque()?,
        })
    }
}

/// Results of device_write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWriteResp {
    /// VXI-11 error code.
    pub error: u32,
    /// Bytes accepted.
    pub size: u32,
}

impl DeviceWriteResp {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.error);
        enc.put_u32(self.size);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            error: dec.get_u32()?,
            size: dec.get_u32()?,
        })
    }
}

/// Arguments of device_read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReadParms {
    /// Target link.
    pub lid: u32,
    /// Maximum bytes to return.
    pub request_size: u32,
    /// I/O deadline in milliseconds.
    pub io_timeout_ms: u32,
    /// Lock wait bound in milliseconds.
    pub lock_timeout_ms: u32,
    /// Device_Flags.
    pub flags: u32,
    /// Termination character (meaningful with TERM_CHR_SET).
    pub term_char: u8,
}

impl DeviceReadParms {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.lid);
        enc.put_u32(self.request_size);
        enc.put_u32(self.io_timeout_ms);
        enc.put_u32(self.lock_timeout_ms);
        enc.put_u32(self.flags);
        enc.put_u32(u32::from(self.term_char));
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            lid: dec.get_u32()?,
            request_size: dec.get_u32()?,
            io_timeout_ms: dec.get_u32()?,
            lock_timeout_ms: dec.get_u32()?,
            flags: dec.get_u32()?,
            term_char: dec.get_u32()? as u8,
        })
    }
}

/// Results of device_read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReadResp {
    /// VXI-11 error code.
    pub error: u32,
    /// Reason bits: END, TERM_CHR, REQCNT.
    pub reason: u32,
    /// Response bytes.
    pub data: Vec<u8>,
}

impl DeviceReadResp {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.error);
        enc.put_u32(self.reason);
        enc.put_opaque(&self.data);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            error: dec.get_u32()?,
            reason: dec.get_u32()?,
            data: dec.get_opaque()?,
        })
    }
}

/// Arguments shared by trigger/clear/remote/local/readstb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGenericParms {
    /// Target link.
    pub lid: u32,
    /// Device_Flags.
    pub flags: u32,
    /// Lock wait bound in milliseconds.
    pub lock_timeout_ms: u32,
    /// I/O deadline in milliseconds.
    pub io_timeout_ms: u32,
}

impl DeviceGenericParms {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.lid);
        enc.put_u32(self.flags);
        enc.put_u32(self.lock_timeout_ms);
        enc.put_u32(self.io_timeout_ms);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            lid: dec.get_u32()?,
            flags: dec.get_u32()?,
            lock_timeout_ms: dec.get_u32()?,
            io_timeout_ms: dec.get_u32()?,
        })
    }
}

/// Results of device_readstb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReadStbResp {
    /// VXI-11 error code.
    pub error: u32,
    /// Status byte.
    pub stb: u8,
}

impl DeviceReadStbResp {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.error);
        enc.put_u32(u32::from(self.stb));
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            error: dec.get_u32()?,
            stb: dec.get_u32()? as u8,
        })
    }
}

/// Arguments of device_lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLockParms {
    /// Target link.
    pub lid: u32,
    /// Device_Flags; WAIT_LOCK selects blocking acquisition.
    pub flags: u32,
    /// Lock wait bound in milliseconds.
    pub lock_timeout_ms: u32,
}

impl DeviceLockParms {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.lid);
        enc.put_u32(self.flags);
        enc.put_u32(self.lock_timeout_ms);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            lid: dec.get_u32()?,
            flags: dec.get_u32()?,
            lock_timeout_ms: dec.get_u32()?,
        })
    }
}

/// The bare Device_Error result used by most procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    /// VXI-11 error code.
    pub error: u32,
}

impl DeviceError {
    /// Encodes into XDR.
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.error);
    }

    /// Decodes from XDR.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            error: dec.get_u32()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
