// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Backend adapter abstraction.
//!
//! Every backend transport implements [`InstrumentAdapter`], the uniform
//! contract the gateway engine drives. The lifecycle is strict:
//!
//! 1. `connect()` at link creation — metadata only, never touches hardware
//! 2. `acquire()` when the device lock is taken (or lazily on first I/O for
//!    non-locking adapters) — opens the physical resource
//! 3. `write()` / `read()` while open
//! 4. `release()` on unlock or link destruction — idempotent close
//! 5. `disconnect()` when the link goes away
//!
//! Adapters are shared behind `Arc` and use interior mutability; all methods
//! take `&self` so concurrent links on non-exclusive transports can proceed
//! independently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::types::{DeviceConfig, TransportKind};

// =============================================================================
// Read reason bits
// =============================================================================

/// VXI-11 `Device_ReadResp.reason` bits.
pub mod reason {
    /// The requested byte count was satisfied.
    pub const REQCNT: u32 = 0x01;
    /// The termination character was seen.
    pub const TERM_CHR: u32 = 0x02;
    /// The device signalled end of message.
    pub const END: u32 = 0x04;
}

/// One chunk of data produced by an adapter read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPayload {
    /// The bytes read.
    pub data: Vec<u8>,
    /// VXI-11 reason bits describing why the read completed.
    pub reason: u32,
}

impl ReadPayload {
    /// A payload that carries data and signals end of message.
    pub fn end(data: Vec<u8>) -> Self {
        Self {
            data,
            reason: reason::END,
        }
    }

    /// An empty payload with no reason bits.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` if no data was produced.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// InstrumentAdapter Trait
// =============================================================================

/// The uniform contract implemented by every backend adapter.
#[async_trait]
pub trait InstrumentAdapter: Send + Sync {
    /// The logical device name this adapter serves.
    fn name(&self) -> &str;

    /// The transport family.
    fn kind(&self) -> TransportKind;

    /// Whether VXI-11 locking gates hardware access for this adapter.
    fn requires_lock(&self) -> bool;

    /// Validates connectivity metadata. Must not touch hardware.
    async fn connect(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Tears down all state for this adapter instance.
    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.release().await;
        Ok(())
    }

    /// Opens the physical resource.
    ///
    /// May block on I/O; callers bound it with a deadline. On failure the
    /// adapter must remain closed.
    async fn acquire(&self) -> Result<(), AdapterError>;

    /// Closes the physical resource. Idempotent.
    async fn release(&self);

    /// Sends `data` to the device, returning the number of bytes accepted.
    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError>;

    /// Reads up to `max_len` bytes, waiting at most `timeout`.
    async fn read(&self, max_len: usize, timeout: Duration) -> Result<ReadPayload, AdapterError>;

    /// SCPI-style trigger, for adapters that support it.
    async fn trigger(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Device clear, for adapters that support it.
    async fn clear(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Status byte poll. Adapters without SRQ semantics answer zero.
    async fn read_stb(&self) -> Result<u8, AdapterError> {
        Ok(0)
    }
}

// =============================================================================
// AdapterFactory
// =============================================================================

/// Builds adapter instances from device definitions.
///
/// Construction must be side-effect free on the hardware: a factory may
/// validate parameters but must not open sockets, ports, or USB handles.
pub trait AdapterFactory: Send + Sync {
    /// Creates an adapter for the given device.
    fn build(&self, device: &Arc<DeviceConfig>) -> Result<Arc<dyn InstrumentAdapter>, AdapterError>;
}

// =============================================================================
// Tests
// =============================================================================
