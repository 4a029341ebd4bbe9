// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Loopback adapter.
//!
//! Buffers the last write and returns it on read. Used for transport-level
//! tests and as the simplest reference implementation of the adapter
//! contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use vxgate_core::adapter::{InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::types::{DeviceConfig, TransportKind};

/// Echoes writes back on read.
pub struct LoopbackAdapter {
    device: Arc<DeviceConfig>,
    staged: Mutex<Vec<u8>>,
}

impl LoopbackAdapter {
    /// Builds the adapter.
    pub fn new(device: Arc<DeviceConfig>) -> Self {
        Self {
            device,
            staged: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl InstrumentAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn release(&self) {
        self.staged.lock().await.clear();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        *self.staged.lock().await = data.to_vec();
        Ok(data.len())
    }

    async fn read(&self, max_len: usize, _timeout: Duration) -> Result<ReadPayload, AdapterError> {
        let mut staged = self.staged.lock().await;
        if staged.is_empty() {
            return Ok(ReadPayload::empty());
        }
        let take = staged.len().min(max_len.max(1));
        let data: Vec<u8> = staged.drain(..take).collect();
        if staged.is_empty() {
            Ok(ReadPayload::end(data))
        } else {
            Ok(ReadPayload { data, reason: 0 })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
