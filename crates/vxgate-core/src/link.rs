// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Link state tracking.
//!
//! A [`Link`] binds one VXI-11 client session to one logical device and its
//! adapter instance. The [`LinkRegistry`] issues 32-bit link identifiers
//! monotonically, wrapping with a collision check so that a destroyed id is
//! never handed out while still referenced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::adapter::{reason, InstrumentAdapter, ReadPayload};
use crate::error::LinkError;
use crate::types::DeviceConfig;

/// Default bound on buffered response bytes per link.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 64 * 1024;

/// Default bound on concurrently active links.
pub const DEFAULT_LINK_CAPACITY: usize = 1024;

// =============================================================================
// Output buffer
// =============================================================================

/// Bounded staging buffer between adapter reads and DEVICE_READ drains.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Reason bits reported by the adapter for the buffered tail.
    tail_reason: u32,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            tail_reason: 0,
        }
    }

    /// Returns `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stages an adapter payload, dropping bytes beyond capacity.
    pub fn push(&mut self, payload: ReadPayload) {
        let room = self.capacity.saturating_sub(self.data.len());
        let take = payload.data.len().min(room);
        self.data.extend(payload.data[..take].iter());
        self.tail_reason = payload.reason;
    }

    /// Stages a diagnostic line, replacing any partial content.
    pub fn stage_diagnostic(&mut self, text: &str) {
        self.data.clear();
        self.data.extend(text.as_bytes().iter().take(self.capacity));
        if !text.ends_with('\n') {
            self.data.push_back(b'\n');
        }
        self.tail_reason = reason::END;
    }

    /// Drains up to `max_len` bytes and computes the VXI-11 reason bits.
    pub fn drain(&mut self, max_len: usize) -> (Vec<u8>, u32) {
        let take = self.data.len().min(max_len);
        let out: Vec<u8> = self.data.drain(..take).collect();

        let mut bits = 0;
        if !out.is_empty() && out.len() == max_len {
            bits |= reason::REQCNT;
        }
        if self.data.is_empty() {
            // The buffered tail is fully delivered; propagate the adapter's
            // end/termination flags.
            bits |= self.tail_reason & (reason::END | reason::TERM_CHR);
            self.tail_reason = 0;
        }
        (out, bits)
    }

    /// Discards everything staged.
    pub fn clear(&mut self) {
        self.data.clear();
        self.tail_reason = 0;
    }
}

// =============================================================================
// Link
// =============================================================================

/// One active VXI-11 link.
pub struct Link {
    /// Gateway-assigned link identifier.
    pub lid: u32,
    /// The device definition pinned at link creation.
    pub device: Arc<DeviceConfig>,
    /// The adapter instance serving this link.
    pub adapter: Arc<dyn InstrumentAdapter>,
    /// Opaque client identifier from Create_LinkParms.
    pub client_id: i32,
    /// The RPC connection that owns this link.
    pub conn_id: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    has_lock: AtomicBool,
    /// Staged response bytes drained by DEVICE_READ.
    pub output: Mutex<OutputBuffer>,
}

impl Link {
    /// Whether this link currently holds the device lock.
    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::SeqCst)
    }

    /// Records lock ownership.
    pub fn set_lock(&self, held: bool) {
        self.has_lock.store(held, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("lid", &self.lid)
            .field("device", &self.device.name)
            .field("has_lock", &self.has_lock())
            .finish()
    }
}

// =============================================================================
// LinkRegistry
// =============================================================================

struct RegistryInner {
    next_lid: u32,
    links: HashMap<u32, Arc<Link>>,
}

/// Allocates link identifiers and tracks active links.
pub struct LinkRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
    output_capacity: usize,
}

impl LinkRegistry {
    /// Creates a registry with default capacities.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LINK_CAPACITY, DEFAULT_OUTPUT_CAPACITY)
    }

    /// Creates a registry with explicit link and buffer bounds.
    pub fn with_capacity(capacity: usize, output_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_lid: 1,
                links: HashMap::new(),
            }),
            capacity,
            output_capacity,
        }
    }

    /// Registers a new link and returns it.
    pub async fn create(
        &self,
        device: Arc<DeviceConfig>,
        adapter: Arc<dyn InstrumentAdapter>,
        client_id: i32,
        conn_id: u64,
    ) -> Result<Arc<Link>, LinkError> {
        let mut inner = self.inner.lock().await;
        if inner.links.len() >= self.capacity {
            return Err(LinkError::TableFull {
                capacity: self.capacity,
            });
        }

        // Monotonic allocation; skip 0 and ids still alive after wrap.
        let lid = loop {
            let candidate = inner.next_lid;
            inner.next_lid = inner.next_lid.wrapping_add(1);
            if candidate != 0 && !inner.links.contains_key(&candidate) {
                break candidate;
            }
        };

        let link = Arc::new(Link {
            lid,
            device,
            adapter,
            client_id,
            conn_id,
            created_at: Utc::now(),
            has_lock: AtomicBool::new(false),
            output: Mutex::new(OutputBuffer::new(self.output_capacity)),
        });
        inner.links.insert(lid, link.clone());
        Ok(link)
    }

    /// Looks up a link by id.
    pub async fn get(&self, lid: u32) -> Result<Arc<Link>, LinkError> {
        let inner = self.inner.lock().await;
        inner
            .links
            .get(&lid)
            .cloned()
            .ok_or(LinkError::NotFound { lid })
    }

    /// Removes a link by id and returns it.
    pub async fn remove(&self, lid: u32) -> Result<Arc<Link>, LinkError> {
        let mut inner = self.inner.lock().await;
        inner.links.remove(&lid).ok_or(LinkError::NotFound { lid })
    }

    /// Returns every link owned by one RPC connection.
    pub async fn links_for_connection(&self, conn_id: u64) -> Vec<Arc<Link>> {
        let inner = self.inner.lock().await;
        inner
            .links
            .values()
            .filter(|l| l.conn_id == conn_id)
            .cloned()
            .collect()
    }

    /// Number of active links.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.links.len()
    }

    /// Returns `true` when no links are active.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::reason;
    use crate::types::{DeviceRules, TransportKind, TransportParams, DEFAULT_IO_TIMEOUT};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullAdapter;

    #[async_trait]
    impl InstrumentAdapter for NullAdapter {
        fn name(&self) -> &str {
            "null"
        }
        fn kind(&self) -> TransportKind {
            TransportKind::Loopback
        }
        fn requires_lock(&self) -> bool {
            false
        }
        async fn acquire(&self) -> Result<(), crate::error::AdapterError> {
            Ok(())
        }
        async fn release(&self) {}
        async fn write(&self, data: &[u8]) -> Result<usize, crate::error::AdapterError> {
            Ok(data.len())
        }
        async fn read(
            &self,
            _max_len: usize,
            _timeout: Duration,
        ) -> Result<ReadPayload, crate::error::AdapterError> {
            Ok(ReadPayload::empty())
        }
    }

    fn device(name: &str) -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            name: name.into(),
            kind: TransportKind::Loopback,
            transport: TransportParams::Loopback,
            requires_lock: false,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::None,
        })
    }

    #[tokio::test]
    async fn test_create_destroy_round_trip() {
        let registry = LinkRegistry::new();
        assert!(registry.is_empty().await);

        let link = registry
            .create(device("echo"), Arc::new(NullAdapter), 7, 1)
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(link.lid).await.unwrap().device.name, "echo");

        registry.remove(link.lid).await.unwrap();
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.get(link.lid).await,
            Err(LinkError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lids_are_monotonic_and_nonzero() {
        let registry = LinkRegistry::new();
        let a = registry
            .create(device("echo"), Arc::new(NullAdapter), 0, 1)
            .await
            .unwrap();
        let b = registry
            .create(device("echo"), Arc::new(NullAdapter), 0, 1)
            .await
            .unwrap();
        assert!(a.lid != 0 && b.lid != 0);
        assert!(b.lid > a.lid);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = LinkRegistry::with_capacity(1, DEFAULT_OUTPUT_CAPACITY);
        registry
            .create(device("echo"), Arc::new(NullAdapter), 0, 1)
            .await
            .unwrap();
        let err = registry
            .create(device("echo"), Arc::new(NullAdapter), 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::TableFull { .. }));
    }

    #[tokio::test]
    async fn test_links_for_connection() {
        let registry = LinkRegistry::new();
        registry
            .create(device("a"), Arc::new(NullAdapter), 0, 10)
            .await
            .unwrap();
        registry
            .create(device("b"), Arc::new(NullAdapter), 0, 10)
            .await
            .unwrap();
        registry
            .create(device("c"), Arc::new(NullAdapter), 0, 11)
            .await
            .unwrap();
        assert_eq!(registry.links_for_connection(10).await.len(), 2);
        assert_eq!(registry.links_for_connection(99).await.len(), 0);
    }

    #[test]
    fn test_output_buffer_drain_reasons() {
        let mut buf = OutputBuffer::new(64);
        buf.push(ReadPayload::end(b"hello\n".to_vec()));

        // Partial drain leaves data behind and reports the count reason.
        let (data, bits) = buf.drain(2);
        assert_eq!(data, b"he");
        assert_eq!(bits, reason::REQCNT);

        // Final drain delivers the end flag.
        let (data, bits) = buf.drain(64);
        assert_eq!(data, b"llo\n");
        assert_eq!(bits, reason::END);

        // Nothing left: empty with no flags.
        let (data, bits) = buf.drain(64);
        assert!(data.is_empty());
        assert_eq!(bits, 0);
    }

    #[test]
    fn test_output_buffer_bounded() {
        let mut buf = OutputBuffer::new(4);
        buf.push(ReadPayload::end(b"123456".to_vec()));
        let (data, _) = buf.drain(16);
        assert_eq!(data, b"1234");
    }

    #[test]
    fn test_output_buffer_diagnostic() {
        let mut buf = OutputBuffer::new(64);
        buf.push(ReadPayload::end(b"partial".to_vec()));
        buf.stage_diagnostic("ERROR: MODBUS exception function=0x83 code=0x02");
        let (data, bits) = buf.drain(128);
        assert!(data.ends_with(b"\n"));
        assert!(String::from_utf8(data).unwrap().contains("0x83"));
        assert_eq!(bits, reason::END);
    }
}
