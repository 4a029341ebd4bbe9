// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The gateway engine.
//!
//! Implements the semantics behind every DEVICE_CORE procedure: name
//! resolution, link lifecycle, lock arbitration, opportunistic locking on
//! first I/O, adapter hardware transitions, and per-link response staging.
//! The RPC layer decodes wire structures and calls straight into this type;
//! everything here is transport-agnostic and fully testable in process.
//!
//! The live device table is an immutable snapshot swapped atomically on
//! reload; links pin the snapshot entry they were created from and keep
//! their settings until destroyed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::{AdapterFactory, InstrumentAdapter, ReadPayload};
use crate::error::{AdapterError, GatewayResult, LinkError};
use crate::link::{Link, LinkRegistry};
use crate::resource::ResourceManager;
use crate::types::DeviceConfig;

/// Default maximum message size advertised in Create_LinkResp.
pub const DEFAULT_MAX_RECV_SIZE: u32 = 1024 * 1024;

/// Immutable device-name → definition snapshot.
pub type DeviceMap = HashMap<String, Arc<DeviceConfig>>;

/// Outcome of CREATE_LINK.
#[derive(Debug, Clone, Copy)]
pub struct CreatedLink {
    /// The allocated link identifier.
    pub lid: u32,
    /// Maximum request size the gateway accepts.
    pub max_recv_size: u32,
}

// =============================================================================
// GatewayEngine
// =============================================================================

/// Routes VXI-11 operations to backend adapters.
pub struct GatewayEngine {
    devices: RwLock<Arc<DeviceMap>>,
    factory: Arc<dyn AdapterFactory>,
    links: LinkRegistry,
    resources: ResourceManager,
    max_recv_size: u32,
}

impl GatewayEngine {
    /// Creates an engine with an empty device table.
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            devices: RwLock::new(Arc::new(HashMap::new())),
            factory,
            links: LinkRegistry::new(),
            resources: ResourceManager::new(),
            max_recv_size: DEFAULT_MAX_RECV_SIZE,
        }
    }

    /// Overrides the advertised maximum request size.
    pub fn with_max_recv_size(mut self, size: u32) -> Self {
        self.max_recv_size = size;
        self
    }

    /// Installs a new device snapshot.
    ///
    /// Existing links keep the definitions they pinned at creation.
    pub fn install_devices(&self, map: DeviceMap) {
        let mut guard = self.devices.write().expect("device snapshot poisoned");
        *guard = Arc::new(map);
        info!(devices = guard.len(), "device snapshot installed");
    }

    /// Returns the current device snapshot.
    pub fn devices(&self) -> Arc<DeviceMap> {
        self.devices.read().expect("device snapshot poisoned").clone()
    }

    /// The advertised maximum request size.
    pub fn max_recv_size(&self) -> u32 {
        self.max_recv_size
    }

    // =========================================================================
    // Link lifecycle
    // =========================================================================

    /// CREATE_LINK: resolve, build the adapter, register the link, and
    /// optionally take the device lock up front.
    pub async fn create_link(
        &self,
        conn_id: u64,
        client_id: i32,
        device_name: &str,
        lock_device: bool,
        lock_timeout: Option<Duration>,
    ) -> GatewayResult<CreatedLink> {
        let device = self
            .devices()
            .get(device_name)
            .cloned()
            .ok_or_else(|| LinkError::UnknownDevice {
                name: device_name.to_string(),
            })?;

        let adapter = self.factory.build(&device)?;
        adapter.connect().await?;

        let link = self
            .links
            .create(device.clone(), adapter.clone(), client_id, conn_id)
            .await?;
        debug!(lid = link.lid, device = %device.name, "link created");

        if lock_device {
            let physical = device.physical_id();
            if let Err(err) = self
                .resources
                .lock(&physical, link.lid, true, lock_timeout)
                .await
            {
                let _ = self.links.remove(link.lid).await;
                let _ = adapter.disconnect().await;
                return Err(err.into());
            }
            if let Err(err) = self.acquire_bounded(&link, link.device.io_timeout).await {
                self.resources.force_unlock(&physical).await;
                let _ = self.links.remove(link.lid).await;
                let _ = adapter.disconnect().await;
                return Err(err.into());
            }
            link.set_lock(true);
        }

        Ok(CreatedLink {
            lid: link.lid,
            max_recv_size: self.max_recv_size,
        })
    }

    /// DESTROY_LINK: release everything the link holds.
    pub async fn destroy_link(&self, lid: u32) -> GatewayResult<()> {
        let link = self.links.remove(lid).await?;
        self.teardown(&link).await;
        debug!(lid, "link destroyed");
        Ok(())
    }

    /// Destroys every link owned by a dropped RPC connection.
    pub async fn destroy_connection(&self, conn_id: u64) {
        let links = self.links.links_for_connection(conn_id).await;
        if links.is_empty() {
            return;
        }
        info!(conn_id, count = links.len(), "cleaning up links for dropped connection");
        for link in links {
            if self.links.remove(link.lid).await.is_ok() {
                self.teardown(&link).await;
            }
        }
    }

    async fn teardown(&self, link: &Link) {
        if link.has_lock() {
            self.resources.force_unlock(&link.device.physical_id()).await;
            link.adapter.release().await;
            link.set_lock(false);
        }
        if let Err(err) = link.adapter.disconnect().await {
            warn!(lid = link.lid, error = %err, "adapter disconnect failed during teardown");
        }
        link.output.lock().await.clear();
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// DEVICE_WRITE: translate and forward one command.
    pub async fn device_write(
        &self,
        lid: u32,
        data: &[u8],
        io_timeout: Option<Duration>,
        lock_timeout: Option<Duration>,
    ) -> GatewayResult<usize> {
        let link = self.links.get(lid).await?;
        self.ensure_access(&link, lock_timeout).await?;

        let timeout = io_timeout.unwrap_or(link.device.io_timeout);
        let result = self
            .bounded(timeout, link.adapter.write(data))
            .await;

        match result {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Some(diag) = err.diagnostic() {
                    link.output.lock().await.stage_diagnostic(&diag);
                }
                Err(err.into())
            }
        }
    }

    /// DEVICE_READ: drain staged output, pulling from the adapter when empty.
    pub async fn device_read(
        &self,
        lid: u32,
        request_size: usize,
        io_timeout: Option<Duration>,
    ) -> GatewayResult<(Vec<u8>, u32)> {
        let link = self.links.get(lid).await?;
        let request_size = request_size.max(1).min(self.max_recv_size as usize);

        {
            let mut output = link.output.lock().await;
            if !output.is_empty() {
                return Ok(output.drain(request_size));
            }
        }

        self.ensure_access(&link, None).await?;
        let timeout = io_timeout.unwrap_or(link.device.io_timeout);
        let payload: ReadPayload = link.adapter.read(request_size, timeout).await?;

        let mut output = link.output.lock().await;
        output.push(payload);
        Ok(output.drain(request_size))
    }

    /// Enforces locking policy before hardware I/O.
    ///
    /// Lock-requiring adapters are opportunistically locked on first I/O
    /// when nobody holds the device; a lock held by another link fails the
    /// request instead.
    async fn ensure_access(&self, link: &Arc<Link>, lock_timeout: Option<Duration>) -> GatewayResult<()> {
        if !link.adapter.requires_lock() || link.has_lock() {
            return Ok(());
        }

        let physical = link.device.physical_id();
        let wait = matches!(lock_timeout, Some(t) if !t.is_zero());
        self.resources
            .lock(&physical, link.lid, wait, lock_timeout)
            .await?;

        if let Err(err) = self.acquire_bounded(link, link.device.io_timeout).await {
            self.resources.force_unlock(&physical).await;
            return Err(err.into());
        }
        link.set_lock(true);
        debug!(lid = link.lid, device = %link.device.name, "opportunistic lock taken");
        Ok(())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// DEVICE_LOCK: take the device lock and open the hardware.
    pub async fn device_lock(
        &self,
        lid: u32,
        wait: bool,
        lock_timeout: Option<Duration>,
    ) -> GatewayResult<()> {
        let link = self.links.get(lid).await?;
        let physical = link.device.physical_id();

        self.resources
            .lock(&physical, link.lid, wait, lock_timeout)
            .await?;

        if link.has_lock() {
            // Re-entrant lock; hardware already open.
            return Ok(());
        }

        if let Err(err) = self.acquire_bounded(&link, link.device.io_timeout).await {
            self.resources.force_unlock(&physical).await;
            return Err(err.into());
        }
        link.set_lock(true);
        Ok(())
    }

    /// DEVICE_UNLOCK: drop the device lock and close the hardware.
    pub async fn device_unlock(&self, lid: u32) -> GatewayResult<()> {
        let link = self.links.get(lid).await?;
        let physical = link.device.physical_id();

        self.resources.unlock(&physical, link.lid).await?;
        link.adapter.release().await;
        link.set_lock(false);
        Ok(())
    }

    // =========================================================================
    // Pass-through operations
    // =========================================================================

    /// DEVICE_TRIGGER.
    pub async fn device_trigger(&self, lid: u32) -> GatewayResult<()> {
        let link = self.links.get(lid).await?;
        link.adapter.trigger().await?;
        Ok(())
    }

    /// DEVICE_CLEAR.
    pub async fn device_clear(&self, lid: u32) -> GatewayResult<()> {
        let link = self.links.get(lid).await?;
        link.adapter.clear().await?;
        Ok(())
    }

    /// DEVICE_REMOTE / DEVICE_LOCAL: acknowledged, no backend action.
    pub async fn device_remote_local(&self, lid: u32) -> GatewayResult<()> {
        self.links.get(lid).await?;
        Ok(())
    }

    /// DEVICE_READSTB.
    pub async fn read_stb(&self, lid: u32) -> GatewayResult<u8> {
        let link = self.links.get(lid).await?;
        Ok(link.adapter.read_stb().await?)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Lock ownership by logical device name, for the admin API.
    pub async fn lock_owners(&self) -> HashMap<String, Option<u32>> {
        let physical = self.resources.owners().await;
        self.devices()
            .values()
            .map(|d| {
                let owner = physical.get(&d.physical_id()).copied().flatten();
                (d.name.clone(), owner)
            })
            .collect()
    }

    /// Number of active links.
    pub async fn active_links(&self) -> usize {
        self.links.len().await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn acquire_bounded(&self, link: &Link, timeout: Duration) -> Result<(), AdapterError> {
        self.bounded(timeout, link.adapter.acquire()).await
    }

    async fn bounded<T>(
        &self,
        timeout: Duration,
        operation: impl std::future::Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout { timeout }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::reason;
    use crate::error::{GatewayError, LockError, Vxi11ErrorCode};
    use crate::types::{DeviceRules, TransportKind, TransportParams, DEFAULT_IO_TIMEOUT};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Echo adapter tracking open/closed state.
    struct EchoAdapter {
        name: String,
        locking: bool,
        open: AtomicBool,
        fail_acquire: bool,
        last: Mutex<Vec<u8>>,
    }

    impl EchoAdapter {
        fn new(name: &str, locking: bool) -> Self {
            Self {
                name: name.into(),
                locking,
                open: AtomicBool::new(false),
                fail_acquire: false,
                last: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InstrumentAdapter for EchoAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> TransportKind {
            TransportKind::Loopback
        }
        fn requires_lock(&self) -> bool {
            self.locking
        }
        async fn acquire(&self) -> Result<(), AdapterError> {
            if self.fail_acquire {
                return Err(AdapterError::connect_failed("mock", "acquire refused"));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn release(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
        async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
            if self.locking && !self.open.load(Ordering::SeqCst) {
                return Err(AdapterError::not_connected(&self.name));
            }
            *self.last.lock().await = data.to_vec();
            Ok(data.len())
        }
        async fn read(
            &self,
            max_len: usize,
            _timeout: Duration,
        ) -> Result<ReadPayload, AdapterError> {
            let mut last = self.last.lock().await;
            let mut data = std::mem::take(&mut *last);
            data.truncate(max_len.max(1));
            Ok(ReadPayload::end(data))
        }
    }

    struct EchoFactory {
        locking: bool,
        fail_acquire: bool,
    }

    impl AdapterFactory for EchoFactory {
        fn build(
            &self,
            device: &Arc<DeviceConfig>,
        ) -> Result<Arc<dyn InstrumentAdapter>, AdapterError> {
            let mut adapter = EchoAdapter::new(&device.name, self.locking);
            adapter.fail_acquire = self.fail_acquire;
            Ok(Arc::new(adapter))
        }
    }

    fn engine(locking: bool, fail_acquire: bool) -> GatewayEngine {
        let engine = GatewayEngine::new(Arc::new(EchoFactory {
            locking,
            fail_acquire,
        }));
        let device = Arc::new(DeviceConfig {
            name: "echo".into(),
            kind: TransportKind::Loopback,
            transport: TransportParams::Loopback,
            requires_lock: locking,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::None,
        });
        let mut map = HashMap::new();
        map.insert("echo".to_string(), device);
        engine.install_devices(map);
        engine
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let engine = engine(false, false);
        let created = engine
            .create_link(1, 0, "echo", false, None)
            .await
            .unwrap();

        let written = engine
            .device_write(created.lid, b"hello\n", None, None)
            .await
            .unwrap();
        assert_eq!(written, 6);

        let (data, bits) = engine.device_read(created.lid, 64, None).await.unwrap();
        assert_eq!(data, b"hello\n");
        assert_eq!(bits, reason::END);

        engine.destroy_link(created.lid).await.unwrap();
        assert_eq!(engine.active_links().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_accessible() {
        let engine = engine(false, false);
        let err = engine
            .create_link(1, 0, "missing", false, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Vxi11ErrorCode::DeviceNotAccessible);
    }

    #[tokio::test]
    async fn test_invalid_link() {
        let engine = engine(false, false);
        let err = engine.device_write(999, b"x", None, None).await.unwrap_err();
        assert_eq!(err.error_code(), Vxi11ErrorCode::InvalidLinkIdentifier);
    }

    #[tokio::test]
    async fn test_opportunistic_lock_on_write() {
        let engine = engine(true, false);
        let created = engine
            .create_link(1, 0, "echo", false, None)
            .await
            .unwrap();

        // No explicit DEVICE_LOCK: the first write locks and acquires.
        engine
            .device_write(created.lid, b"cmd", None, None)
            .await
            .unwrap();
        assert_eq!(
            engine.lock_owners().await.get("echo"),
            Some(&Some(created.lid))
        );
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let engine = engine(true, false);
        let l1 = engine.create_link(1, 0, "echo", false, None).await.unwrap();
        let l2 = engine.create_link(2, 0, "echo", false, None).await.unwrap();

        engine.device_lock(l1.lid, true, None).await.unwrap();

        // Immediate failure without wait.
        let err = engine.device_lock(l2.lid, false, None).await.unwrap_err();
        assert_eq!(err.error_code(), Vxi11ErrorCode::DeviceLockedByAnotherLink);

        // Bounded wait also fails while held.
        let err = engine
            .device_lock(l2.lid, true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Vxi11ErrorCode::DeviceLockedByAnotherLink);

        // After unlock the second link wins.
        engine.device_unlock(l1.lid).await.unwrap();
        engine
            .device_lock(l2.lid, true, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let engine = engine(true, false);
        let l = engine.create_link(1, 0, "echo", false, None).await.unwrap();
        let err = engine.device_unlock(l.lid).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Lock(LockError::NotOwner { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_drop_releases_lock() {
        let engine = engine(true, false);
        let l1 = engine.create_link(10, 0, "echo", false, None).await.unwrap();
        engine.device_lock(l1.lid, true, None).await.unwrap();

        engine.destroy_connection(10).await;
        assert_eq!(engine.active_links().await, 0);

        // A fresh client can create and lock immediately.
        let l2 = engine.create_link(11, 0, "echo", false, None).await.unwrap();
        engine.device_lock(l2.lid, false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_failure_releases_lock() {
        let engine = engine(true, true);
        let l = engine.create_link(1, 0, "echo", false, None).await.unwrap();

        let err = engine.device_lock(l.lid, true, None).await.unwrap_err();
        assert_eq!(err.error_code(), Vxi11ErrorCode::DeviceNotAccessible);

        // The lock must not remain held after the failed acquire.
        assert_eq!(engine.lock_owners().await.get("echo"), Some(&None));
    }

    #[tokio::test]
    async fn test_create_with_lock_flag() {
        let engine = engine(true, false);
        let l = engine.create_link(1, 0, "echo", true, None).await.unwrap();
        assert_eq!(engine.lock_owners().await.get("echo"), Some(&Some(l.lid)));
        engine.destroy_link(l.lid).await.unwrap();
        assert_eq!(engine.lock_owners().await.get("echo"), Some(&None));
    }

    #[tokio::test]
    async fn test_readstb_answers_zero() {
        let engine = engine(false, false);
        let l = engine.create_link(1, 0, "echo", false, None).await.unwrap();
        assert_eq!(engine.read_stb(l.lid).await.unwrap(), 0);
    }
}
