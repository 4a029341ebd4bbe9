// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Exclusive device lock arbitration.
//!
//! The resource manager mediates the VXI-11 device lock: one owner per
//! physical device, FIFO among waiters, deadline-bounded acquisition, and
//! force-release for cleanup paths. Lock keys are physical-device
//! identifiers ([`crate::types::DeviceConfig::physical_id`]), so logical
//! devices sharing an exclusive endpoint contend on one entry.
//!
//! This is distinct from the serial-bus arbiter: the arbiter serializes
//! individual wire transactions on a shared bus, while this lock gives a
//! client session exclusive use of a device across many requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::LockError;

struct Owner {
    lid: u32,
    // Holding the guard keeps waiters queued; dropping it wakes the head.
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
struct DeviceSlot {
    mutex: Arc<Mutex<()>>,
    owner: Option<Owner>,
}

/// Manages exclusive access to physical devices.
#[derive(Default)]
pub struct ResourceManager {
    slots: Mutex<HashMap<String, DeviceSlot>>,
}

impl ResourceManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock on `device` for link `lid`.
    ///
    /// Re-entrant for the current owner. With `wait` false a held lock fails
    /// immediately; with `wait` true the caller queues FIFO until the lock
    /// frees or `timeout` elapses (`None` waits indefinitely).
    pub async fn lock(
        &self,
        device: &str,
        lid: u32,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let mutex = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(device.to_string()).or_default();
            if let Some(owner) = &slot.owner {
                if owner.lid == lid {
                    return Ok(());
                }
            }
            slot.mutex.clone()
        };

        let guard = if wait {
            match timeout {
                Some(deadline) => tokio::time::timeout(deadline, mutex.lock_owned())
                    .await
                    .map_err(|_| LockError::Locked {
                        device: device.to_string(),
                    })?,
                None => mutex.lock_owned().await,
            }
        } else {
            mutex.try_lock_owned().map_err(|_| LockError::Locked {
                device: device.to_string(),
            })?
        };

        let mut slots = self.slots.lock().await;
        let slot = slots.entry(device.to_string()).or_default();
        slot.owner = Some(Owner { lid, _guard: guard });
        debug!(device, lid, "device lock acquired");
        Ok(())
    }

    /// Releases the lock on `device` held by `lid`.
    pub async fn unlock(&self, device: &str, lid: u32) -> Result<(), LockError> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(device.to_string()).or_default();
        match &slot.owner {
            Some(owner) if owner.lid == lid => {
                slot.owner = None;
                debug!(device, lid, "device lock released");
                Ok(())
            }
            _ => Err(LockError::NotOwner {
                device: device.to_string(),
                lid,
            }),
        }
    }

    /// Force-releases the lock on `device` regardless of owner.
    ///
    /// Used on link destruction and connection drop; idempotent.
    pub async fn force_unlock(&self, device: &str) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(device) {
            if slot.owner.take().is_some() {
                debug!(device, "device lock force-released");
            }
        }
    }

    /// Returns the current owner of `device`, if any.
    pub async fn owner(&self, device: &str) -> Option<u32> {
        let slots = self.slots.lock().await;
        slots.get(device).and_then(|s| s.owner.as_ref().map(|o| o.lid))
    }

    /// Returns a consistent snapshot of device → owner.
    pub async fn owners(&self) -> HashMap<String, Option<u32>> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|(k, s)| (k.clone(), s.owner.as_ref().map(|o| o.lid)))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_lock_unlock_cycle() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();
        assert_eq!(rm.owner("dev").await, Some(1));
        rm.unlock("dev", 1).await.unwrap();
        assert_eq!(rm.owner("dev").await, None);
    }

    #[tokio::test]
    async fn test_reentrant_lock() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();
        rm.lock("dev", 1, false, None).await.unwrap();
        assert_eq!(rm.owner("dev").await, Some(1));
    }

    #[tokio::test]
    async fn test_no_wait_fails_immediately() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();
        let err = rm.lock("dev", 2, false, None).await.unwrap_err();
        assert!(matches!(err, LockError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_wait_times_out_after_deadline() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();

        let start = Instant::now();
        let err = rm
            .lock("dev", 2, true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Locked { .. }));
        assert!(start.elapsed() >= Duration::from_millis(45));
        // Owner unchanged.
        assert_eq!(rm.owner("dev").await, Some(1));
    }

    #[tokio::test]
    async fn test_waiter_succeeds_after_unlock() {
        let rm = Arc::new(ResourceManager::new());
        rm.lock("dev", 1, true, None).await.unwrap();

        let rm2 = rm.clone();
        let waiter = tokio::spawn(async move {
            rm2.lock("dev", 2, true, Some(Duration::from_secs(1))).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        rm.unlock("dev", 1).await.unwrap();

        waiter.await.unwrap().unwrap();
        assert_eq!(rm.owner("dev").await, Some(2));
    }

    #[tokio::test]
    async fn test_unlock_requires_ownership() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();
        let err = rm.unlock("dev", 2).await.unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        // Unlocking an idle device is also an ownership error.
        let err = rm.unlock("other", 2).await.unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_force_unlock_is_idempotent() {
        let rm = ResourceManager::new();
        rm.lock("dev", 1, true, None).await.unwrap();
        rm.force_unlock("dev").await;
        rm.force_unlock("dev").await;
        assert_eq!(rm.owner("dev").await, None);
        // A new owner can take over immediately.
        rm.lock("dev", 2, false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_owners_snapshot() {
        let rm = ResourceManager::new();
        rm.lock("a", 1, true, None).await.unwrap();
        rm.lock("b", 2, true, None).await.unwrap();
        rm.unlock("b", 2).await.unwrap();

        let owners = rm.owners().await;
        assert_eq!(owners.get("a"), Some(&Some(1)));
        assert_eq!(owners.get("b"), Some(&None));
    }
}
