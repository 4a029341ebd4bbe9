// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared serial-bus arbitration.
//!
//! Multi-drop RS-485 buses carry several logical devices on one physical
//! port. The arbiter keeps a single port handle per normalized path and a
//! per-port async mutex; adapters run each request/response exchange inside
//! one [`SerialBus::transaction`] hold, so no byte of one frame ever
//! interleaves with another's.
//!
//! The arbiter is held *inside* the VXI-11 device lock: two devices on the
//! same bus may be locked by different clients simultaneously, but their
//! wire exchanges serialize here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::types::{ParityMode, SerialSettings, StopBitsMode};

/// Normalizes platform-specific serial port names.
pub fn normalize_path(path: &str) -> String {
    // URL-style transports (socket://, loop://) stay intact.
    if path.contains("://") {
        return path.to_string();
    }
    #[cfg(windows)]
    {
        if !path.starts_with(r"\\.\") {
            return format!(r"\\.\{}", path);
        }
    }
    path.to_string()
}

fn builder_for(settings: &SerialSettings) -> tokio_serial::SerialPortBuilder {
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match settings.parity {
        ParityMode::None => tokio_serial::Parity::None,
        ParityMode::Even => tokio_serial::Parity::Even,
        ParityMode::Odd => tokio_serial::Parity::Odd,
    };
    let stop_bits = match settings.stop_bits {
        StopBitsMode::One => tokio_serial::StopBits::One,
        StopBitsMode::Two => tokio_serial::StopBits::Two,
    };
    tokio_serial::new(normalize_path(&settings.path), settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
}

// =============================================================================
// SerialBus
// =============================================================================

/// One shared physical serial port and its transaction mutex.
pub struct SerialBus {
    key: String,
    settings: SerialSettings,
    state: Mutex<Option<SerialStream>>,
    refcount: AtomicUsize,
}

impl SerialBus {
    /// The line settings this bus was opened with.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Begins an exclusive wire transaction, opening the port if needed.
    ///
    /// The returned guard holds the bus mutex; drop it only after the final
    /// response byte is consumed.
    pub async fn transaction(&self) -> Result<SerialTransaction<'_>, AdapterError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let stream = builder_for(&self.settings)
                .open_native_async()
                .map_err(|e| AdapterError::connect_failed(&self.key, e))?;
            debug!(port = %self.key, baud = self.settings.baud_rate, "serial port opened");
            *guard = Some(stream);
        }
        Ok(SerialTransaction { guard })
    }
}

impl std::fmt::Debug for SerialBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBus")
            .field("key", &self.key)
            .field("refcount", &self.refcount.load(Ordering::SeqCst))
            .finish()
    }
}

/// An exclusive hold on a serial bus for one request/response exchange.
pub struct SerialTransaction<'a> {
    guard: MutexGuard<'a, Option<SerialStream>>,
}

impl SerialTransaction<'_> {
    /// The open port stream.
    pub fn stream(&mut self) -> &mut SerialStream {
        // transaction() opened the port before handing out the guard.
        self.guard.as_mut().expect("serial stream open for transaction")
    }

    /// Drops the port handle so the next transaction reopens it.
    ///
    /// Called after wire-level faults that leave the line state unknown.
    pub fn invalidate(&mut self) {
        *self.guard = None;
    }
}

// =============================================================================
// SerialBusArbiter
// =============================================================================

/// Registry of shared serial buses, keyed by normalized path.
#[derive(Default)]
pub struct SerialBusArbiter {
    buses: StdMutex<HashMap<String, Arc<SerialBus>>>,
}

impl SerialBusArbiter {
    /// Creates an empty arbiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bus for `settings.path`, creating it if needed.
    ///
    /// A second attach with conflicting line settings is a configuration
    /// error: both devices would program the same UART differently.
    pub fn attach(&self, settings: &SerialSettings) -> Result<Arc<SerialBus>, AdapterError> {
        let key = normalize_path(&settings.path);
        let mut buses = self.buses.lock().expect("serial arbiter poisoned");

        if let Some(bus) = buses.get(&key) {
            if bus.settings != *settings {
                return Err(AdapterError::config(format!(
                    "serial port {:?} already attached with different line settings",
                    key
                )));
            }
            bus.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(bus.clone());
        }

        let bus = Arc::new(SerialBus {
            key: key.clone(),
            settings: settings.clone(),
            state: Mutex::new(None),
            refcount: AtomicUsize::new(1),
        });
        buses.insert(key, bus.clone());
        Ok(bus)
    }

    /// Releases one reference to `bus`, closing the port when unused.
    pub fn detach(&self, bus: &Arc<SerialBus>) {
        let remaining = bus.refcount.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 {
            return;
        }
        let mut buses = self.buses.lock().expect("serial arbiter poisoned");
        buses.remove(&bus.key);
        drop(buses);
        match bus.state.try_lock() {
            Ok(mut guard) => {
                *guard = None;
                debug!(port = %bus.key, "serial port closed");
            }
            Err(_) => {
                // A transaction is still in flight; the stream drops with it.
                warn!(port = %bus.key, "serial port busy at detach, deferring close");
            }
        }
    }

    /// Number of registered buses.
    pub fn len(&self) -> usize {
        self.buses.lock().expect("serial arbiter poisoned").len()
    }

    /// Returns `true` when no buses are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(path: &str, baud: u32) -> SerialSettings {
        SerialSettings {
            path: path.into(),
            baud_rate: baud,
            data_bits: 8,
            parity: ParityMode::None,
            stop_bits: StopBitsMode::One,
        }
    }

    #[test]
    fn test_attach_shares_bus_per_path() {
        let arbiter = SerialBusArbiter::new();
        let a = arbiter.attach(&settings("/dev/ttyS0", 9600)).unwrap();
        let b = arbiter.attach(&settings("/dev/ttyS0", 9600)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(arbiter.len(), 1);
    }

    #[test]
    fn test_attach_rejects_conflicting_settings() {
        let arbiter = SerialBusArbiter::new();
        arbiter.attach(&settings("/dev/ttyS0", 9600)).unwrap();
        let err = arbiter.attach(&settings("/dev/ttyS0", 19200)).unwrap_err();
        assert!(matches!(err, AdapterError::Config { .. }));
    }

    #[test]
    fn test_detach_closes_when_unused() {
        let arbiter = SerialBusArbiter::new();
        let a = arbiter.attach(&settings("/dev/ttyS0", 9600)).unwrap();
        let b = arbiter.attach(&settings("/dev/ttyS0", 9600)).unwrap();
        arbiter.detach(&a);
        assert_eq!(arbiter.len(), 1);
        arbiter.detach(&b);
        assert!(arbiter.is_empty());
    }

    #[test]
    fn test_normalize_keeps_urls() {
        assert_eq!(normalize_path("socket://127.0.0.1:7777"), "socket://127.0.0.1:7777");
        assert_eq!(normalize_path("/dev/ttyUSB0"), "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_transaction_serializes_access() {
        // Without a real port the open fails, but the mutex ordering can be
        // exercised through the state lock directly.
        let arbiter = SerialBusArbiter::new();
        let bus = arbiter.attach(&settings("/dev/null-nonexistent", 9600)).unwrap();
        let first = bus.state.lock().await;
        assert!(bus.state.try_lock().is_err());
        drop(first);
        assert!(bus.state.try_lock().is_ok());
    }
}
