// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! SCPI over a serial port.
//!
//! Same termination semantics as the TCP variant, but the port may be shared
//! with other instruments: every write and every read holds the serial-bus
//! arbiter so exchanges from different links never interleave on the wire.
//!
//! `requires_lock` defaults to true; a serial instrument is single-user.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use vxgate_core::adapter::{reason, InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::serial::{SerialBus, SerialBusArbiter};
use vxgate_core::types::{DeviceConfig, SerialSettings, TransportKind, TransportParams};

/// Adapter forwarding SCPI commands over a serial line.
pub struct ScpiSerialAdapter {
    device: Arc<DeviceConfig>,
    settings: SerialSettings,
    arbiter: Arc<SerialBusArbiter>,
    bus: Mutex<Option<Arc<SerialBus>>>,
}

impl ScpiSerialAdapter {
    /// Builds the adapter; performs no I/O.
    pub fn new(
        device: Arc<DeviceConfig>,
        arbiter: Arc<SerialBusArbiter>,
    ) -> Result<Self, AdapterError> {
        let settings = match &device.transport {
            TransportParams::ScpiSerial(settings) => settings.clone(),
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a scpi-serial device",
                    device.name
                )))
            }
        };
        Ok(Self {
            device,
            settings,
            arbiter,
            bus: Mutex::new(None),
        })
    }

    async fn bus(&self) -> Result<Arc<SerialBus>, AdapterError> {
        self.bus
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))
    }
}

#[async_trait]
impl InstrumentAdapter for ScpiSerialAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::ScpiSerial
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        let mut bus = self.bus.lock().await;
        if bus.is_none() {
            *bus = Some(self.arbiter.attach(&self.settings)?);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        if let Some(bus) = self.bus.lock().await.take() {
            self.arbiter.detach(&bus);
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        // Open the port now so lock-time failures surface immediately.
        let bus = self.bus().await?;
        bus.transaction().await.map(|_| ())
    }

    async fn release(&self) {
        // The port may be shared; the arbiter closes it on final detach.
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let mut payload = data.to_vec();
        if let Some(term) = &self.device.write_termination {
            if !payload.ends_with(term) {
                payload.extend_from_slice(term);
            }
        }

        let bus = self.bus().await?;
        let mut txn = bus.transaction().await?;
        let timeout = self.device.io_timeout;

        let result = tokio::time::timeout(timeout, async {
            txn.stream().write_all(&payload).await?;
            txn.stream().flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(payload.len()),
            Ok(Err(e)) => {
                txn.invalidate();
                Err(AdapterError::io(&self.settings.path, e))
            }
            Err(_) => {
                txn.invalidate();
                Err(AdapterError::Timeout { timeout })
            }
        }
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<ReadPayload, AdapterError> {
        let bus = self.bus().await?;
        let mut txn = bus.transaction().await?;

        let term = self.device.read_termination.as_deref();
        let target = max_len.max(1);
        let deadline = tokio::time::Instant::now() + timeout;

        let mut buffer: Vec<u8> = Vec::with_capacity(target.min(256));
        let mut byte = [0u8; 1];

        loop {
            if buffer.len() >= target {
                return Ok(ReadPayload {
                    data: buffer,
                    reason: reason::REQCNT,
                });
            }
            if let Some(term) = term {
                if buffer.ends_with(term) {
                    return Ok(ReadPayload {
                        data: buffer,
                        reason: reason::END | reason::TERM_CHR,
                    });
                }
            }

            match tokio::time::timeout_at(deadline, txn.stream().read(&mut byte)).await {
                Ok(Ok(0)) => {
                    txn.invalidate();
                    return Err(AdapterError::io(&self.settings.path, "serial port closed"));
                }
                Ok(Ok(_)) => buffer.push(byte[0]),
                Ok(Err(e)) => {
                    txn.invalidate();
                    return Err(AdapterError::io(&self.settings.path, e));
                }
                Err(_) => {
                    if buffer.is_empty() {
                        return Err(AdapterError::Timeout { timeout });
                    }
                    return Ok(ReadPayload {
                        data: buffer,
                        reason: reason::END,
                    });
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vxgate_core::types::{DeviceRules, ParityMode, StopBitsMode, DEFAULT_IO_TIMEOUT};

    fn device() -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            name: "dmm".into(),
            kind: TransportKind::ScpiSerial,
            transport: TransportParams::ScpiSerial(SerialSettings {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 115_200,
                data_bits: 8,
                parity: ParityMode::None,
                stop_bits: StopBitsMode::One,
            }),
            requires_lock: true,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: Some(b"\n".to_vec()),
            read_termination: Some(b"\n".to_vec()),
            rules: DeviceRules::None,
        })
    }

    #[tokio::test]
    async fn test_io_before_connect_is_rejected() {
        let adapter = ScpiSerialAdapter::new(device(), Arc::new(SerialBusArbiter::new())).unwrap();
        assert!(matches!(
            adapter.write(b"*IDN?").await,
            Err(AdapterError::NotConnected { .. })
        ));
        assert!(matches!(
            adapter.read(16, DEFAULT_IO_TIMEOUT).await,
            Err(AdapterError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_registers_with_arbiter() {
        let arbiter = Arc::new(SerialBusArbiter::new());
        let adapter = ScpiSerialAdapter::new(device(), arbiter.clone()).unwrap();
        adapter.connect().await.unwrap();
        assert_eq!(arbiter.len(), 1);
        adapter.disconnect().await.unwrap();
        assert!(arbiter.is_empty());
    }

    #[test]
    fn test_wrong_transport_kind_is_config_error() {
        let mut cfg = (*device()).clone();
        cfg.transport = TransportParams::Loopback;
        assert!(matches!(
            ScpiSerialAdapter::new(Arc::new(cfg), Arc::new(SerialBusArbiter::new())),
            Err(AdapterError::Config { .. })
        ));
    }
}
