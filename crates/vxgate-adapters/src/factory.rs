// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The default adapter factory.
//!
//! Maps a device definition's transport kind to its adapter implementation.
//! Construction never touches hardware; serial-based adapters receive the
//! shared bus arbiter so multi-drop devices coordinate wire access.

use std::sync::Arc;

use vxgate_core::adapter::{AdapterFactory, InstrumentAdapter};
use vxgate_core::error::AdapterError;
use vxgate_core::serial::SerialBusArbiter;
use vxgate_core::types::{DeviceConfig, TransportKind};

use vxgate_modbus::{ModbusSerialAdapter, ModbusTcpAdapter};

use crate::generic::GenericRegexAdapter;
use crate::loopback::LoopbackAdapter;
use crate::scpi_serial::ScpiSerialAdapter;
use crate::scpi_tcp::ScpiTcpAdapter;
use crate::usbtmc::UsbTmcAdapter;

/// Builds adapters for every supported transport kind.
pub struct DefaultAdapterFactory {
    arbiter: Arc<SerialBusArbiter>,
}

impl DefaultAdapterFactory {
    /// Creates a factory with a fresh serial-bus arbiter.
    pub fn new() -> Self {
        Self {
            arbiter: Arc::new(SerialBusArbiter::new()),
        }
    }

    /// Creates a factory sharing an existing arbiter.
    pub fn with_arbiter(arbiter: Arc<SerialBusArbiter>) -> Self {
        Self { arbiter }
    }

    /// The serial-bus arbiter serial adapters coordinate through.
    pub fn arbiter(&self) -> Arc<SerialBusArbiter> {
        self.arbiter.clone()
    }
}

impl Default for DefaultAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn build(
        &self,
        device: &Arc<DeviceConfig>,
    ) -> Result<Arc<dyn InstrumentAdapter>, AdapterError> {
        let adapter: Arc<dyn InstrumentAdapter> = match device.kind {
            TransportKind::Loopback => Arc::new(LoopbackAdapter::new(device.clone())),
            TransportKind::ScpiTcp => Arc::new(ScpiTcpAdapter::new(device.clone())?),
            TransportKind::ScpiSerial => Arc::new(ScpiSerialAdapter::new(
                device.clone(),
                self.arbiter.clone(),
            )?),
            TransportKind::ModbusTcp => Arc::new(ModbusTcpAdapter::new(device.clone())?),
            TransportKind::ModbusRtu | TransportKind::ModbusAscii => Arc::new(
                ModbusSerialAdapter::new(device.clone(), self.arbiter.clone())?,
            ),
            TransportKind::Usbtmc => Arc::new(UsbTmcAdapter::new(device.clone())?),
            TransportKind::GenericRegex => Arc::new(GenericRegexAdapter::new(
                device.clone(),
                self.arbiter.clone(),
            )?),
        };
        Ok(adapter)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vxgate_core::types::{DeviceRules, TransportParams, DEFAULT_IO_TIMEOUT};

    #[test]
    fn test_builds_loopback() {
        let factory = DefaultAdapterFactory::new();
        let device = Arc::new(DeviceConfig {
            name: "echo".into(),
            kind: TransportKind::Loopback,
            transport: TransportParams::Loopback,
            requires_lock: false,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::None,
        });
        let adapter = factory.build(&device).unwrap();
        assert_eq!(adapter.kind(), TransportKind::Loopback);
        assert!(!adapter.requires_lock());
    }

    #[test]
    fn test_kind_transport_mismatch_is_rejected() {
        let factory = DefaultAdapterFactory::new();
        let device = Arc::new(DeviceConfig {
            name: "broken".into(),
            kind: TransportKind::ScpiTcp,
            transport: TransportParams::Loopback,
            requires_lock: false,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::None,
        });
        assert!(matches!(
            factory.build(&device),
            Err(AdapterError::Config { .. })
        ));
    }
}
