// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MODBUS backend adapters.
//!
//! All three framings share one flow: an incoming ASCII command runs through
//! the device's mapping rules, the resulting PDU travels over the transport,
//! and the decoded reply is staged as ASCII for the next DEVICE_READ. Serial
//! framings additionally hold the bus arbiter for the whole exchange so
//! multi-drop devices never interleave frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use vxgate_core::adapter::{InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::mapping::{decode_registers, ModbusAction, ModbusRuleSet, Translation};
use vxgate_core::serial::{SerialBus, SerialBusArbiter};
use vxgate_core::types::{
    DeviceConfig, DeviceRules, SerialSettings, TcpEndpoint, TransportKind, TransportParams,
};

use crate::pdu::{build_request, parse_response, ResponseValue};
use crate::tcp::MbapClient;
use crate::{ascii, rtu};

/// Extracts the compiled MODBUS rules from a device definition.
fn rules_of(device: &DeviceConfig) -> Result<Arc<ModbusRuleSet>, AdapterError> {
    match &device.rules {
        DeviceRules::Modbus(rules) => Ok(rules.clone()),
        _ => Err(AdapterError::config(format!(
            "device {:?} has no MODBUS mapping rules",
            device.name
        ))),
    }
}

/// Formats a parsed response for the link output buffer.
///
/// Register reads decode per the rule's data type (with optional descaling),
/// bit reads render a 1/0 string, writes stage nothing.
fn format_response(
    action: &ModbusAction,
    response: ResponseValue,
) -> Result<Option<String>, AdapterError> {
    match response {
        ResponseValue::Registers(registers) => {
            let mut value = decode_registers(&registers, action.data_type)?;
            if let Some(scale) = action.response_scale {
                value = value.descale(scale);
            }
            Ok(Some(format!("{}\n", value.format())))
        }
        ResponseValue::Bits(bits) => {
            let rendered: String = bits.iter().map(|&b| if b { '1' } else { '0' }).collect();
            Ok(Some(format!("{}\n", rendered)))
        }
        ResponseValue::WriteAck => Ok(None),
    }
}

fn decode_command(data: &[u8]) -> Result<String, AdapterError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| AdapterError::invalid_command("MODBUS commands must be ASCII"))?;
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

// =============================================================================
// MODBUS TCP adapter
// =============================================================================

/// Adapter for MODBUS slaves behind an MBAP/TCP endpoint.
pub struct ModbusTcpAdapter {
    device: Arc<DeviceConfig>,
    rules: Arc<ModbusRuleSet>,
    endpoint: TcpEndpoint,
    unit_id: u8,
    client: Mutex<Option<MbapClient>>,
    staged: Mutex<Vec<u8>>,
}

impl ModbusTcpAdapter {
    /// Builds the adapter; performs no I/O.
    pub fn new(device: Arc<DeviceConfig>) -> Result<Self, AdapterError> {
        let (endpoint, unit_id) = match &device.transport {
            TransportParams::ModbusTcp { endpoint, unit_id } => (endpoint.clone(), *unit_id),
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a modbus-tcp device",
                    device.name
                )))
            }
        };
        let rules = rules_of(&device)?;
        Ok(Self {
            device,
            rules,
            endpoint,
            unit_id,
            client: Mutex::new(None),
            staged: Mutex::new(Vec::new()),
        })
    }

    async fn execute(&self, action: &ModbusAction) -> Result<ResponseValue, AdapterError> {
        let pdu = build_request(action)?;

        let mut guard = self.client.lock().await;
        if guard.is_none() {
            // Lazy open for non-locking use; acquire() opens eagerly.
            let mut client =
                MbapClient::new(self.endpoint.clone(), self.unit_id, self.device.io_timeout);
            client.connect().await?;
            *guard = Some(client);
        }
        let client = guard.as_mut().ok_or_else(|| {
            AdapterError::not_connected(&self.device.name)
        })?;

        let response_pdu = client.transact(&pdu).await?;
        parse_response(action, &response_pdu)
    }
}

#[async_trait]
impl InstrumentAdapter for ModbusTcpAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::ModbusTcp
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let mut client =
                MbapClient::new(self.endpoint.clone(), self.unit_id, self.device.io_timeout);
            client.connect().await?;
            *guard = Some(client);
        }
        Ok(())
    }

    async fn release(&self) {
        if let Some(mut client) = self.client.lock().await.take() {
            client.close().await;
        }
        self.staged.lock().await.clear();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = decode_command(data)?;

        match self.rules.translate(&command)? {
            Translation::Static(text) => {
                let mut staged = self.staged.lock().await;
                *staged = text.into_bytes();
                if !staged.ends_with(b"\n") {
                    staged.push(b'\n');
                }
            }
            Translation::Action(action) => {
                debug!(device = %self.device.name, op = %action.op, "MODBUS TCP exchange");
                let response = self.execute(&action).await?;
                let mut staged = self.staged.lock().await;
                *staged = format_response(&action, response)?
                    .map(String::into_bytes)
                    .unwrap_or_default();
            }
        }
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
// Serial MODBUS adapters (RTU and ASCII)
// =============================================================================

/// Wire framing used by a serial MODBUS adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFraming {
    /// Binary ADU with CRC-16 and timing-based frame boundaries.
    Rtu,
    /// Hex-ASCII ADU with LRC and explicit `:`/CRLF delimiters.
    Ascii,
}

/// Adapter for MODBUS slaves on a shared serial bus.
pub struct ModbusSerialAdapter {
    device: Arc<DeviceConfig>,
    rules: Arc<ModbusRuleSet>,
    framing: SerialFraming,
    settings: SerialSettings,
    unit_id: u8,
    arbiter: Arc<SerialBusArbiter>,
    bus: Mutex<Option<Arc<SerialBus>>>,
    staged: Mutex<Vec<u8>>,
}

impl ModbusSerialAdapter {
    /// Builds the adapter; performs no I/O.
    pub fn new(
        device: Arc<DeviceConfig>,
        arbiter: Arc<SerialBusArbiter>,
    ) -> Result<Self, AdapterError> {
        let (settings, unit_id, framing) = match &device.transport {
            TransportParams::ModbusRtu { serial, unit_id } => {
                (serial.clone(), *unit_id, SerialFraming::Rtu)
            }
            TransportParams::ModbusAscii { serial, unit_id } => {
                (serial.clone(), *unit_id, SerialFraming::Ascii)
            }
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a serial MODBUS device",
                    device.name
                )))
            }
        };
        let rules = rules_of(&device)?;
        Ok(Self {
            device,
            rules,
            framing,
            settings,
            unit_id,
            arbiter,
            bus: Mutex::new(None),
            staged: Mutex::new(Vec::new()),
        })
    }

    async fn execute(&self, action: &ModbusAction) -> Result<ResponseValue, AdapterError> {
        let pdu = build_request(action)?;

        let bus = self
            .bus
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;

        // One arbiter hold spans the send and the final response byte.
        let mut txn = bus.transaction().await?;
        let result = match self.framing {
            SerialFraming::Rtu => {
                rtu::transact(
                    txn.stream(),
                    self.unit_id,
                    &self.settings,
                    &pdu,
                    self.device.io_timeout,
                )
                .await
            }
            SerialFraming::Ascii => {
                ascii::transact(
                    txn.stream(),
                    self.unit_id,
                    &self.settings,
                    &pdu,
                    self.device.io_timeout,
                )
                .await
            }
        };

        let response_pdu = match result {
            Ok(pdu) => pdu,
            Err(err) => {
                if matches!(err, AdapterError::Io { .. } | AdapterError::Frame { .. }) {
                    txn.invalidate();
                }
                return Err(err);
            }
        };
        parse_response(action, &response_pdu)
    }
}

#[async_trait]
impl InstrumentAdapter for ModbusSerialAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        self.device.kind
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        // Registers with the arbiter; the port itself opens lazily inside
        // the first transaction.
        let mut bus = self.bus.lock().await;
        if bus.is_none() {
            *bus = Some(self.arbiter.attach(&self.settings)?);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.staged.lock().await.clear();
        if let Some(bus) = self.bus.lock().await.take() {
            self.arbiter.detach(&bus);
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        // Force the port open so lock-time failures surface immediately.
        let bus = self
            .bus
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;
        bus.transaction().await.map(|_| ())
    }

    async fn release(&self) {
        // The port is shared with other units on the bus; the arbiter closes
        // it when the last adapter detaches.
        self.staged.lock().await.clear();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = decode_command(data)?;

        match self.rules.translate(&command)? {
            Translation::Static(text) => {
                let mut staged = self.staged.lock().await;
                *staged = text.into_bytes();
                if !staged.ends_with(b"\n") {
                    staged.push(b'\n');
                }
            }
            Translation::Action(action) => {
                debug!(
                    device = %self.device.name,
                    unit_id = self.unit_id,
                    op = %action.op,
                    framing = ?self.framing,
                    "serial MODBUS exchange"
                );
                let response = self.execute(&action).await?;
                let mut staged = self.staged.lock().await;
                *staged = format_response(&action, response)?
                    .map(String::into_bytes)
                    .unwrap_or_default();
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use vxgate_core::mapping::{DataType, ModbusOp, ModbusRuleSpec};
    use vxgate_core::types::{DeviceRules, DEFAULT_IO_TIMEOUT};

    fn float_action() -> ModbusAction {
        ModbusAction {
            op: ModbusOp::ReadHoldingRegisters,
            address: 100,
            count: 2,
            values: Vec::new(),
            coils: Vec::new(),
            data_type: DataType::Float32Be,
            response_scale: None,
        }
    }

    #[test]
    fn test_format_register_response() {
        let out = format_response(
            &float_action(),
            ResponseValue::Registers(vec![0x41C8, 0x0000]),
        )
        .unwrap();
        assert_eq!(out, Some("25.0\n".to_string()));
    }

    #[test]
    fn test_format_scaled_response() {
        let mut action = float_action();
        action.data_type = DataType::Uint16;
        action.response_scale = Some(10.0);
        let out = format_response(&action, ResponseValue::Registers(vec![235])).unwrap();
        assert_eq!(out, Some("23.5\n".to_string()));
    }

    #[test]
    fn test_format_bit_response() {
        let out = format_response(
            &float_action(),
            ResponseValue::Bits(vec![true, false, true]),
        )
        .unwrap();
        assert_eq!(out, Some("101\n".to_string()));
    }

    #[test]
    fn test_format_write_ack_stages_nothing() {
        let out = format_response(&float_action(), ResponseValue::WriteAck).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_decode_command_strips_terminators() {
        assert_eq!(decode_command(b"MEAS:TEMP?\r\n").unwrap(), "MEAS:TEMP?");
        assert_eq!(decode_command(b"MEAS:TEMP?").unwrap(), "MEAS:TEMP?");
        assert!(decode_command(&[0xFF, 0xFE]).is_err());
    }

    fn tcp_device(rules: Vec<ModbusRuleSpec>) -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            name: "oven".into(),
            kind: TransportKind::ModbusTcp,
            transport: TransportParams::ModbusTcp {
                endpoint: TcpEndpoint {
                    host: "127.0.0.1".into(),
                    port: 502,
                },
                unit_id: 5,
            },
            requires_lock: false,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::Modbus(Arc::new(ModbusRuleSet::compile(rules).unwrap())),
        })
    }

    #[tokio::test]
    async fn test_static_response_bypasses_wire() {
        let device = tcp_device(vec![ModbusRuleSpec {
            pattern: r"\*IDN\?".into(),
            response: Some("VXGATE,oven,0,1".into()),
            ..Default::default()
        }]);
        // No slave is listening anywhere; a static rule must still answer.
        let adapter = ModbusTcpAdapter::new(device).unwrap();
        adapter.write(b"*IDN?\n").await.unwrap();

        let payload = adapter.read(64, DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(payload.data, b"VXGATE,oven,0,1\n");
        assert_eq!(payload.reason, vxgate_core::reason::END);
    }

    #[tokio::test]
    async fn test_unmapped_command_is_rejected() {
        let device = tcp_device(vec![ModbusRuleSpec {
            pattern: r"MEAS:TEMP\?".into(),
            action: Some(ModbusOp::ReadHoldingRegisters),
            address: Some(100),
            count: Some(2),
            data_type: Some(DataType::Float32Be),
            ..Default::default()
        }]);
        let adapter = ModbusTcpAdapter::new(device).unwrap();
        let err = adapter.write(b"BOGUS?\n").await.unwrap_err();
        assert!(matches!(err, AdapterError::Mapping(_)));
    }

    #[test]
    fn test_wrong_transport_kind_is_config_error() {
        let mut device = (*tcp_device(vec![ModbusRuleSpec {
            pattern: "x".into(),
            response: Some("y".into()),
            ..Default::default()
        }]))
        .clone();
        device.transport = TransportParams::Loopback;
        assert!(matches!(
            ModbusTcpAdapter::new(Arc::new(device)),
            Err(AdapterError::Config { .. })
        ));
    }
}
