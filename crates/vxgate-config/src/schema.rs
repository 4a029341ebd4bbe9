// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration schema.
//!
//! Three top-level sections: `server` (the VXI-11 listener and management
//! GUI), `devices` (logical instrument definitions), and `mappings`
//! (command-translation rules per device). Every struct denies unknown keys
//! so a typo fails at load time instead of silently disappearing.
//!
//! ```yaml
//! server: { host: 0.0.0.0, port: 1024, portmapper_enabled: true }
//! devices:
//!   oven:
//!     type: modbus-tcp
//!     host: 10.0.0.5
//!     port: 502
//!     unit_id: 5
//! mappings:
//!   oven:
//!     - pattern: "MEAS:TEMP\\?"
//!       action: read_holding_registers
//!       params: { address: 100, count: 2, data_type: float32_be }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vxgate_core::mapping::{
    DataType, GenericRuleSet, GenericRuleSpec, ModbusOp, ModbusRuleSet, ModbusRuleSpec,
};
use vxgate_core::types::{
    parse_termination, DeviceConfig, DeviceRules, GenericTransport, ParityMode, SerialSettings,
    StopBitsMode, TcpEndpoint, TransportKind, TransportParams, UsbSelector, DEFAULT_IO_TIMEOUT,
};

use crate::error::{ConfigError, ConfigResult};

// =============================================================================
// Defaults
// =============================================================================

/// Default VXI-11 listener port.
pub const DEFAULT_SERVER_PORT: u16 = 1024;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_gui_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gui_port() -> u16 {
    8080
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_unit_id() -> u8 {
    1
}

// =============================================================================
// Top level
// =============================================================================

/// The root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// VXI-11 listener and management settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logical instruments by name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSpec>,

    /// Command-mapping rules keyed by device name.
    #[serde(default)]
    pub mappings: BTreeMap<String, Vec<RuleSpec>>,
}

/// VXI-11 listener and management-server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listener bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener TCP port; 0 requests an OS-assigned port.
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Whether to run the embedded portmapper on port 111.
    #[serde(default)]
    pub portmapper_enabled: bool,

    /// Management GUI / REST settings.
    #[serde(default)]
    pub gui: GuiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            portmapper_enabled: false,
            gui: GuiConfig::default(),
        }
    }
}

/// Management GUI / REST server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuiConfig {
    /// Whether the management server runs at all.
    #[serde(default)]
    pub enabled: bool,

    /// Bind host.
    #[serde(default = "default_gui_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_gui_port")]
    pub port: u16,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_gui_host(),
            port: default_gui_port(),
        }
    }
}

// =============================================================================
// Devices
// =============================================================================

/// The `port` key doubles as a TCP port (number) and a serial path (string),
/// depending on the device type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortSpec {
    /// TCP port for network transports.
    Number(u16),
    /// Serial device path for serial transports.
    Path(String),
}

/// A USB id given as a number or a `0x`-prefixed hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId(pub u16);

impl Serialize for UsbId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for UsbId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = UsbId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a USB id as an integer or hex string like \"0x0957\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<UsbId, E> {
                u16::try_from(v)
                    .map(UsbId)
                    .map_err(|_| E::custom(format!("USB id {} out of 16-bit range", v)))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<UsbId, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(|v| u16::try_from(v).ok())
                    .map(UsbId)
                    .ok_or_else(|| E::custom(format!("USB id {} out of 16-bit range", v)))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<UsbId, E> {
                let trimmed = v.trim_start_matches("0x").trim_start_matches("0X");
                u16::from_str_radix(trimmed, 16)
                    .map(UsbId)
                    .map_err(|_| E::custom(format!("invalid USB id {:?}", v)))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// One logical instrument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    /// Backend transport kind.
    #[serde(rename = "type")]
    pub kind: TransportKind,

    /// Host for network transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// TCP port or serial device path, depending on the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,

    /// Serial baud rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baudrate: Option<u32>,

    /// Serial data bits (5-8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytesize: Option<u8>,

    /// Serial parity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity: Option<ParityMode>,

    /// Serial stop bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopbits: Option<StopBitsMode>,

    /// USB vendor id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<UsbId>,

    /// USB product id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<UsbId>,

    /// USB serial-number string for disambiguation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// MODBUS unit identifier (1..=247).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,

    /// Wire transport for generic-regex devices (`tcp` or `serial`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    /// Overrides the per-kind exclusive-lock default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_lock: Option<bool>,

    /// I/O deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout: Option<f64>,

    /// Bytes appended to outgoing writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_termination: Option<String>,

    /// Bytes terminating incoming responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_termination: Option<String>,

    /// Rules embedded in the device body; canonicalized into the top-level
    /// `mappings` section at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Vec<RuleSpec>>,
}

// =============================================================================
// Mapping rules
// =============================================================================

/// MODBUS action parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleParams {
    /// Starting register/coil address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,

    /// Register/coil count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,

    /// Register encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,

    /// Write value: literal or `$N` capture reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_yaml::Value>,

    /// Multiplier applied to a numeric write value before encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,

    /// Divisor applied to the decoded read value before formatting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_scale: Option<f64>,
}

/// One mapping rule. MODBUS devices use `action`/`params` (or a static
/// `response`); generic-regex devices use the template fields instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Command-matching regex.
    pub pattern: String,

    /// MODBUS operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ModbusOp>,

    /// MODBUS action parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RuleParams>,

    /// Static reply with capture substitution; bypasses device I/O.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Wire request template (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_format: Option<String>,

    /// Whether a wire response follows the request (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expects_response: Option<bool>,

    /// Regex the wire response must fullmatch (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_regex: Option<String>,

    /// Reply template rendered from the response match (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,

    /// Zero-pad width for scaled request numbers (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_width: Option<usize>,

    /// Multiplier for request numbers (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,

    /// Divisor for response numbers (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_scale: Option<f64>,

    /// Response terminator or device prompt (generic-regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminator: Option<String>,
}

fn value_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Compilation into runtime definitions
// =============================================================================

impl GatewayConfig {
    /// Moves device-embedded mapping lists into the top-level section.
    ///
    /// A device with rules in both places is ambiguous and rejected rather
    /// than merged.
    pub fn canonicalize(&mut self) -> ConfigResult<()> {
        for (name, spec) in &mut self.devices {
            if let Some(rules) = spec.mappings.take() {
                if self.mappings.contains_key(name) {
                    return Err(ConfigError::AmbiguousMappings {
                        device: name.clone(),
                    });
                }
                self.mappings.insert(name.clone(), rules);
            }
        }
        Ok(())
    }

    /// Validates the whole document and compiles every mapping rule.
    pub fn validate(&self) -> ConfigResult<()> {
        for device in self.mappings.keys() {
            if !self.devices.contains_key(device) {
                return Err(ConfigError::UnknownMappingDevice {
                    device: device.clone(),
                });
            }
        }
        for (name, spec) in &self.devices {
            let rules = self.mappings.get(name).cloned().unwrap_or_default();
            build_device(name, spec, &rules)?;
        }
        Ok(())
    }

    /// Builds the immutable device snapshot the engine runs on.
    pub fn compile(&self) -> ConfigResult<vxgate_core::DeviceMap> {
        let mut map = vxgate_core::DeviceMap::new();
        for (name, spec) in &self.devices {
            let rules = self.mappings.get(name).cloned().unwrap_or_default();
            let device = build_device(name, spec, &rules)?;
            map.insert(name.clone(), Arc::new(device));
        }
        Ok(map)
    }
}

fn require<'a, T>(field: &str, name: &str, value: &'a Option<T>) -> ConfigResult<&'a T> {
    value.as_ref().ok_or_else(|| {
        ConfigError::validation(
            format!("devices.{}.{}", name, field),
            "required for this device type",
        )
    })
}

fn tcp_endpoint(name: &str, spec: &DeviceSpec) -> ConfigResult<TcpEndpoint> {
    let host = require("host", name, &spec.host)?.clone();
    let port = match require("port", name, &spec.port)? {
        PortSpec::Number(port) => *port,
        PortSpec::Path(_) => {
            return Err(ConfigError::validation(
                format!("devices.{}.port", name),
                "expected a TCP port number",
            ))
        }
    };
    Ok(TcpEndpoint { host, port })
}

fn serial_settings(name: &str, spec: &DeviceSpec) -> ConfigResult<SerialSettings> {
    let path = match require("port", name, &spec.port)? {
        PortSpec::Path(path) => path.clone(),
        PortSpec::Number(_) => {
            return Err(ConfigError::validation(
                format!("devices.{}.port", name),
                "expected a serial device path",
            ))
        }
    };
    let data_bits = spec.bytesize.unwrap_or_else(default_bytesize);
    if !(5..=8).contains(&data_bits) {
        return Err(ConfigError::validation(
            format!("devices.{}.bytesize", name),
            "data bits must be between 5 and 8",
        ));
    }
    Ok(SerialSettings {
        path,
        baud_rate: spec.baudrate.unwrap_or_else(default_baudrate),
        data_bits,
        parity: spec.parity.unwrap_or_default(),
        stop_bits: spec.stopbits.unwrap_or_default(),
    })
}

fn unit_id(name: &str, spec: &DeviceSpec) -> ConfigResult<u8> {
    let unit = spec.unit_id.unwrap_or_else(default_unit_id);
    if !(1..=247).contains(&unit) {
        return Err(ConfigError::validation(
            format!("devices.{}.unit_id", name),
            "unit_id must be in 1..=247",
        ));
    }
    Ok(unit)
}

fn modbus_rules(name: &str, rules: &[RuleSpec]) -> ConfigResult<Arc<ModbusRuleSet>> {
    let specs: Vec<ModbusRuleSpec> = rules
        .iter()
        .map(|rule| {
            let params = rule.params.clone().unwrap_or_default();
            ModbusRuleSpec {
                pattern: rule.pattern.clone(),
                action: rule.action,
                address: params.address,
                count: params.count,
                data_type: params.data_type,
                value: params.value.as_ref().and_then(value_to_string),
                scale: params.scale.or(rule.scale),
                response_scale: params.response_scale.or(rule.response_scale),
                response: rule.response.clone(),
            }
        })
        .collect();
    ModbusRuleSet::compile(specs)
        .map(Arc::new)
        .map_err(|source| ConfigError::Mapping {
            device: name.to_string(),
            source,
        })
}

fn generic_rules(name: &str, rules: &[RuleSpec]) -> ConfigResult<Arc<GenericRuleSet>> {
    let specs: Vec<GenericRuleSpec> = rules
        .iter()
        .map(|rule| GenericRuleSpec {
            pattern: rule.pattern.clone(),
            request_format: rule.request_format.clone(),
            expects_response: rule.expects_response.unwrap_or(false),
            response_regex: rule.response_regex.clone(),
            response_format: rule.response_format.clone(),
            response: rule.response.clone(),
            payload_width: rule.payload_width,
            scale: rule.scale,
            response_scale: rule.response_scale,
            terminator: rule.terminator.clone(),
        })
        .collect();
    GenericRuleSet::compile(specs)
        .map(Arc::new)
        .map_err(|source| ConfigError::Mapping {
            device: name.to_string(),
            source,
        })
}

/// Builds one validated runtime device definition.
pub fn build_device(
    name: &str,
    spec: &DeviceSpec,
    rules: &[RuleSpec],
) -> ConfigResult<DeviceConfig> {
    let (transport, device_rules) = match spec.kind {
        TransportKind::ScpiTcp => (
            TransportParams::ScpiTcp(tcp_endpoint(name, spec)?),
            DeviceRules::None,
        ),
        TransportKind::ScpiSerial => (
            TransportParams::ScpiSerial(serial_settings(name, spec)?),
            DeviceRules::None,
        ),
        TransportKind::ModbusTcp => (
            TransportParams::ModbusTcp {
                endpoint: tcp_endpoint(name, spec)?,
                unit_id: unit_id(name, spec)?,
            },
            DeviceRules::Modbus(modbus_rules(name, rules)?),
        ),
        TransportKind::ModbusRtu => (
            TransportParams::ModbusRtu {
                serial: serial_settings(name, spec)?,
                unit_id: unit_id(name, spec)?,
            },
            DeviceRules::Modbus(modbus_rules(name, rules)?),
        ),
        TransportKind::ModbusAscii => (
            TransportParams::ModbusAscii {
                serial: serial_settings(name, spec)?,
                unit_id: unit_id(name, spec)?,
            },
            DeviceRules::Modbus(modbus_rules(name, rules)?),
        ),
        TransportKind::Usbtmc => (
            TransportParams::Usbtmc(UsbSelector {
                vendor_id: require("vendor_id", name, &spec.vendor_id)?.0,
                product_id: require("product_id", name, &spec.product_id)?.0,
                serial_number: spec.serial_number.clone(),
            }),
            DeviceRules::None,
        ),
        TransportKind::Loopback => (TransportParams::Loopback, DeviceRules::None),
        TransportKind::GenericRegex => {
            let transport = match spec.transport.as_deref().unwrap_or("tcp") {
                "tcp" => GenericTransport::Tcp(tcp_endpoint(name, spec)?),
                "serial" => GenericTransport::Serial(serial_settings(name, spec)?),
                other => {
                    return Err(ConfigError::validation(
                        format!("devices.{}.transport", name),
                        format!("unknown transport {:?}; expected tcp or serial", other),
                    ))
                }
            };
            (
                TransportParams::Generic(transport),
                DeviceRules::Generic(generic_rules(name, rules)?),
            )
        }
    };

    let io_timeout = match spec.io_timeout {
        Some(seconds) if seconds > 0.0 => Duration::from_secs_f64(seconds),
        Some(_) => {
            return Err(ConfigError::validation(
                format!("devices.{}.io_timeout", name),
                "io_timeout must be positive",
            ))
        }
        None => DEFAULT_IO_TIMEOUT,
    };

    Ok(DeviceConfig {
        name: name.to_string(),
        kind: spec.kind,
        transport,
        requires_lock: spec
            .requires_lock
            .unwrap_or_else(|| spec.kind.default_requires_lock()),
        io_timeout,
        write_termination: match &spec.write_termination {
            Some(text) => parse_termination(text),
            None => Some(b"\n".to_vec()),
        },
        read_termination: match &spec.read_termination {
            Some(text) => parse_termination(text),
            None => Some(b"\n".to_vec()),
        },
        rules: device_rules,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: 0.0.0.0
  port: 1024
  portmapper_enabled: true
devices:
  echo:
    type: loopback
  oven:
    type: modbus-tcp
    host: 10.0.0.5
    port: 502
    unit_id: 5
  bus-a:
    type: modbus-rtu
    port: /dev/ttyS0
    baudrate: 19200
    unit_id: 1
mappings:
  oven:
    - pattern: "MEAS:TEMP\\?"
      action: read_holding_registers
      params: { address: 100, count: 2, data_type: float32_be }
  bus-a:
    - pattern: "SET (\\d+)"
      action: write_single_register
      params: { address: 10, value: "$1" }
"#;

    #[test]
    fn test_parse_and_validate_sample() {
        let mut config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.canonicalize().unwrap();
        config.validate().unwrap();

        let map = config.compile().unwrap();
        assert_eq!(map.len(), 3);

        let oven = &map["oven"];
        assert_eq!(oven.kind, TransportKind::ModbusTcp);
        assert!(!oven.requires_lock);
        match &oven.transport {
            TransportParams::ModbusTcp { endpoint, unit_id } => {
                assert_eq!(endpoint.address(), "10.0.0.5:502");
                assert_eq!(*unit_id, 5);
            }
            other => panic!("unexpected transport: {:?}", other),
        }

        let bus = &map["bus-a"];
        assert!(bus.requires_lock);
        assert_eq!(
            bus.serial_settings().map(|s| s.baud_rate),
            Some(19200)
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let yaml = r#"
devices:
  echo:
    type: loopback
    bogus_key: 1
"#;
        assert!(serde_yaml::from_str::<GatewayConfig>(yaml).is_err());
    }

    #[test]
    fn test_mapping_for_unknown_device_is_rejected() {
        let yaml = r#"
devices:
  echo: { type: loopback }
mappings:
  ghost:
    - pattern: "X"
      response: "Y"
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMappingDevice { .. })
        ));
    }

    #[test]
    fn test_embedded_mappings_are_canonicalized() {
        let yaml = r#"
devices:
  oven:
    type: modbus-tcp
    host: h
    port: 502
    mappings:
      - pattern: "PING"
        response: "PONG"
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        assert!(config.mappings.contains_key("oven"));
        assert!(config.devices["oven"].mappings.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_ambiguous_mappings_are_rejected() {
        let yaml = r#"
devices:
  oven:
    type: modbus-tcp
    host: h
    port: 502
    mappings:
      - pattern: "A"
        response: "B"
mappings:
  oven:
    - pattern: "C"
      response: "D"
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.canonicalize(),
            Err(ConfigError::AmbiguousMappings { .. })
        ));
    }

    #[test]
    fn test_missing_capture_group_fails_at_load() {
        let yaml = r#"
devices:
  oven:
    type: modbus-tcp
    host: h
    port: 502
mappings:
  oven:
    - pattern: "SET (\\d+)"
      action: write_single_register
      params: { address: 1, value: "$2" }
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Mapping { .. })
        ));
    }

    #[test]
    fn test_unit_id_range_is_enforced() {
        let yaml = r#"
devices:
  oven:
    type: modbus-tcp
    host: h
    port: 502
    unit_id: 0
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_usb_id_accepts_hex_strings() {
        let yaml = r#"
devices:
  scope:
    type: usbtmc
    vendor_id: "0x0957"
    product_id: 0x1755
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        let map = config.compile().unwrap();
        match &map["scope"].transport {
            TransportParams::Usbtmc(sel) => {
                assert_eq!(sel.vendor_id, 0x0957);
                assert_eq!(sel.product_id, 0x1755);
            }
            other => panic!("unexpected transport: {:?}", other),
        }
        assert!(map["scope"].requires_lock);
    }

    #[test]
    fn test_serial_path_vs_tcp_port() {
        let yaml = r#"
devices:
  bad:
    type: scpi-tcp
    host: h
    port: /dev/ttyS0
"#;
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.canonicalize().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_yaml() {
        let mut config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.canonicalize().unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        let mut back: GatewayConfig = serde_yaml::from_str(&rendered).unwrap();
        back.canonicalize().unwrap();
        back.validate().unwrap();
        assert_eq!(back.devices.len(), config.devices.len());
    }
}
