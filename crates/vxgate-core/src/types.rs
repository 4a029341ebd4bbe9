// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data types shared across the gateway.
//!
//! A [`DeviceConfig`] is the validated, immutable description of one logical
//! instrument. It is produced by the configuration layer and consumed by the
//! adapter factory and the gateway engine. Devices pin their config for the
//! lifetime of a link, so these types never mutate after load.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mapping::{GenericRuleSet, ModbusRuleSet};

/// Default I/O timeout applied when the configuration does not set one.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Default line termination for SCPI-style adapters.
pub const DEFAULT_TERMINATION: &[u8] = b"\n";

// =============================================================================
// TransportKind
// =============================================================================

/// The backend transport family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// SCPI over a TCP socket.
    #[serde(rename = "scpi-tcp")]
    ScpiTcp,
    /// SCPI over a serial port.
    #[serde(rename = "scpi-serial")]
    ScpiSerial,
    /// MODBUS with MBAP framing over TCP.
    #[serde(rename = "modbus-tcp")]
    ModbusTcp,
    /// MODBUS RTU over a serial port.
    #[serde(rename = "modbus-rtu")]
    ModbusRtu,
    /// MODBUS ASCII over a serial port.
    #[serde(rename = "modbus-ascii")]
    ModbusAscii,
    /// USB Test & Measurement Class device.
    #[serde(rename = "usbtmc")]
    Usbtmc,
    /// In-process echo device for tests.
    #[serde(rename = "loopback")]
    Loopback,
    /// Regex-template adapter for ad-hoc text protocols.
    #[serde(rename = "generic-regex")]
    GenericRegex,
}

impl TransportKind {
    /// Whether devices of this kind take the exclusive VXI-11 lock by default.
    ///
    /// Serial and USB endpoints are single-user; plain TCP backends allow
    /// concurrent links unless the configuration overrides this.
    pub fn default_requires_lock(self) -> bool {
        match self {
            Self::ScpiSerial | Self::ModbusRtu | Self::ModbusAscii | Self::Usbtmc => true,
            Self::ScpiTcp | Self::ModbusTcp | Self::Loopback => false,
            Self::GenericRegex => false,
        }
    }

    /// Whether this kind runs over a shared physical serial bus.
    pub fn is_serial(self) -> bool {
        matches!(self, Self::ScpiSerial | Self::ModbusRtu | Self::ModbusAscii)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ScpiTcp => "scpi-tcp",
            Self::ScpiSerial => "scpi-serial",
            Self::ModbusTcp => "modbus-tcp",
            Self::ModbusRtu => "modbus-rtu",
            Self::ModbusAscii => "modbus-ascii",
            Self::Usbtmc => "usbtmc",
            Self::Loopback => "loopback",
            Self::GenericRegex => "generic-regex",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Serial line settings
// =============================================================================

/// Parity mode for serial lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParityMode {
    /// No parity bit.
    #[serde(rename = "N", alias = "none")]
    None,
    /// Even parity.
    #[serde(rename = "E", alias = "even")]
    Even,
    /// Odd parity.
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

impl Default for ParityMode {
    fn default() -> Self {
        Self::None
    }
}

/// Stop bit count for serial lines.
///
/// Configured as the number 1 or 2 (a quoted string is also accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopBitsMode {
    /// One stop bit.
    One,
    /// Two stop bits.
    Two,
}

impl Default for StopBitsMode {
    fn default() -> Self {
        Self::One
    }
}

impl Serialize for StopBitsMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::One => 1,
            Self::Two => 2,
        })
    }
}

impl<'de> Deserialize<'de> for StopBitsMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = StopBitsMode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "1 or 2 stop bits")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<StopBitsMode, E> {
                match v {
                    1 => Ok(StopBitsMode::One),
                    2 => Ok(StopBitsMode::Two),
                    other => Err(E::custom(format!("stop bits must be 1 or 2, got {}", other))),
                }
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<StopBitsMode, E> {
                self.visit_u64(v.try_into().map_err(|_| {
                    E::custom(format!("stop bits must be 1 or 2, got {}", v))
                })?)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<StopBitsMode, E> {
                match v {
                    "1" => Ok(StopBitsMode::One),
                    "2" => Ok(StopBitsMode::Two),
                    other => Err(E::custom(format!("stop bits must be 1 or 2, got {:?}", other))),
                }
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// Line settings for one physical serial port.
///
/// Two devices sharing a port must agree on every field; the serial arbiter
/// rejects conflicting settings at attach time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialSettings {
    /// Platform path of the port (e.g. `/dev/ttyS0`).
    pub path: String,
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Data bits per character (5-8).
    pub data_bits: u8,
    /// Parity mode.
    pub parity: ParityMode,
    /// Stop bits.
    pub stop_bits: StopBitsMode,
}

impl SerialSettings {
    /// Bits on the wire per transmitted character, including start, parity
    /// and stop bits. Used for RTU inter-frame silence calculations.
    pub fn bits_per_char(&self) -> u32 {
        let parity = if self.parity == ParityMode::None { 0 } else { 1 };
        let stop = match self.stop_bits {
            StopBitsMode::One => 1,
            StopBitsMode::Two => 2,
        };
        1 + u32::from(self.data_bits) + parity + stop
    }

    /// Duration of one character time at the configured baud rate.
    pub fn char_time(&self) -> Duration {
        let micros = (self.bits_per_char() as u64 * 1_000_000) / u64::from(self.baud_rate.max(1));
        Duration::from_micros(micros.max(1))
    }
}

// =============================================================================
// Transport parameters
// =============================================================================

/// TCP endpoint parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl TcpEndpoint {
    /// Returns the `host:port` form used for connecting and lock derivation.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// USB device selection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbSelector {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Optional serial-number string to disambiguate identical devices.
    pub serial_number: Option<String>,
}

/// Transport used by a generic-regex device.
#[derive(Debug, Clone)]
pub enum GenericTransport {
    /// Line- or prompt-framed text over TCP.
    Tcp(TcpEndpoint),
    /// Text over a serial port.
    Serial(SerialSettings),
}

/// Per-kind transport parameters for a device.
#[derive(Debug, Clone)]
pub enum TransportParams {
    /// SCPI over TCP.
    ScpiTcp(TcpEndpoint),
    /// SCPI over serial.
    ScpiSerial(SerialSettings),
    /// MODBUS TCP.
    ModbusTcp {
        /// Slave endpoint.
        endpoint: TcpEndpoint,
        /// MODBUS unit identifier (1..=247).
        unit_id: u8,
    },
    /// MODBUS RTU on a serial bus.
    ModbusRtu {
        /// Bus line settings.
        serial: SerialSettings,
        /// MODBUS unit identifier (1..=247).
        unit_id: u8,
    },
    /// MODBUS ASCII on a serial bus.
    ModbusAscii {
        /// Bus line settings.
        serial: SerialSettings,
        /// MODBUS unit identifier (1..=247).
        unit_id: u8,
    },
    /// USBTMC instrument.
    Usbtmc(UsbSelector),
    /// Loopback echo device.
    Loopback,
    /// Generic regex-template device.
    Generic(GenericTransport),
}

// =============================================================================
// Termination
// =============================================================================

/// Parses a configured termination string into raw bytes.
///
/// Accepts the symbolic forms `CR`, `LF` and `CRLF` (case-insensitive), the
/// escape sequences `\n`, `\r`, `\t` and `\0`, and any literal string.
/// Empty input means "no termination".
pub fn parse_termination(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        return None;
    }
    match value.to_ascii_uppercase().as_str() {
        "CR" => return Some(b"\r".to_vec()),
        "LF" => return Some(b"\n".to_vec()),
        "CRLF" => return Some(b"\r\n".to_vec()),
        _ => {}
    }

    let mut out = Vec::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('r') => out.push(b'\r'),
                Some('t') => out.push(b'\t'),
                Some('0') => out.push(0),
                Some('\\') => out.push(b'\\'),
                Some(other) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => out.push(b'\\'),
            }
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    Some(out)
}

// =============================================================================
// DeviceConfig
// =============================================================================

/// Compiled mapping rules attached to a device, if any.
#[derive(Debug, Clone, Default)]
pub enum DeviceRules {
    /// The device has no mapping rules (pass-through transports).
    #[default]
    None,
    /// MODBUS command mapping rules.
    Modbus(Arc<ModbusRuleSet>),
    /// Generic regex-template rules.
    Generic(Arc<GenericRuleSet>),
}

/// The validated, immutable definition of one logical instrument.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Unique logical name clients address via CREATE_LINK.
    pub name: String,
    /// Backend transport family.
    pub kind: TransportKind,
    /// Transport parameters for this kind.
    pub transport: TransportParams,
    /// Whether VXI-11 locking gates access to the hardware.
    pub requires_lock: bool,
    /// Default I/O deadline when the RPC request does not supply one.
    pub io_timeout: Duration,
    /// Bytes appended to outgoing writes (SCPI-style adapters).
    pub write_termination: Option<Vec<u8>>,
    /// Bytes that terminate an incoming response.
    pub read_termination: Option<Vec<u8>>,
    /// Compiled mapping rules.
    pub rules: DeviceRules,
}

impl DeviceConfig {
    /// Derives the physical-device identifier used as the lock-table key.
    ///
    /// Two logical devices share a lock entry only when they address the same
    /// exclusive physical resource. Multi-drop serial MODBUS devices get
    /// distinct keys (per unit id); the bus itself is serialized by the
    /// arbiter, not the lock.
    pub fn physical_id(&self) -> String {
        match &self.transport {
            TransportParams::ScpiTcp(ep) => format!("tcp:{}", ep.address()),
            TransportParams::ScpiSerial(s) => format!("serial:{}", s.path),
            TransportParams::ModbusTcp { endpoint, unit_id } => {
                format!("tcp:{}#{}", endpoint.address(), unit_id)
            }
            TransportParams::ModbusRtu { serial, unit_id }
            | TransportParams::ModbusAscii { serial, unit_id } => {
                format!("serial:{}#{}", serial.path, unit_id)
            }
            TransportParams::Usbtmc(sel) => match &sel.serial_number {
                Some(sn) => format!("usb:{:04x}:{:04x}:{}", sel.vendor_id, sel.product_id, sn),
                None => format!("usb:{:04x}:{:04x}", sel.vendor_id, sel.product_id),
            },
            TransportParams::Loopback => format!("loopback:{}", self.name),
            TransportParams::Generic(GenericTransport::Tcp(ep)) => {
                format!("tcp:{}", ep.address())
            }
            TransportParams::Generic(GenericTransport::Serial(s)) => {
                format!("serial:{}", s.path)
            }
        }
    }

    /// Returns the serial line settings if this device lives on a serial bus.
    pub fn serial_settings(&self) -> Option<&SerialSettings> {
        match &self.transport {
            TransportParams::ScpiSerial(s) => Some(s),
            TransportParams::ModbusRtu { serial, .. }
            | TransportParams::ModbusAscii { serial, .. } => Some(serial),
            TransportParams::Generic(GenericTransport::Serial(s)) => Some(s),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requires_lock() {
        assert!(TransportKind::Usbtmc.default_requires_lock());
        assert!(TransportKind::ModbusRtu.default_requires_lock());
        assert!(TransportKind::ModbusAscii.default_requires_lock());
        assert!(TransportKind::ScpiSerial.default_requires_lock());
        assert!(!TransportKind::ScpiTcp.default_requires_lock());
        assert!(!TransportKind::ModbusTcp.default_requires_lock());
        assert!(!TransportKind::Loopback.default_requires_lock());
    }

    #[test]
    fn test_parse_termination_symbolic() {
        assert_eq!(parse_termination("CRLF"), Some(b"\r\n".to_vec()));
        assert_eq!(parse_termination("cr"), Some(b"\r".to_vec()));
        assert_eq!(parse_termination("LF"), Some(b"\n".to_vec()));
        assert_eq!(parse_termination(""), None);
    }

    #[test]
    fn test_parse_termination_escapes() {
        assert_eq!(parse_termination("\\r\\n"), Some(b"\r\n".to_vec()));
        assert_eq!(parse_termination("\\n"), Some(b"\n".to_vec()));
        assert_eq!(parse_termination(">"), Some(b">".to_vec()));
    }

    #[test]
    fn test_char_time_at_9600_8n1() {
        let settings = SerialSettings {
            path: "/dev/ttyS0".into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityMode::None,
            stop_bits: StopBitsMode::One,
        };
        // 10 bits per char at 9600 baud is ~1042us.
        assert_eq!(settings.bits_per_char(), 10);
        let t = settings.char_time();
        assert!(t >= Duration::from_micros(1000) && t <= Duration::from_micros(1100));
    }

    #[test]
    fn test_physical_id_shares_serial_path_but_not_unit() {
        let serial = SerialSettings {
            path: "/dev/ttyS0".into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityMode::None,
            stop_bits: StopBitsMode::One,
        };
        let a = DeviceConfig {
            name: "a".into(),
            kind: TransportKind::ModbusRtu,
            transport: TransportParams::ModbusRtu {
                serial: serial.clone(),
                unit_id: 1,
            },
            requires_lock: true,
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::None,
        };
        let b = DeviceConfig {
            name: "b".into(),
            transport: TransportParams::ModbusRtu {
                serial,
                unit_id: 2,
            },
            ..a.clone()
        };
        assert_ne!(a.physical_id(), b.physical_id());
        assert_eq!(a.serial_settings().unwrap().path, "/dev/ttyS0");
    }
}
