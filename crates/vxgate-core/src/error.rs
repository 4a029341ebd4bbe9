// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Unified error hierarchy for VXGATE.
//!
//! Every error that can reach a VXI-11 client classifies itself into the
//! protocol's numeric error code via [`Vxi11ErrorCode`]. The hierarchy is
//! layered the same way the gateway is:
//!
//! ```text
//! GatewayError (root)
//! ├── AdapterError   - Backend transport and protocol faults
//! ├── MappingError   - Command mapping and register codec failures
//! ├── LinkError      - Link registry failures
//! └── LockError      - Device lock arbitration failures
//! ```

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// VXI-11 Error Codes
// =============================================================================

/// VXI-11 `Device_ErrorCode` values surfaced in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Vxi11ErrorCode {
    /// Operation completed.
    NoError = 0,
    /// Malformed parameters or an unparseable command.
    SyntaxError = 1,
    /// Device not accessible (unknown name, adapter open failure).
    DeviceNotAccessible = 3,
    /// The link identifier does not exist.
    InvalidLinkIdentifier = 4,
    /// Parameter out of range (request size, lock flags, mapping params).
    ParameterError = 5,
    /// Channel not established.
    ChannelNotEstablished = 6,
    /// Operation not supported (no matching rule, unsupported procedure).
    OperationNotSupported = 8,
    /// Out of resources (link table full).
    OutOfResources = 9,
    /// Device locked by another link.
    DeviceLockedByAnotherLink = 11,
    /// This link holds no lock.
    NoLockHeldByThisLink = 12,
    /// I/O timeout.
    IoTimeout = 15,
    /// I/O error (transport failure, checksum mismatch, MODBUS exception).
    IoError = 17,
    /// Operation aborted.
    Abort = 23,
}

impl Vxi11ErrorCode {
    /// Returns the numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// AdapterError
// =============================================================================

/// Faults raised by backend adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The physical resource is not open.
    #[error("Device {device:?} is not connected")]
    NotConnected {
        /// Logical device name.
        device: String,
    },

    /// Opening the physical resource failed.
    #[error("Failed to open {target}: {message}")]
    ConnectFailed {
        /// Endpoint description (host:port, serial path, VID/PID).
        target: String,
        /// Underlying failure.
        message: String,
    },

    /// The transport failed mid-exchange.
    #[error("I/O error on {target}: {message}")]
    Io {
        /// Endpoint description.
        target: String,
        /// Underlying failure.
        message: String,
    },

    /// A framing or checksum violation (CRC-16, LRC, MBAP).
    #[error("Frame error: {message}")]
    Frame {
        /// What was malformed.
        message: String,
    },

    /// The slave answered with a MODBUS exception PDU.
    #[error("MODBUS exception: function=0x{function:02X} code=0x{code:02X}")]
    ModbusException {
        /// Function code with the high bit set as received.
        function: u8,
        /// Exception code byte.
        code: u8,
    },

    /// The operation did not complete within its deadline.
    #[error("Operation timed out after {timeout:?}")]
    Timeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The command could not be interpreted by this adapter.
    #[error("Invalid command: {message}")]
    InvalidCommand {
        /// Why the command was rejected.
        message: String,
    },

    /// The adapter cannot perform the requested operation.
    #[error("Operation not supported: {message}")]
    Unsupported {
        /// The unsupported operation.
        message: String,
    },

    /// Invalid adapter configuration detected at build time.
    #[error("Adapter configuration error: {message}")]
    Config {
        /// The offending setting.
        message: String,
    },

    /// Command mapping failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl AdapterError {
    /// Shorthand for [`AdapterError::NotConnected`].
    pub fn not_connected(device: impl Into<String>) -> Self {
        Self::NotConnected {
            device: device.into(),
        }
    }

    /// Shorthand for [`AdapterError::ConnectFailed`].
    pub fn connect_failed(target: impl Into<String>, message: impl ToString) -> Self {
        Self::ConnectFailed {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for [`AdapterError::Io`].
    pub fn io(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Io {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for [`AdapterError::Frame`].
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Shorthand for [`AdapterError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for [`AdapterError::InvalidCommand`].
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Classifies this fault into a VXI-11 error code.
    pub fn error_code(&self) -> Vxi11ErrorCode {
        match self {
            Self::NotConnected { .. } => Vxi11ErrorCode::IoError,
            Self::ConnectFailed { .. } => Vxi11ErrorCode::DeviceNotAccessible,
            Self::Io { .. } => Vxi11ErrorCode::IoError,
            Self::Frame { .. } => Vxi11ErrorCode::IoError,
            Self::ModbusException { .. } => Vxi11ErrorCode::IoError,
            Self::Timeout { .. } => Vxi11ErrorCode::IoTimeout,
            Self::InvalidCommand { .. } => Vxi11ErrorCode::SyntaxError,
            Self::Unsupported { .. } => Vxi11ErrorCode::OperationNotSupported,
            Self::Config { .. } => Vxi11ErrorCode::DeviceNotAccessible,
            Self::Mapping(e) => e.error_code(),
        }
    }

    /// Returns a one-line diagnostic suitable for staging in the link
    /// output buffer, if this error carries one.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            Self::ModbusException { function, code } => Some(format!(
                "ERROR: MODBUS exception function=0x{:02X} code=0x{:02X}",
                function, code
            )),
            _ => None,
        }
    }
}

// =============================================================================
// MappingError
// =============================================================================

/// Failures in the command mapping engine.
#[derive(Debug, Error)]
pub enum MappingError {
    /// No rule pattern matched the incoming command.
    #[error("No mapping rule matched command {command:?}")]
    NoRuleMatched {
        /// The rejected command.
        command: String,
    },

    /// A rule pattern failed to compile.
    #[error("Rule #{index} has an invalid pattern: {message}")]
    InvalidPattern {
        /// Rule position in the device's list.
        index: usize,
        /// regex compile error.
        message: String,
    },

    /// A template referenced a capture group the pattern does not define.
    #[error("Rule #{index} {field} references group ${group} not defined by the pattern")]
    UnknownCaptureGroup {
        /// Rule position in the device's list.
        index: usize,
        /// Which template field held the reference.
        field: &'static str,
        /// The missing group.
        group: String,
    },

    /// A rule is structurally incomplete or carries a bad parameter.
    #[error("Rule #{index} is invalid: {message}")]
    InvalidRule {
        /// Rule position in the device's list.
        index: usize,
        /// What is wrong.
        message: String,
    },

    /// A substituted value could not be coerced to the rule's data type.
    #[error("Cannot encode value {value:?} as {data_type}: {message}")]
    ValueEncoding {
        /// The offending value after substitution.
        value: String,
        /// Target register data type.
        data_type: String,
        /// Why coercion failed.
        message: String,
    },

    /// The response payload does not decode as the declared data type.
    #[error("Cannot decode {count} register(s) as {data_type}")]
    ValueDecoding {
        /// Registers available.
        count: usize,
        /// Declared data type.
        data_type: String,
    },
}

impl MappingError {
    /// Classifies this fault into a VXI-11 error code.
    pub fn error_code(&self) -> Vxi11ErrorCode {
        match self {
            Self::NoRuleMatched { .. } => Vxi11ErrorCode::OperationNotSupported,
            Self::InvalidPattern { .. }
            | Self::UnknownCaptureGroup { .. }
            | Self::InvalidRule { .. } => Vxi11ErrorCode::ParameterError,
            Self::ValueEncoding { .. } => Vxi11ErrorCode::ParameterError,
            Self::ValueDecoding { .. } => Vxi11ErrorCode::IoError,
        }
    }
}

// =============================================================================
// LinkError
// =============================================================================

/// Failures in the link registry.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link identifier is unknown.
    #[error("Link {lid} does not exist")]
    NotFound {
        /// The unknown identifier.
        lid: u32,
    },

    /// The registry is at capacity.
    #[error("Link table is full ({capacity} links)")]
    TableFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The requested device name is not configured.
    #[error("Device {name:?} is not defined in the configuration")]
    UnknownDevice {
        /// The unresolved logical name.
        name: String,
    },
}

impl LinkError {
    /// Classifies this fault into a VXI-11 error code.
    pub fn error_code(&self) -> Vxi11ErrorCode {
        match self {
            Self::NotFound { .. } => Vxi11ErrorCode::InvalidLinkIdentifier,
            Self::TableFull { .. } => Vxi11ErrorCode::OutOfResources,
            Self::UnknownDevice { .. } => Vxi11ErrorCode::DeviceNotAccessible,
        }
    }
}

// =============================================================================
// LockError
// =============================================================================

/// Failures in device lock arbitration.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another link holds the lock and the deadline elapsed (or the caller
    /// declined to wait).
    #[error("Device {device:?} is locked by another link")]
    Locked {
        /// Physical device identifier.
        device: String,
    },

    /// The caller does not own the lock it tried to release.
    #[error("Link {lid} does not hold the lock for device {device:?}")]
    NotOwner {
        /// Physical device identifier.
        device: String,
        /// The presumptuous link.
        lid: u32,
    },
}

impl LockError {
    /// Classifies this fault into a VXI-11 error code.
    pub fn error_code(&self) -> Vxi11ErrorCode {
        match self {
            Self::Locked { .. } => Vxi11ErrorCode::DeviceLockedByAnotherLink,
            Self::NotOwner { .. } => Vxi11ErrorCode::NoLockHeldByThisLink,
        }
    }
}

// =============================================================================
// GatewayError - Root Error Type
// =============================================================================

/// The root error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Backend adapter fault.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Command mapping fault.
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Link registry fault.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Lock arbitration fault.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl GatewayError {
    /// Classifies this error into the VXI-11 code reported to the client.
    pub fn error_code(&self) -> Vxi11ErrorCode {
        match self {
            Self::Adapter(e) => e.error_code(),
            Self::Mapping(e) => e.error_code(),
            Self::Link(e) => e.error_code(),
            Self::Lock(e) => e.error_code(),
        }
    }

    /// Returns the error type as a string for logging and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Adapter(_) => "adapter",
            Self::Mapping(_) => "mapping",
            Self::Link(_) => "link",
            Self::Lock(_) => "lock",
        }
    }
}

/// Convenience alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_codes() {
        assert_eq!(
            AdapterError::connect_failed("10.0.0.1:502", "refused").error_code(),
            Vxi11ErrorCode::DeviceNotAccessible
        );
        assert_eq!(
            AdapterError::Timeout {
                timeout: Duration::from_millis(50)
            }
            .error_code(),
            Vxi11ErrorCode::IoTimeout
        );
        assert_eq!(
            AdapterError::ModbusException {
                function: 0x83,
                code: 0x02
            }
            .error_code(),
            Vxi11ErrorCode::IoError
        );
    }

    #[test]
    fn test_mapping_error_codes() {
        let err = MappingError::NoRuleMatched {
            command: "MEAS:VOLT?".into(),
        };
        assert_eq!(err.error_code(), Vxi11ErrorCode::OperationNotSupported);
    }

    #[test]
    fn test_lock_error_codes() {
        let locked = LockError::Locked {
            device: "/dev/ttyS0".into(),
        };
        assert_eq!(locked.error_code(), Vxi11ErrorCode::DeviceLockedByAnotherLink);

        let not_owner = LockError::NotOwner {
            device: "/dev/ttyS0".into(),
            lid: 7,
        };
        assert_eq!(not_owner.error_code(), Vxi11ErrorCode::NoLockHeldByThisLink);
    }

    #[test]
    fn test_root_error_propagates_code() {
        let err: GatewayError = LinkError::NotFound { lid: 42 }.into();
        assert_eq!(err.error_code(), Vxi11ErrorCode::InvalidLinkIdentifier);
        assert_eq!(err.error_type(), "link");
    }

    #[test]
    fn test_exception_diagnostic() {
        let err = AdapterError::ModbusException {
            function: 0x83,
            code: 0x02,
        };
        let diag = err.diagnostic().unwrap();
        assert!(diag.contains("0x83"));
        assert!(diag.contains("0x02"));
    }
}
