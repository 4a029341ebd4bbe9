// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-core
//!
//! Core abstractions for the VXGATE VXI-11 instrument gateway.
//!
//! This crate provides everything the transport-facing layers build on:
//!
//! - **Types**: device definitions, transport parameters, terminations
//! - **Error**: unified hierarchy with VXI-11 error-code classification
//! - **Adapter**: the uniform backend contract and factory trait
//! - **Mapping**: the command mapping engine and register codec
//! - **Link**: link identifiers, per-link state, output staging
//! - **Resource**: exclusive device locks with FIFO waiters
//! - **Serial**: shared serial-bus arbitration for multi-drop wiring
//! - **Engine**: the gateway engine driven by the RPC façade

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod engine;
pub mod error;
pub mod link;
pub mod mapping;
pub mod resource;
pub mod serial;
pub mod types;

pub use adapter::{reason, AdapterFactory, InstrumentAdapter, ReadPayload};
pub use engine::{CreatedLink, DeviceMap, GatewayEngine, DEFAULT_MAX_RECV_SIZE};
pub use error::{
    AdapterError, GatewayError, GatewayResult, LinkError, LockError, MappingError, Vxi11ErrorCode,
};
pub use link::{Link, LinkRegistry};
pub use mapping::{
    decode_registers, encode_value, DataType, GenericExchange, GenericRule, GenericRuleSet,
    GenericRuleSpec, ModbusAction, ModbusOp, ModbusRuleSet, ModbusRuleSpec, ScalarValue,
    Translation,
};
pub use resource::ResourceManager;
pub use serial::{SerialBus, SerialBusArbiter, SerialTransaction};
pub use types::{
    parse_termination, DeviceConfig, DeviceRules, GenericTransport, ParityMode, SerialSettings,
    StopBitsMode, TcpEndpoint, TransportKind, TransportParams, UsbSelector, DEFAULT_IO_TIMEOUT,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
