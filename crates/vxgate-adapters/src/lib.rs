// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-adapters
//!
//! The non-MODBUS backend adapters for VXGATE and the default factory that
//! assembles all of them:
//!
//! - **loopback**: echo device for tests
//! - **scpi_tcp**: line-terminated SCPI over TCP sockets
//! - **scpi_serial**: SCPI over serial lines via the bus arbiter
//! - **usbtmc**: USB Test & Measurement Class instruments
//! - **generic**: regex-template adapter for ad-hoc text protocols
//! - **factory**: `TransportKind` → adapter construction

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod factory;
pub mod generic;
pub mod loopback;
pub mod scpi_serial;
pub mod scpi_tcp;
pub mod usbtmc;

pub use factory::DefaultAdapterFactory;
pub use generic::GenericRegexAdapter;
pub use loopback::LoopbackAdapter;
pub use scpi_serial::ScpiSerialAdapter;
pub use scpi_tcp::ScpiTcpAdapter;
pub use usbtmc::UsbTmcAdapter;
