// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-modbus
//!
//! MODBUS backends for VXGATE in all three framings:
//!
//! - **pdu**: framing-independent request construction and response parsing
//! - **tcp**: MBAP client (transaction ids, header validation)
//! - **rtu**: binary ADU with CRC-16 and character-time framing
//! - **ascii**: hex ADU with LRC and `:`/CRLF delimiters
//! - **adapter**: the gateway-facing adapters driving the mapping engine

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod ascii;
pub mod pdu;
pub mod rtu;
pub mod tcp;

pub use adapter::{ModbusSerialAdapter, ModbusTcpAdapter, SerialFraming};
pub use pdu::{build_request, parse_response, ResponseValue, MAX_PDU_SIZE};
pub use tcp::MbapClient;
