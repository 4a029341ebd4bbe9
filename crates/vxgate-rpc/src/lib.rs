// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-rpc
//!
//! The ONC-RPC / VXI-11 wire layer of VXGATE:
//!
//! - **xdr**: RFC 4506 primitive codec
//! - **message**: RPC call/reply model with standard reject statuses
//! - **vxi11**: VXI-11 structures, program numbers, and flags
//! - **server**: record-marked TCP façade dispatching into the engine
//! - **portmap**: embedded portmapper answering GETPORT for the VXI-11 programs

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod message;
pub mod portmap;
pub mod server;
pub mod vxi11;
pub mod xdr;

pub use portmap::{PortmapHandle, PortmapServer, PMAP_PORT};
pub use server::{read_record, write_record, Vxi11Server};
pub use xdr::{XdrDecoder, XdrEncoder, XdrError};
