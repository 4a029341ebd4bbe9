// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-config
//!
//! YAML configuration for VXGATE: the schema (`server` / `devices` /
//! `mappings`), strict validation with unknown-key rejection, embedded-
//! mapping canonicalization, and compilation into the immutable device
//! snapshot the gateway engine runs on.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{default_config_paths, ConfigLoader};
pub use schema::{
    build_device, DeviceSpec, GatewayConfig, GuiConfig, PortSpec, RuleParams, RuleSpec,
    ServerConfig, UsbId, DEFAULT_SERVER_PORT,
};
