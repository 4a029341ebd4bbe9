// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared state for the management API.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use vxgate_config::{ConfigLoader, ConfigResult, GatewayConfig};
use vxgate_core::GatewayEngine;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The gateway engine (device snapshot, links, locks).
    pub engine: Arc<GatewayEngine>,
    /// Path of the configuration file reloads re-read.
    pub config_path: PathBuf,
    /// Loader used for validation, reload, and persistence.
    pub loader: ConfigLoader,
    /// The configuration document currently applied.
    pub config: Arc<RwLock<GatewayConfig>>,
}

impl AppState {
    /// Creates the state from an already-applied configuration.
    pub fn new(
        engine: Arc<GatewayEngine>,
        config_path: impl Into<PathBuf>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            engine,
            config_path: config_path.into(),
            loader: ConfigLoader::new(),
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Re-reads the configuration file and swaps the device snapshot.
    ///
    /// Existing links keep running on their pinned definitions; the VXI-11
    /// listener is untouched.
    pub async fn reload(&self) -> ConfigResult<usize> {
        let (config, devices) = self.loader.load_and_compile(&self.config_path)?;
        let count = devices.len();
        self.engine.install_devices(devices);
        *self.config.write().await = config;
        info!(devices = count, "configuration reloaded");
        Ok(count)
    }
}
