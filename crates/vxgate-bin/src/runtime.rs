// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Gateway runtime assembly.
//!
//! Wires configuration, the adapter factory, the engine, the VXI-11
//! listener, the portmapper, and the management API together, then serves
//! until the shutdown signal fires.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use vxgate_adapters::DefaultAdapterFactory;
use vxgate_api::{ApiServer, AppState};
use vxgate_config::ConfigLoader;
use vxgate_core::GatewayEngine;
use vxgate_rpc::{PortmapServer, Vxi11Server};

use crate::error::AppError;
use crate::shutdown::shutdown_signal;

/// Loads the configuration and runs the gateway to completion.
pub async fn run(config_path: &Path) -> Result<(), AppError> {
    let loader = ConfigLoader::new();
    let (config, devices) = loader.load_and_compile(config_path)?;

    let factory = Arc::new(DefaultAdapterFactory::new());
    let engine = Arc::new(GatewayEngine::new(factory));
    engine.install_devices(devices);

    let server = Vxi11Server::bind(&config.server.host, config.server.port, engine.clone())
        .await
        .map_err(|source| AppError::Bind {
            address: format!("{}:{}", config.server.host, config.server.port),
            source,
        })?;
    let vxi_port = server.local_port();

    // The portmapper lets stock VXI-11 clients discover the listener. A
    // privileged-port bind failure is survivable; anything else while the
    // component is enabled is not.
    let _portmapper = if config.server.portmapper_enabled {
        let handle = PortmapServer::new(config.server.host.clone(), vxi_port)
            .spawn()
            .await;
        if !handle.is_active() {
            let survivable = handle.failures.iter().all(|e| {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AddrInUse
                )
            });
            if !survivable {
                return Err(AppError::Portmapper {
                    message: "neither portmapper socket could be bound".into(),
                });
            }
            warn!("portmapper disabled (port 111 unavailable); clients must use the direct port");
        }
        Some(handle)
    } else {
        None
    };

    if config.server.gui.enabled {
        let address: SocketAddr = format!("{}:{}", config.server.gui.host, config.server.gui.port)
            .parse()
            .map_err(|e| AppError::Runtime {
                message: format!("invalid management address: {}", e),
            })?;
        let state = AppState::new(engine.clone(), config_path, config.clone());
        tokio::spawn(async move {
            if let Err(e) = ApiServer::new(state)
                .run_with_shutdown(address, shutdown_signal())
                .await
            {
                warn!(error = %e, "management API stopped");
            }
        });
    }

    info!(port = vxi_port, "gateway up");
    server
        .serve_with_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Runtime {
            message: e.to_string(),
        })
}
