// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-process gateway launcher.

use std::sync::Arc;

use vxgate_adapters::DefaultAdapterFactory;
use vxgate_config::GatewayConfig;
use vxgate_core::GatewayEngine;
use vxgate_rpc::Vxi11Server;

/// A gateway running on an ephemeral port for one test.
pub struct GatewayHandle {
    /// The VXI-11 TCP port.
    pub port: u16,
    /// The engine behind the listener, for state assertions.
    pub engine: Arc<GatewayEngine>,
    server_task: tokio::task::JoinHandle<()>,
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

/// Starts a gateway from a YAML document on an OS-assigned port.
pub async fn spawn_gateway(yaml: &str) -> GatewayHandle {
    let mut config: GatewayConfig = serde_yaml::from_str(yaml).expect("test config parses");
    config.canonicalize().expect("test config canonicalizes");
    config.validate().expect("test config validates");
    let devices = config.compile().expect("test config compiles");

    let engine = Arc::new(GatewayEngine::new(Arc::new(DefaultAdapterFactory::new())));
    engine.install_devices(devices);

    let server = Vxi11Server::bind("127.0.0.1", 0, engine.clone())
        .await
        .expect("bind ephemeral VXI-11 port");
    let port = server.local_port();
    let server_task = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    GatewayHandle {
        port,
        engine,
        server_task,
    }
}
