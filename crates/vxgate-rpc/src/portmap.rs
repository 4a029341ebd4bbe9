// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Embedded ONC-RPC portmapper.
//!
//! Just enough of portmapper v2 (program 100000) to let standard VXI-11
//! clients discover the gateway: PMAPPROC_NULL and PMAPPROC_GETPORT on TCP
//! and UDP port 111. GETPORT answers the configured VXI-11 TCP port for
//! DEVICE_CORE and DEVICE_ASYNC, and 0 for DEVICE_INTR, unknown programs,
//! and non-TCP protocol queries.
//!
//! Port 111 normally needs privilege; a failed bind logs a warning and
//! disables that socket so the façade stays reachable on its direct port.

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{encode_accepted_reply, AcceptStatus, RpcCall};
use crate::server::{read_record, write_record};
use crate::vxi11::{DEVICE_ASYNC_PROG, DEVICE_CORE_PROG};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// Portmapper program number.
pub const PMAP_PROG: u32 = 100_000;
/// Portmapper protocol version served.
pub const PMAP_VERS: u32 = 2;
/// Null procedure.
pub const PMAPPROC_NULL: u32 = 0;
/// Port lookup procedure.
pub const PMAPPROC_GETPORT: u32 = 3;
/// Standard portmapper port.
pub const PMAP_PORT: u16 = 111;

/// IP protocol number for TCP in GETPORT queries.
const IPPROTO_TCP: u32 = 6;

// =============================================================================
// Call handling
// =============================================================================

/// Answers one portmapper datagram/record. `None` means "ignore".
fn handle_call(data: &[u8], vxi_port: u16) -> Option<Vec<u8>> {
    let mut dec = XdrDecoder::new(data);
    let call = RpcCall::decode(&mut dec).ok()?;

    if call.program != PMAP_PROG || call.version != PMAP_VERS {
        // Not a portmap call this component answers.
        return None;
    }

    match call.procedure {
        PMAPPROC_NULL => Some(encode_accepted_reply(call.xid, AcceptStatus::Success, &[])),
        PMAPPROC_GETPORT => {
            let target_prog = dec.get_u32().ok()?;
            let _target_vers = dec.get_u32().ok()?;
            let target_prot = dec.get_u32().ok()?;
            let _target_port = dec.get_u32().ok()?;

            let port = match target_prog {
                DEVICE_CORE_PROG | DEVICE_ASYNC_PROG if target_prot == IPPROTO_TCP => {
                    u32::from(vxi_port)
                }
                _ => 0,
            };
            debug!(program = target_prog, port, "portmap GETPORT");

            let mut enc = XdrEncoder::new();
            enc.put_u32(port);
            Some(encode_accepted_reply(
                call.xid,
                AcceptStatus::Success,
                &enc.into_bytes(),
            ))
        }
        // Unhandled procedures answer a successful void reply.
        _ => Some(encode_accepted_reply(call.xid, AcceptStatus::Success, &[])),
    }
}

// =============================================================================
// PortmapServer
// =============================================================================

/// Configuration for the embedded portmapper.
#[derive(Debug, Clone)]
pub struct PortmapServer {
    /// Bind host.
    pub host: String,
    /// Bind port (111 in production; 0 for tests).
    pub port: u16,
    /// The VXI-11 TCP port GETPORT advertises.
    pub vxi_port: u16,
}

/// Running portmapper sockets.
pub struct PortmapHandle {
    tasks: Vec<JoinHandle<()>>,
    /// Bound TCP port, when the TCP socket came up.
    pub tcp_port: Option<u16>,
    /// Bound UDP port, when the UDP socket came up.
    pub udp_port: Option<u16>,
    /// Bind failures, for callers that distinguish a privilege problem
    /// (skip and continue) from an irrecoverable one.
    pub failures: Vec<io::Error>,
}

impl PortmapHandle {
    /// Whether at least one socket is serving.
    pub fn is_active(&self) -> bool {
        self.tcp_port.is_some() || self.udp_port.is_some()
    }

    /// Stops the portmapper tasks.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PortmapHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PortmapServer {
    /// Creates a portmapper on the standard port for `vxi_port`.
    pub fn new(host: impl Into<String>, vxi_port: u16) -> Self {
        Self {
            host: host.into(),
            port: PMAP_PORT,
            vxi_port,
        }
    }

    /// Overrides the bind port (tests bind an ephemeral port).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Binds TCP and UDP sockets and spawns their serve loops.
    ///
    /// A socket that fails to bind is logged and skipped; the handle reports
    /// which sockets came up.
    pub async fn spawn(self) -> PortmapHandle {
        let mut tasks = Vec::new();
        let mut tcp_port = None;
        let mut udp_port = None;
        let mut failures = Vec::new();

        match TcpListener::bind((self.host.as_str(), self.port)).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    tcp_port = Some(addr.port());
                    info!(%addr, "portmapper TCP listening");
                }
                let vxi_port = self.vxi_port;
                tasks.push(tokio::spawn(async move {
                    tcp_loop(listener, vxi_port).await;
                }));
            }
            Err(e) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "portmapper TCP bind failed; continuing without it"
                );
                failures.push(e);
            }
        }

        match UdpSocket::bind((self.host.as_str(), self.port)).await {
            Ok(socket) => {
                if let Ok(addr) = socket.local_addr() {
                    udp_port = Some(addr.port());
                    info!(%addr, "portmapper UDP listening");
                }
                let vxi_port = self.vxi_port;
                let socket = Arc::new(socket);
                tasks.push(tokio::spawn(async move {
                    udp_loop(socket, vxi_port).await;
                }));
            }
            Err(e) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "portmapper UDP bind failed; continuing without it"
                );
                failures.push(e);
            }
        }

        PortmapHandle {
            tasks,
            tcp_port,
            udp_port,
            failures,
        }
    }
}

async fn udp_loop(socket: Arc<UdpSocket>, vxi_port: u16) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "portmapper UDP receive failed");
                continue;
            }
        };
        if let Some(reply) = handle_call(&buf[..len], vxi_port) {
            if let Err(e) = socket.send_to(&reply, peer).await {
                debug!(%peer, error = %e, "portmapper UDP send failed");
            }
        }
    }
}

async fn tcp_loop(listener: TcpListener, vxi_port: u16) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "portmapper TCP accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = tcp_client(&mut stream, vxi_port).await {
                debug!(%peer, error = %e, "portmapper TCP session ended");
            }
        });
    }
}

async fn tcp_client(stream: &mut tokio::net::TcpStream, vxi_port: u16) -> io::Result<()> {
    while let Some(record) = read_record(stream).await? {
        if let Some(reply) = handle_call(&record, vxi_port) {
            write_record(stream, &reply).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AUTH_NULL, MSG_CALL, RPC_VERSION};
    use crate::vxi11::DEVICE_INTR_PROG;

    fn getport_call(program: u32, protocol: u32) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        enc.put_u32(42);
        enc.put_u32(MSG_CALL);
        enc.put_u32(RPC_VERSION);
        enc.put_u32(PMAP_PROG);
        enc.put_u32(PMAP_VERS);
        enc.put_u32(PMAPPROC_GETPORT);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        enc.put_u32(program);
        enc.put_u32(1);
        enc.put_u32(protocol);
        enc.put_u32(0);
        enc.into_bytes()
    }

    fn reply_port(reply: &[u8]) -> u32 {
        // Skip xid, type, stat, verifier, accept stat.
        let mut dec = XdrDecoder::new(reply);
        dec.skip(24).unwrap();
        dec.get_u32().unwrap()
    }

    #[test]
    fn test_getport_core_returns_vxi_port() {
        let reply = handle_call(&getport_call(DEVICE_CORE_PROG, IPPROTO_TCP), 1024).unwrap();
        assert_eq!(reply_port(&reply), 1024);
    }

    #[test]
    fn test_getport_async_returns_vxi_port() {
        let reply = handle_call(&getport_call(DEVICE_ASYNC_PROG, IPPROTO_TCP), 1024).unwrap();
        assert_eq!(reply_port(&reply), 1024);
    }

    #[test]
    fn test_getport_intr_returns_zero() {
        let reply = handle_call(&getport_call(DEVICE_INTR_PROG, IPPROTO_TCP), 1024).unwrap();
        assert_eq!(reply_port(&reply), 0);
    }

    #[test]
    fn test_getport_udp_protocol_returns_zero() {
        let reply = handle_call(&getport_call(DEVICE_CORE_PROG, 17), 1024).unwrap();
        assert_eq!(reply_port(&reply), 0);
    }

    #[test]
    fn test_getport_unknown_program_returns_zero() {
        let reply = handle_call(&getport_call(100005, IPPROTO_TCP), 1024).unwrap();
        assert_eq!(reply_port(&reply), 0);
    }

    #[test]
    fn test_non_portmap_calls_are_ignored() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(1);
        enc.put_u32(MSG_CALL);
        enc.put_u32(RPC_VERSION);
        enc.put_u32(DEVICE_CORE_PROG);
        enc.put_u32(1);
        enc.put_u32(0);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        assert!(handle_call(&enc.into_bytes(), 1024).is_none());
    }

    #[tokio::test]
    async fn test_spawn_on_ephemeral_ports() {
        let handle = PortmapServer::new("127.0.0.1", 1024).with_port(0).spawn().await;
        assert!(handle.is_active());
        assert!(handle.udp_port.is_some());

        // Query over UDP.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(
                &getport_call(DEVICE_CORE_PROG, IPPROTO_TCP),
                ("127.0.0.1", handle.udp_port.unwrap()),
            )
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(reply_port(&buf[..len]), 1024);
    }
}
