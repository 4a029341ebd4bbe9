// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The VXI-11 RPC façade.
//!
//! Accepts record-marked ONC-RPC connections, decodes calls, and routes
//! DEVICE_CORE / DEVICE_ASYNC procedures into the gateway engine. Each
//! connection runs on its own task; requests within a connection are
//! processed strictly in order, as VXI-11 clients expect. When a connection
//! drops, every link it created is destroyed and its resources released.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use vxgate_core::{GatewayEngine, GatewayError};

use crate::message::{encode_accepted_reply, encode_rpc_mismatch, AcceptStatus, RpcCall, RpcError};
use crate::vxi11::{self, proc, flags};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// Largest RPC record accepted from a client.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Marks the final fragment of a record.
const LAST_FRAGMENT: u32 = 0x8000_0000;

// =============================================================================
// Record marking
// =============================================================================

/// Reads one record-marked RPC message, reassembling fragments.
///
/// Returns `None` on a clean EOF before the first header byte.
pub async fn read_record<S>(stream: &mut S) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let mut header = [0u8; 4];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let marker = u32::from_be_bytes(header);
        let last = marker & LAST_FRAGMENT != 0;
        let length = (marker & !LAST_FRAGMENT) as usize;

        if message.len() + length > MAX_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("RPC record exceeds {} bytes", MAX_RECORD_SIZE),
            ));
        }

        let start = message.len();
        message.resize(start + length, 0);
        stream.read_exact(&mut message[start..]).await?;

        if last {
            return Ok(Some(message));
        }
    }
}

/// Writes one RPC message as a single last-fragment record.
pub async fn write_record<S>(stream: &mut S, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let marker = LAST_FRAGMENT | payload.len() as u32;
    stream.write_all(&marker.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

// =============================================================================
// Vxi11Server
// =============================================================================

/// The VXI-11 TCP listener and dispatcher.
pub struct Vxi11Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: Arc<GatewayEngine>,
    next_conn_id: AtomicU64,
}

impl Vxi11Server {
    /// Binds the VXI-11 listener. Port 0 requests an OS-assigned port.
    pub async fn bind(host: &str, port: u16, engine: Arc<GatewayEngine>) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "VXI-11 core service listening");
        Ok(Self {
            listener,
            local_addr,
            engine,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The bound TCP port, also advertised as the abort-channel port.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> io::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                    let engine = self.engine.clone();
                    let abort_port = self.local_port();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, conn_id, abort_port, engine).await;
                    });
                }
                _ = &mut shutdown => {
                    info!("VXI-11 listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Accepts connections forever.
    pub async fn serve(self) -> io::Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    abort_port: u16,
    engine: Arc<GatewayEngine>,
) {
    debug!(%peer, conn_id, "client connected");
    let _ = stream.set_nodelay(true);

    loop {
        let record = match read_record(&mut stream).await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, conn_id, error = %e, "connection read failed");
                break;
            }
        };

        let mut dec = XdrDecoder::new(&record);
        let call = match RpcCall::decode(&mut dec) {
            Ok(call) => call,
            Err(RpcError::VersionMismatch(_)) => {
                // xid is the first field; recover it for the denial.
                let xid = record
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                let _ = write_record(&mut stream, &encode_rpc_mismatch(xid)).await;
                continue;
            }
            Err(e) => {
                debug!(%peer, conn_id, error = %e, "undecodable RPC message");
                break;
            }
        };

        let reply = dispatch(&engine, conn_id, abort_port, &call, &mut dec).await;
        if let Err(e) = write_record(&mut stream, &reply).await {
            debug!(%peer, conn_id, error = %e, "connection write failed");
            break;
        }
    }

    // Implicit cleanup: locks release, buffers drop, adapters close.
    engine.destroy_connection(conn_id).await;
    debug!(%peer, conn_id, "client disconnected");
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(
    engine: &GatewayEngine,
    conn_id: u64,
    abort_port: u16,
    call: &RpcCall,
    args: &mut XdrDecoder<'_>,
) -> Vec<u8> {
    match call.program {
        vxi11::DEVICE_CORE_PROG => {
            if call.version != vxi11::DEVICE_CORE_VERS {
                return encode_accepted_reply(
                    call.xid,
                    AcceptStatus::ProgMismatch {
                        low: vxi11::DEVICE_CORE_VERS,
                        high: vxi11::DEVICE_CORE_VERS,
                    },
                    &[],
                );
            }
            dispatch_core(engine, conn_id, abort_port, call, args).await
        }
        vxi11::DEVICE_ASYNC_PROG => match call.procedure {
            proc::DEVICE_ABORT => {
                // Abort is acknowledged; in-order processing means there is
                // never a concurrent request on this channel to cancel.
                reply_device_error(call.xid, 0)
            }
            _ => encode_accepted_reply(call.xid, AcceptStatus::ProcUnavail, &[]),
        },
        _ => {
            warn!(program = call.program, "call for unknown RPC program");
            encode_accepted_reply(call.xid, AcceptStatus::ProgUnavail, &[])
        }
    }
}

async fn dispatch_core(
    engine: &GatewayEngine,
    conn_id: u64,
    abort_port: u16,
    call: &RpcCall,
    args: &mut XdrDecoder<'_>,
) -> Vec<u8> {
    let xid = call.xid;
    match call.procedure {
        proc::CREATE_LINK => match vxi11::CreateLinkParms::decode(args) {
            Ok(parms) => handle_create_link(engine, conn_id, abort_port, xid, parms).await,
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_WRITE => match vxi11::DeviceWriteParms::decode(args) {
            Ok(parms) => handle_device_write(engine, xid, parms).await,
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_READ => match vxi11::DeviceReadParms::decode(args) {
            Ok(parms) => handle_device_read(engine, xid, parms).await,
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_READSTB => match vxi11::DeviceGenericParms::decode(args) {
            Ok(parms) => handle_readstb(engine, xid, parms).await,
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_TRIGGER => match vxi11::DeviceGenericParms::decode(args) {
            Ok(parms) => {
                let code = error_code(engine.device_trigger(parms.lid).await);
                reply_device_error(xid, code)
            }
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_CLEAR => match vxi11::DeviceGenericParms::decode(args) {
            Ok(parms) => {
                let code = error_code(engine.device_clear(parms.lid).await);
                reply_device_error(xid, code)
            }
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_REMOTE | proc::DEVICE_LOCAL => {
            match vxi11::DeviceGenericParms::decode(args) {
                Ok(parms) => {
                    let code = error_code(engine.device_remote_local(parms.lid).await);
                    reply_device_error(xid, code)
                }
                Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
            }
        }
        proc::DEVICE_LOCK => match vxi11::DeviceLockParms::decode(args) {
            Ok(parms) => {
                let wait = parms.flags & flags::WAIT_LOCK != 0;
                let timeout = ms_to_timeout(parms.lock_timeout_ms);
                let code = error_code(engine.device_lock(parms.lid, wait, timeout).await);
                reply_device_error(xid, code)
            }
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DEVICE_UNLOCK => match decode_link_id(args) {
            Ok(lid) => {
                let code = error_code(engine.device_unlock(lid).await);
                reply_device_error(xid, code)
            }
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        proc::DESTROY_LINK => match decode_link_id(args) {
            Ok(lid) => {
                let code = error_code(engine.destroy_link(lid).await);
                reply_device_error(xid, code)
            }
            Err(_) => encode_accepted_reply(xid, AcceptStatus::GarbageArgs, &[]),
        },
        other => {
            debug!(procedure = other, "unsupported DEVICE_CORE procedure");
            encode_accepted_reply(xid, AcceptStatus::ProcUnavail, &[])
        }
    }
}

// =============================================================================
// Procedure handlers
// =============================================================================

async fn handle_create_link(
    engine: &GatewayEngine,
    conn_id: u64,
    abort_port: u16,
    xid: u32,
    parms: vxi11::CreateLinkParms,
) -> Vec<u8> {
    info!(device = %parms.device, client_id = parms.client_id, "create_link");

    let lock_timeout = ms_to_timeout(parms.lock_timeout_ms);
    let resp = match engine
        .create_link(
            conn_id,
            parms.client_id,
            &parms.device,
            parms.lock_device,
            lock_timeout,
        )
        .await
    {
        Ok(created) => vxi11::CreateLinkResp {
            error: 0,
            lid: created.lid,
            abort_port,
            max_recv_size: created.max_recv_size,
        },
        Err(err) => {
            warn!(device = %parms.device, error = %err, "create_link failed");
            vxi11::CreateLinkResp {
                error: err.error_code().as_u32(),
                lid: 0,
                abort_port: 0,
                max_recv_size: 0,
            }
        }
    };

    let mut enc = XdrEncoder::new();
    resp.encode(&mut enc);
    encode_accepted_reply(xid, AcceptStatus::Success, &enc.into_bytes())
}

async fn handle_device_write(
    engine: &GatewayEngine,
    xid: u32,
    parms: vxi11::DeviceWriteParms,
) -> Vec<u8> {
    debug!(
        lid = parms.lid,
        len = parms.data.len(),
        io_timeout_ms = parms.io_timeout_ms,
        "device_write"
    );

    let resp = match engine
        .device_write(
            parms.lid,
            &parms.data,
            ms_to_timeout(parms.io_timeout_ms),
            ms_to_timeout(parms.lock_timeout_ms),
        )
        .await
    {
        Ok(size) => vxi11::DeviceWriteResp {
            error: 0,
            size: size as u32,
        },
        Err(err) => {
            debug!(lid = parms.lid, error = %err, "device_write failed");
            vxi11::DeviceWriteResp {
                error: err.error_code().as_u32(),
                size: 0,
            }
        }
    };

    let mut enc = XdrEncoder::new();
    resp.encode(&mut enc);
    encode_accepted_reply(xid, AcceptStatus::Success, &enc.into_bytes())
}

async fn handle_device_read(
    engine: &GatewayEngine,
    xid: u32,
    parms: vxi11::DeviceReadParms,
) -> Vec<u8> {
    debug!(
        lid = parms.lid,
        request_size = parms.request_size,
        "device_read"
    );

    let resp = match engine
        .device_read(
            parms.lid,
            parms.request_size as usize,
            ms_to_timeout(parms.io_timeout_ms),
        )
        .await
    {
        Ok((data, reason)) => vxi11::DeviceReadResp {
            error: 0,
            reason,
            data,
        },
        Err(err) => {
            debug!(lid = parms.lid, error = %err, "device_read failed");
            vxi11::DeviceReadResp {
                error: err.error_code().as_u32(),
                reason: 0,
                data: Vec::new(),
            }
        }
    };

    let mut enc = XdrEncoder::new();
    resp.encode(&mut enc);
    encode_accepted_reply(xid, AcceptStatus::Success, &enc.into_bytes())
}

async fn handle_readstb(
    engine: &GatewayEngine,
    xid: u32,
    parms: vxi11::DeviceGenericParms,
) -> Vec<u8> {
    let resp = match engine.read_stb(parms.lid).await {
        Ok(stb) => vxi11::DeviceReadStbResp { error: 0, stb },
        Err(err) => vxi11::DeviceReadStbResp {
            error: err.error_code().as_u32(),
            stb: 0,
        },
    };
    let mut enc = XdrEncoder::new();
    resp.encode(&mut enc);
    encode_accepted_reply(xid, AcceptStatus::Success, &enc.into_bytes())
}

// =============================================================================
// Helpers
// =============================================================================

fn decode_link_id(args: &mut XdrDecoder<'_>) -> Result<u32, crate::xdr::XdrError> {
    args.get_u32()
}

fn reply_device_error(xid: u32, error: u32) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    vxi11::DeviceError { error }.encode(&mut enc);
    encode_accepted_reply(xid, AcceptStatus::Success, &enc.into_bytes())
}

fn error_code(result: Result<(), GatewayError>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.error_code().as_u32(),
    }
}

/// Millisecond timeouts from the wire; zero means "no deadline".
fn ms_to_timeout(ms: u32) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(u64::from(ms)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_record(&mut a, b"payload").await.unwrap();
        let read = read_record(&mut b).await.unwrap().unwrap();
        assert_eq!(read, b"payload");
    }

    #[tokio::test]
    async fn test_record_fragment_reassembly() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Two fragments: "hel" (more follows) + "lo" (last).
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"hel").await.unwrap();
        a.write_all(&(LAST_FRAGMENT | 2).to_be_bytes()).await.unwrap();
        a.write_all(b"lo").await.unwrap();
        a.flush().await.unwrap();

        let read = read_record(&mut b).await.unwrap().unwrap();
        assert_eq!(read, b"hello");
    }

    #[tokio::test]
    async fn test_record_clean_eof() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert!(read_record(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn test_ms_to_timeout() {
        assert_eq!(ms_to_timeout(0), None);
        assert_eq!(ms_to_timeout(1500), Some(Duration::from_millis(1500)));
    }
}
