// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! A minimal VXI-11 wire client.
//!
//! Speaks real record-marked ONC-RPC over TCP so integration tests exercise
//! the gateway exactly as a stock VXI-11 library would.

use tokio::net::TcpStream;

use vxgate_rpc::message::{AUTH_NULL, MSG_CALL, MSG_REPLY, REPLY_ACCEPTED, RPC_VERSION};
use vxgate_rpc::vxi11::{
    self, proc, CreateLinkParms, CreateLinkResp, DeviceLockParms, DeviceReadParms, DeviceReadResp,
    DeviceWriteParms, DeviceWriteResp,
};
use vxgate_rpc::{read_record, write_record, XdrDecoder, XdrEncoder};

/// RPC accept status plus the undecoded result body.
pub struct RawReply {
    /// accept_stat value (0 = SUCCESS).
    pub accept_stat: u32,
    /// Result bytes following the reply header.
    pub body: Vec<u8>,
}

/// A test client holding one VXI-11 connection.
pub struct Vxi11TestClient {
    stream: TcpStream,
    next_xid: u32,
}

impl Vxi11TestClient {
    /// Connects to the gateway on localhost.
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to gateway");
        Self {
            stream,
            next_xid: 1,
        }
    }

    /// Drops the connection without destroying links, simulating a client
    /// crash.
    pub fn abandon(self) {}

    /// Issues one raw RPC call and returns the reply.
    pub async fn call(&mut self, program: u32, version: u32, procedure: u32, args: &[u8]) -> RawReply {
        let xid = self.next_xid;
        self.next_xid += 1;

        let mut enc = XdrEncoder::new();
        enc.put_u32(xid);
        enc.put_u32(MSG_CALL);
        enc.put_u32(RPC_VERSION);
        enc.put_u32(program);
        enc.put_u32(version);
        enc.put_u32(procedure);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        enc.put_u32(AUTH_NULL);
        enc.put_opaque(&[]);
        let mut message = enc.into_bytes();
        message.extend_from_slice(args);

        write_record(&mut self.stream, &message)
            .await
            .expect("send RPC call");
        let reply = read_record(&mut self.stream)
            .await
            .expect("read RPC reply")
            .expect("connection stayed open");

        let mut dec = XdrDecoder::new(&reply);
        assert_eq!(dec.get_u32().expect("xid"), xid, "reply xid mismatch");
        assert_eq!(dec.get_u32().expect("type"), MSG_REPLY);
        assert_eq!(dec.get_u32().expect("stat"), REPLY_ACCEPTED);
        // Verifier.
        dec.get_u32().expect("verf flavor");
        dec.get_opaque().expect("verf body");
        let accept_stat = dec.get_u32().expect("accept stat");

        let consumed = reply.len() - dec.remaining();
        RawReply {
            accept_stat,
            body: reply[consumed..].to_vec(),
        }
    }

    async fn core_call(&mut self, procedure: u32, args: &[u8]) -> Vec<u8> {
        let reply = self
            .call(vxi11::DEVICE_CORE_PROG, vxi11::DEVICE_CORE_VERS, procedure, args)
            .await;
        assert_eq!(reply.accept_stat, 0, "RPC-level rejection");
        reply.body
    }

    /// create_link without locking.
    pub async fn create_link(&mut self, device: &str) -> CreateLinkResp {
        self.create_link_with_lock(device, false, 0).await
    }

    /// create_link with explicit lock parameters.
    pub async fn create_link_with_lock(
        &mut self,
        device: &str,
        lock: bool,
        lock_timeout_ms: u32,
    ) -> CreateLinkResp {
        let mut enc = XdrEncoder::new();
        CreateLinkParms {
            client_id: 1,
            lock_device: lock,
            lock_timeout_ms,
            device: device.to_string(),
        }
        .encode(&mut enc);
        let body = self.core_call(proc::CREATE_LINK, &enc.into_bytes()).await;
        CreateLinkResp::decode(&mut XdrDecoder::new(&body)).expect("decode create_link resp")
    }

    /// device_write.
    pub async fn device_write(&mut self, lid: u32, data: &[u8]) -> DeviceWriteResp {
        let mut enc = XdrEncoder::new();
        DeviceWriteParms {
            lid,
            io_timeout_ms: 2000,
            lock_timeout_ms: 2000,
            flags: vxi11::flags::END,
            data: data.to_vec(),
        }
        .encode(&mut enc);
        let body = self.core_call(proc::DEVICE_WRITE, &enc.into_bytes()).await;
        DeviceWriteResp::decode(&mut XdrDecoder::new(&body)).expect("decode device_write resp")
    }

    /// device_read.
    pub async fn device_read(&mut self, lid: u32, request_size: u32) -> DeviceReadResp {
        let mut enc = XdrEncoder::new();
        DeviceReadParms {
            lid,
            request_size,
            io_timeout_ms: 2000,
            lock_timeout_ms: 2000,
            flags: 0,
            term_char: 0,
        }
        .encode(&mut enc);
        let body = self.core_call(proc::DEVICE_READ, &enc.into_bytes()).await;
        DeviceReadResp::decode(&mut XdrDecoder::new(&body)).expect("decode device_read resp")
    }

    /// device_lock; returns the VXI-11 error code.
    pub async fn device_lock(&mut self, lid: u32, wait: bool, timeout_ms: u32) -> u32 {
        let mut enc = XdrEncoder::new();
        DeviceLockParms {
            lid,
            flags: if wait { vxi11::flags::WAIT_LOCK } else { 0 },
            lock_timeout_ms: timeout_ms,
        }
        .encode(&mut enc);
        let body = self.core_call(proc::DEVICE_LOCK, &enc.into_bytes()).await;
        XdrDecoder::new(&body).get_u32().expect("device_error")
    }

    /// device_unlock; returns the VXI-11 error code.
    pub async fn device_unlock(&mut self, lid: u32) -> u32 {
        let mut enc = XdrEncoder::new();
        enc.put_u32(lid);
        let body = self.core_call(proc::DEVICE_UNLOCK, &enc.into_bytes()).await;
        XdrDecoder::new(&body).get_u32().expect("device_error")
    }

    /// destroy_link; returns the VXI-11 error code.
    pub async fn destroy_link(&mut self, lid: u32) -> u32 {
        let mut enc = XdrEncoder::new();
        enc.put_u32(lid);
        let body = self.core_call(proc::DESTROY_LINK, &enc.into_bytes()).await;
        XdrDecoder::new(&body).get_u32().expect("device_error")
    }
}
