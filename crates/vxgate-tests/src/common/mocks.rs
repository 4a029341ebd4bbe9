// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Mock backend instruments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// A line-oriented SCPI instrument answering from a command table.
pub struct MockScpiInstrument {
    /// Bound address.
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockScpiInstrument {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockScpiInstrument {
    /// Starts the mock with a command → reply table. Replies are sent
    /// verbatim; unknown commands are ignored.
    pub async fn start(table: HashMap<String, String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let table = Arc::new(table);

        let task = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let table = table.clone();
                tokio::spawn(async move {
                    let mut line = Vec::new();
                    let mut byte = [0u8; 1];
                    loop {
                        match stream.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        if byte[0] == b'\n' {
                            let command = String::from_utf8_lossy(&line).trim().to_string();
                            line.clear();
                            if let Some(reply) = table.get(&command) {
                                if stream.write_all(reply.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        } else {
                            line.push(byte[0]);
                        }
                    }
                });
            }
        });

        Self { addr, task }
    }
}

/// A MODBUS TCP slave with a holding-register map, recording every PDU.
pub struct MockModbusSlave {
    /// Bound address.
    pub addr: SocketAddr,
    /// Every request PDU received, in order.
    pub pdus: Arc<Mutex<Vec<Vec<u8>>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockModbusSlave {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockModbusSlave {
    /// Starts the mock with initial holding-register contents.
    pub async fn start(unit_id: u8, holding: HashMap<u16, u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let pdus: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let registers = Arc::new(Mutex::new(holding));

        let recorded = pdus.clone();
        let task = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let recorded = recorded.clone();
                let registers = registers.clone();
                tokio::spawn(async move {
                    loop {
                        let mut header = [0u8; 7];
                        if stream.read_exact(&mut header).await.is_err() {
                            return;
                        }
                        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                        let mut pdu = vec![0u8; length.saturating_sub(1)];
                        if stream.read_exact(&mut pdu).await.is_err() {
                            return;
                        }
                        recorded.lock().await.push(pdu.clone());

                        let response = respond(unit_id, &pdu, &registers).await;
                        let mut reply = Vec::with_capacity(7 + response.len());
                        reply.extend_from_slice(&header[..2]);
                        reply.extend_from_slice(&0u16.to_be_bytes());
                        reply.extend_from_slice(&((1 + response.len()) as u16).to_be_bytes());
                        reply.push(header[6]);
                        reply.extend_from_slice(&response);
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { addr, pdus, task }
    }
}

async fn respond(_unit_id: u8, pdu: &[u8], registers: &Mutex<HashMap<u16, u16>>) -> Vec<u8> {
    let function = pdu[0];
    match function {
        // Read holding/input registers.
        0x03 | 0x04 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let map = registers.lock().await;
            let mut response = vec![function, (count * 2) as u8];
            for offset in 0..count {
                let value = map.get(&(address + offset)).copied().unwrap_or(0);
                response.extend_from_slice(&value.to_be_bytes());
            }
            response
        }
        // Write single register: echo, and store the value.
        0x06 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            registers.lock().await.insert(address, value);
            pdu.to_vec()
        }
        // Write multiple registers: store and acknowledge.
        0x10 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut map = registers.lock().await;
            for offset in 0..count {
                let base = 6 + (offset as usize) * 2;
                let value = u16::from_be_bytes([pdu[base], pdu[base + 1]]);
                map.insert(address + offset, value);
            }
            vec![function, pdu[1], pdu[2], pdu[3], pdu[4]]
        }
        // Anything else: illegal function exception.
        other => vec![other | 0x80, 0x01],
    }
}
