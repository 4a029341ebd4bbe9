// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MODBUS TCP (MBAP) framing.
//!
//! ADU = MBAP header {transaction id, protocol id 0, length, unit id} + PDU.
//! The client is single-outstanding: one request is in flight at a time and
//! the response is matched by transaction id. Header mismatches invalidate
//! the connection — a desynchronized stream cannot be trusted.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use vxgate_core::error::AdapterError;
use vxgate_core::types::TcpEndpoint;

use crate::pdu::MAX_PDU_SIZE;

/// MBAP header length in bytes.
pub const MBAP_HEADER_SIZE: usize = 7;

/// Single-connection MODBUS TCP client.
pub struct MbapClient {
    endpoint: TcpEndpoint,
    unit_id: u8,
    timeout: Duration,
    stream: Option<TcpStream>,
    transaction_id: u16,
}

impl MbapClient {
    /// Creates a disconnected client.
    pub fn new(endpoint: TcpEndpoint, unit_id: u8, timeout: Duration) -> Self {
        Self {
            endpoint,
            unit_id,
            timeout,
            stream: None,
            transaction_id: 0,
        }
    }

    /// Whether the TCP connection is established.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the TCP connection.
    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        let address = self.endpoint.address();
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| AdapterError::Timeout {
                timeout: self.timeout,
            })?
            .map_err(|e| AdapterError::connect_failed(&address, e))?;
        let _ = stream.set_nodelay(true);
        debug!(%address, unit_id = self.unit_id, "MODBUS TCP connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Closes the connection.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(address = %self.endpoint.address(), "MODBUS TCP closed");
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Sends a request PDU and returns the response PDU.
    pub async fn transact(&mut self, pdu: &[u8]) -> Result<Vec<u8>, AdapterError> {
        let address = self.endpoint.address();
        let tid = self.next_transaction_id();

        let mut adu = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
        adu.extend_from_slice(&tid.to_be_bytes());
        adu.extend_from_slice(&0u16.to_be_bytes());
        adu.extend_from_slice(&((1 + pdu.len()) as u16).to_be_bytes());
        adu.push(self.unit_id);
        adu.extend_from_slice(pdu);

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AdapterError::not_connected(address.clone()))?;

        trace!(tid, len = adu.len(), "MODBUS TCP request");
        let result = Self::exchange(stream, &adu, tid, self.unit_id, self.timeout).await;
        if result.is_err() {
            // Any framing or transport fault leaves the stream unusable.
            self.stream = None;
        }
        result.map_err(|e| match e {
            AdapterError::Io { message, .. } => AdapterError::io(&address, message),
            other => other,
        })
    }

    async fn exchange(
        stream: &mut TcpStream,
        adu: &[u8],
        tid: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        let deadline = tokio::time::Instant::now() + timeout;

        tokio::time::timeout_at(deadline, stream.write_all(adu))
            .await
            .map_err(|_| AdapterError::Timeout { timeout })?
            .map_err(|e| AdapterError::io("", e))?;

        let mut header = [0u8; MBAP_HEADER_SIZE];
        tokio::time::timeout_at(deadline, stream.read_exact(&mut header))
            .await
            .map_err(|_| AdapterError::Timeout { timeout })?
            .map_err(|e| AdapterError::io("", e))?;

        let recv_tid = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let recv_unit = header[6];

        if recv_tid != tid {
            return Err(AdapterError::frame(format!(
                "MBAP transaction id mismatch: sent {} received {}",
                tid, recv_tid
            )));
        }
        if protocol_id != 0 {
            return Err(AdapterError::frame(format!(
                "MBAP protocol id {} is not MODBUS",
                protocol_id
            )));
        }
        if recv_unit != unit_id {
            return Err(AdapterError::frame(format!(
                "MBAP unit id mismatch: sent {} received {}",
                unit_id, recv_unit
            )));
        }
        if length == 0 || length - 1 > MAX_PDU_SIZE {
            return Err(AdapterError::frame(format!(
                "MBAP length {} out of range",
                length
            )));
        }

        let mut pdu = vec![0u8; length - 1];
        tokio::time::timeout_at(deadline, stream.read_exact(&mut pdu))
            .await
            .map_err(|_| AdapterError::Timeout { timeout })?
            .map_err(|e| AdapterError::io("", e))?;

        trace!(tid, len = pdu.len(), "MODBUS TCP response");
        Ok(pdu)
    }
}

impl std::fmt::Debug for MbapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MbapClient")
            .field("endpoint", &self.endpoint.address())
            .field("unit_id", &self.unit_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
