// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! SCPI over TCP.
//!
//! Plain line-terminated ASCII to an instrument's socket server. The write
//! termination (default `\n`) is appended when missing; reads collect bytes
//! until the read termination appears, the requested size is reached, or the
//! deadline passes — the terminator stays in the returned payload.
//!
//! `requires_lock` defaults to false: every link opens its own socket, so
//! concurrent clients do not interfere.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use vxgate_core::adapter::{reason, InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::types::{DeviceConfig, TcpEndpoint, TransportKind, TransportParams};

/// Adapter forwarding SCPI commands over a TCP socket.
pub struct ScpiTcpAdapter {
    device: Arc<DeviceConfig>,
    endpoint: TcpEndpoint,
    stream: Mutex<Option<TcpStream>>,
}

impl ScpiTcpAdapter {
    /// Builds the adapter; performs no I/O.
    pub fn new(device: Arc<DeviceConfig>) -> Result<Self, AdapterError> {
        let endpoint = match &device.transport {
            TransportParams::ScpiTcp(endpoint) => endpoint.clone(),
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a scpi-tcp device",
                    device.name
                )))
            }
        };
        Ok(Self {
            device,
            endpoint,
            stream: Mutex::new(None),
        })
    }

    async fn open(&self) -> Result<(), AdapterError> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let address = self.endpoint.address();
        let stream = tokio::time::timeout(self.device.io_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| AdapterError::Timeout {
                timeout: self.device.io_timeout,
            })?
            .map_err(|e| AdapterError::connect_failed(&address, e))?;
        let _ = stream.set_nodelay(true);
        debug!(%address, device = %self.device.name, "SCPI TCP connected");
        *guard = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl InstrumentAdapter for ScpiTcpAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::ScpiTcp
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        self.open().await
    }

    async fn release(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        // Lazy open keeps unlocked concurrent links independent.
        self.open().await?;

        let mut payload = data.to_vec();
        if let Some(term) = &self.device.write_termination {
            if !payload.ends_with(term) {
                payload.extend_from_slice(term);
            }
        }

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;

        let address = self.endpoint.address();
        let result = tokio::time::timeout(self.device.io_timeout, stream.write_all(&payload))
            .await
            .map_err(|_| AdapterError::Timeout {
                timeout: self.device.io_timeout,
            })
            .and_then(|r| r.map_err(|e| AdapterError::io(&address, e)));

        if result.is_err() {
            *guard = None;
            return Err(result.unwrap_err());
        }
        Ok(payload.len())
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<ReadPayload, AdapterError> {
        self.open().await?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;

        let address = self.endpoint.address();
        let term = self.device.read_termination.as_deref();
        let target = max_len.max(1);
        let deadline = tokio::time::Instant::now() + timeout;

        let mut buffer: Vec<u8> = Vec::with_capacity(target.min(4096));
        let mut chunk = [0u8; 1024];

        loop {
            if buffer.len() >= target {
                return Ok(ReadPayload {
                    data: buffer,
                    reason: reason::REQCNT,
                });
            }
            if let Some(term) = term {
                if buffer.ends_with(term) {
                    return Ok(ReadPayload {
                        data: buffer,
                        reason: reason::END | reason::TERM_CHR,
                    });
                }
            }

            let want = chunk.len().min(target - buffer.len());
            let read = match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..want])).await
            {
                Ok(Ok(0)) => {
                    *guard = None;
                    return Err(AdapterError::io(&address, "connection closed by instrument"));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    *guard = None;
                    return Err(AdapterError::io(&address, e));
                }
                Err(_) => {
                    // Deadline: deliver what arrived, or report the timeout.
                    if buffer.is_empty() {
                        return Err(AdapterError::Timeout { timeout });
                    }
                    return Ok(ReadPayload {
                        data: buffer,
                        reason: reason::END,
                    });
                }
            };
            buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use vxgate_core::types::{DeviceRules, DEFAULT_IO_TIMEOUT};

    async fn mock_instrument(reply: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        stream.write_all(reply).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    fn device(addr: std::net::SocketAddr) -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            name: "psu".into(),
            kind: TransportKind::ScpiTcp,
            transport: TransportParams::ScpiTcp(TcpEndpoint {
                host: addr.ip().to_string(),
                port: addr.port(),
            }),
            requires_lock: false,
            io_timeout: Duration::from_millis(500),
            write_termination: Some(b"\n".to_vec()),
            read_termination: Some(b"\n".to_vec()),
            rules: DeviceRules::None,
        })
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let addr = mock_instrument(b"+1.234E+00\n").await;
        let adapter = ScpiTcpAdapter::new(device(addr)).unwrap();

        adapter.write(b"MEAS:VOLT?").await.unwrap();
        let payload = adapter.read(64, Duration::from_millis(500)).await.unwrap();
        assert_eq!(payload.data, b"+1.234E+00\n");
        assert_eq!(payload.reason, reason::END | reason::TERM_CHR);
    }

    #[tokio::test]
    async fn test_write_appends_termination_once() {
        let addr = mock_instrument(b"ok\n").await;
        let adapter = ScpiTcpAdapter::new(device(addr)).unwrap();
        // Already terminated: nothing appended.
        assert_eq!(adapter.write(b"*CLS\n").await.unwrap(), 5);
        // Unterminated: one byte appended.
        assert_eq!(adapter.write(b"*CLS").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_read_timeout_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and stay silent.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let adapter = ScpiTcpAdapter::new(device(addr)).unwrap();
        let err = adapter.read(64, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut cfg = (*device("127.0.0.1:9".parse().unwrap())).clone();
        cfg.io_timeout = Duration::from_millis(200);
        let adapter = ScpiTcpAdapter::new(Arc::new(cfg)).unwrap();
        let err = adapter.write(b"*IDN?").await.unwrap_err();
        assert!(matches!(err, AdapterError::ConnectFailed { .. }));
    }
}
