// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Generic regex-template adapter.
//!
//! For bespoke ASCII protocols that are neither SCPI nor MODBUS: each rule
//! renders the wire request from the command's capture groups, then parses
//! the wire response with its own regex and renders the reply the client
//! reads back. Responses are framed by a terminator (or device prompt);
//! scaling options convert between human units and fixed-point payloads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use vxgate_core::adapter::{InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::mapping::{GenericExchange, GenericRule, GenericRuleSet};
use vxgate_core::serial::{SerialBus, SerialBusArbiter};
use vxgate_core::types::{
    DeviceConfig, DeviceRules, GenericTransport, SerialSettings, TcpEndpoint, TransportKind,
    TransportParams,
};

/// Upper bound on a single wire response.
const MAX_RESPONSE_BYTES: usize = 4096;

enum Wire {
    Tcp {
        endpoint: TcpEndpoint,
        stream: Mutex<Option<TcpStream>>,
    },
    Serial {
        settings: SerialSettings,
        arbiter: Arc<SerialBusArbiter>,
        bus: Mutex<Option<Arc<SerialBus>>>,
    },
}

/// Adapter mapping commands through configurable regex rules.
pub struct GenericRegexAdapter {
    device: Arc<DeviceConfig>,
    rules: Arc<GenericRuleSet>,
    wire: Wire,
    staged: Mutex<Vec<u8>>,
}

impl GenericRegexAdapter {
    /// Builds the adapter; performs no I/O.
    pub fn new(
        device: Arc<DeviceConfig>,
        arbiter: Arc<SerialBusArbiter>,
    ) -> Result<Self, AdapterError> {
        let wire = match &device.transport {
            TransportParams::Generic(GenericTransport::Tcp(endpoint)) => Wire::Tcp {
                endpoint: endpoint.clone(),
                stream: Mutex::new(None),
            },
            TransportParams::Generic(GenericTransport::Serial(settings)) => Wire::Serial {
                settings: settings.clone(),
                arbiter,
                bus: Mutex::new(None),
            },
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a generic-regex device",
                    device.name
                )))
            }
        };
        let rules = match &device.rules {
            DeviceRules::Generic(rules) => rules.clone(),
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} has no generic-regex mapping rules",
                    device.name
                )))
            }
        };
        Ok(Self {
            device,
            rules,
            wire,
            staged: Mutex::new(Vec::new()),
        })
    }

    async fn stage(&self, text: String) {
        let mut staged = self.staged.lock().await;
        *staged = text.into_bytes();
        if !staged.ends_with(b"\n") {
            staged.push(b'\n');
        }
    }

    /// Sends the request and, when the rule expects one, collects and
    /// parses the wire response.
    async fn exchange(
        &self,
        payload: &[u8],
        rule: &GenericRule,
    ) -> Result<Option<String>, AdapterError> {
        let timeout = self.device.io_timeout;
        match &self.wire {
            Wire::Tcp { endpoint, stream } => {
                let mut guard = stream.lock().await;
                if guard.is_none() {
                    let address = endpoint.address();
                    let opened = tokio::time::timeout(timeout, TcpStream::connect(&address))
                        .await
                        .map_err(|_| AdapterError::Timeout { timeout })?
                        .map_err(|e| AdapterError::connect_failed(&address, e))?;
                    debug!(%address, device = %self.device.name, "generic TCP connected");
                    *guard = Some(opened);
                }
                let address = endpoint.address();
                let stream = guard
                    .as_mut()
                    .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;

                let result =
                    Self::exchange_on(stream, &address, payload, rule, timeout).await;
                if result.is_err() {
                    *guard = None;
                }
                result
            }
            Wire::Serial { settings, bus, .. } => {
                let bus = bus
                    .lock()
                    .await
                    .clone()
                    .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;
                let mut txn = bus.transaction().await?;
                let result =
                    Self::exchange_on(txn.stream(), &settings.path, payload, rule, timeout).await;
                if result.is_err() {
                    txn.invalidate();
                }
                result
            }
        }
    }

    async fn exchange_on<S>(
        stream: &mut S,
        target: &str,
        payload: &[u8],
        rule: &GenericRule,
        timeout: Duration,
    ) -> Result<Option<String>, AdapterError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        tokio::time::timeout_at(deadline, async {
            stream.write_all(payload).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| AdapterError::Timeout { timeout })?
        .map_err(|e| AdapterError::io(target, e))?;

        if !rule.expects_response {
            return Ok(None);
        }
        let terminator = rule.terminator.clone().unwrap_or_else(|| "\n".to_string());

        let mut buffer: Vec<u8> = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            if buffer.len() >= MAX_RESPONSE_BYTES {
                return Err(AdapterError::frame("generic response exceeds size limit"));
            }
            let read = tokio::time::timeout_at(deadline, stream.read(&mut byte))
                .await
                .map_err(|_| AdapterError::Timeout { timeout })?
                .map_err(|e| AdapterError::io(target, e))?;
            if read == 0 {
                return Err(AdapterError::io(target, "connection closed by device"));
            }
            buffer.push(byte[0]);

            let text = String::from_utf8_lossy(&buffer);
            if let Some(end) = text.find(&terminator) {
                let candidate = text[..end].trim_end_matches(['\r', '\n']).to_string();
                let rendered = rule.render_response(&candidate)?;
                return Ok(Some(rendered));
            }
        }
    }
}

#[async_trait]
impl InstrumentAdapter for GenericRegexAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::GenericRegex
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if let Wire::Serial {
            settings,
            arbiter,
            bus,
        } = &self.wire
        {
            let mut guard = bus.lock().await;
            if guard.is_none() {
                *guard = Some(arbiter.attach(settings)?);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.staged.lock().await.clear();
        match &self.wire {
            Wire::Tcp { stream, .. } => {
                if let Some(mut stream) = stream.lock().await.take() {
                    let _ = stream.shutdown().await;
                }
            }
            Wire::Serial { arbiter, bus, .. } => {
                if let Some(bus) = bus.lock().await.take() {
                    arbiter.detach(&bus);
                }
            }
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        match &self.wire {
            Wire::Tcp { endpoint, stream } => {
                let mut guard = stream.lock().await;
                if guard.is_none() {
                    let address = endpoint.address();
                    let timeout = self.device.io_timeout;
                    let opened = tokio::time::timeout(timeout, TcpStream::connect(&address))
                        .await
                        .map_err(|_| AdapterError::Timeout { timeout })?
                        .map_err(|e| AdapterError::connect_failed(&address, e))?;
                    *guard = Some(opened);
                }
                Ok(())
            }
            Wire::Serial { bus, .. } => {
                let bus = bus
                    .lock()
                    .await
                    .clone()
                    .ok_or_else(|| AdapterError::not_connected(&self.device.name))?;
                bus.transaction().await.map(|_| ())
            }
        }
    }

    async fn release(&self) {
        self.staged.lock().await.clear();
        if let Wire::Tcp { stream, .. } = &self.wire {
            if let Some(mut stream) = stream.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = std::str::from_utf8(data)
            .map_err(|_| AdapterError::invalid_command("command is not valid UTF-8"))?
            .trim_end_matches(['\r', '\n']);
        if command.is_empty() {
            return Err(AdapterError::invalid_command("empty command"));
        }

        match self.rules.prepare(command)? {
            GenericExchange::Static(text) => {
                self.stage(text).await;
            }
            GenericExchange::Request { payload, rule } => {
                debug!(device = %self.device.name, request = %payload, "generic exchange");
                match self.exchange(payload.as_bytes(), rule).await? {
                    Some(rendered) => self.stage(rendered).await,
                    None => self.staged.lock().await.clear(),
                }
            }
        }
        Ok(data.len())
    }

    async fn read(&self, max_len: usize, _timeout: Duration) -> Result<ReadPayload, AdapterError> {
        let mut staged = self.staged.lock().await;
        if staged.is_empty() {
            return Ok(ReadPayload::empty());
        }
        let take = staged.len().min(max_len.max(1));
        let data: Vec<u8> = staged.drain(..take).collect();
        if staged.is_empty() {
            Ok(ReadPayload::end(data))
        } else {
            Ok(ReadPayload { data, reason: 0 })
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
    use vxgate_core::mapping::GenericRuleSpec;
    use vxgate_core::reason;

    fn device(addr: std::net::SocketAddr, specs: Vec<GenericRuleSpec>) -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            name: "chiller".into(),
            kind: TransportKind::GenericRegex,
            transport: TransportParams::Generic(GenericTransport::Tcp(TcpEndpoint {
                host: addr.ip().to_string(),
                port: addr.port(),
            })),
            requires_lock: false,
            io_timeout: Duration::from_millis(500),
            write_termination: None,
            read_termination: None,
            rules: DeviceRules::Generic(Arc::new(GenericRuleSet::compile(specs).unwrap())),
        })
    }

    async fn mock_device(reply: &'static [u8]) -> std::net::SocketAddr {
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

    #[tokio::test]
    async fn test_scaled_query_round_trip() {
        let addr = mock_device(b"C02345\r\n").await;
        let adapter = GenericRegexAdapter::new(
            device(
                addr,
                vec![GenericRuleSpec {
                    pattern: r"TEMP\?".into(),
                    request_format: Some("RT1\r".into()),
                    expects_response: true,
                    response_regex: Some(r"C(?P<payload>-?\d+)".into()),
                    response_format: Some("$payload".into()),
                    response_scale: Some(100.0),
                    terminator: Some("\n".into()),
                    ..Default::default()
                }],
            ),
            Arc::new(SerialBusArbiter::new()),
        )
        .unwrap();

        adapter.write(b"TEMP?\n").await.unwrap();
        let payload = adapter.read(64, Duration::from_millis(500)).await.unwrap();
        assert_eq!(payload.data, b"23.45\n");
        assert_eq!(payload.reason, reason::END);
    }

    #[tokio::test]
    async fn test_static_rule_needs_no_device() {
        // Endpoint nobody listens on: static rules must not touch it.
        let addr: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();
        let adapter = GenericRegexAdapter::new(
            device(
                addr,
                vec![GenericRuleSpec {
                    pattern: r"\*IDN\?".into(),
                    response: Some("ACME,chiller,0,2.1".into()),
                    ..Default::default()
                }],
            ),
            Arc::new(SerialBusArbiter::new()),
        )
        .unwrap();

        adapter.write(b"*IDN?\n").await.unwrap();
        let payload = adapter.read(64, Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload.data, b"ACME,chiller,0,2.1\n");
    }

    #[tokio::test]
    async fn test_fire_and_forget_rule_stages_nothing() {
        let addr = mock_device(b"ignored").await;
        let adapter = GenericRegexAdapter::new(
            device(
                addr,
                vec![GenericRuleSpec {
                    pattern: r"RUN (\d)".into(),
                    request_format: Some("GO$1\r".into()),
                    expects_response: false,
                    ..Default::default()
                }],
            ),
            Arc::new(SerialBusArbiter::new()),
        )
        .unwrap();

        adapter.write(b"RUN 1\n").await.unwrap();
        assert!(adapter
            .read(64, Duration::from_millis(100))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_command() {
        let addr = mock_device(b"x").await;
        let adapter = GenericRegexAdapter::new(
            device(
                addr,
                vec![GenericRuleSpec {
                    pattern: r"TEMP\?".into(),
                    request_format: Some("RT1".into()),
                    ..Default::default()
                }],
            ),
            Arc::new(SerialBusArbiter::new()),
        )
        .unwrap();
        assert!(matches!(
            adapter.write(b"HUMID?\n").await,
            Err(AdapterError::Mapping(_))
        ));
    }
}
