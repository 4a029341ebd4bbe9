// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! USBTMC (USB Test & Measurement Class) adapter.
//!
//! Frames SCPI traffic in USBTMC bulk transfers: DEV_DEP_MSG_OUT on the
//! Bulk-OUT endpoint, REQUEST_DEV_DEP_MSG_IN + Bulk-IN drain for reads, with
//! the alternating transfer tag and EOM attribute the class requires.
//! Devices are selected by VID/PID and, when several match, by serial
//! number string.
//!
//! libusb calls block, so every transfer runs under `spawn_blocking`;
//! endpoints are exclusive, hence `requires_lock` defaults to true.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusb::{Direction, GlobalContext, TransferType, UsbContext};
use tokio::sync::Mutex;
use tracing::debug;

use vxgate_core::adapter::{reason, InstrumentAdapter, ReadPayload};
use vxgate_core::error::AdapterError;
use vxgate_core::types::{DeviceConfig, TransportKind, TransportParams, UsbSelector};

/// USBTMC interface class / subclass.
const USBTMC_CLASS: u8 = 0xFE;
const USBTMC_SUBCLASS: u8 = 0x03;

/// Bulk-OUT message: device-dependent message with data.
const DEV_DEP_MSG_OUT: u8 = 1;
/// Bulk-OUT message: request a device-dependent message on Bulk-IN.
const REQUEST_DEV_DEP_MSG_IN: u8 = 2;

/// Transfer-attribute bit: end of message.
const ATTR_EOM: u8 = 0x01;

/// USBTMC transfer header length.
const HEADER_SIZE: usize = 12;

struct UsbTmcHandle {
    handle: rusb::DeviceHandle<GlobalContext>,
    interface: u8,
    bulk_out: u8,
    bulk_in: u8,
}

impl Drop for UsbTmcHandle {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

fn map_usb_error(selector: &UsbSelector, error: rusb::Error, timeout: Duration) -> AdapterError {
    let target = format!("{:04x}:{:04x}", selector.vendor_id, selector.product_id);
    match error {
        rusb::Error::Timeout => AdapterError::Timeout { timeout },
        other => AdapterError::io(target, other),
    }
}

/// Locates and claims the USBTMC interface of the selected device.
fn open_device(selector: &UsbSelector) -> Result<UsbTmcHandle, AdapterError> {
    let target = format!("{:04x}:{:04x}", selector.vendor_id, selector.product_id);
    let devices = GlobalContext::default()
        .devices()
        .map_err(|e| AdapterError::connect_failed(&target, e))?;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != selector.vendor_id
            || descriptor.product_id() != selector.product_id
        {
            continue;
        }

        let mut handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                return Err(AdapterError::connect_failed(&target, e));
            }
        };

        if let Some(wanted) = &selector.serial_number {
            let serial = handle
                .read_serial_number_string_ascii(&descriptor)
                .unwrap_or_default();
            if &serial != wanted {
                continue;
            }
        }

        let config = device
            .active_config_descriptor()
            .map_err(|e| AdapterError::connect_failed(&target, e))?;

        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                if descriptor.class_code() != USBTMC_CLASS
                    || descriptor.sub_class_code() != USBTMC_SUBCLASS
                {
                    continue;
                }

                let mut bulk_out = None;
                let mut bulk_in = None;
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::Out => bulk_out = Some(endpoint.address()),
                        Direction::In => bulk_in = Some(endpoint.address()),
                    }
                }

                let (bulk_out, bulk_in) = match (bulk_out, bulk_in) {
                    (Some(o), Some(i)) => (o, i),
                    _ => continue,
                };

                let number = descriptor.interface_number();
                let _ = handle.set_auto_detach_kernel_driver(true);
                handle
                    .claim_interface(number)
                    .map_err(|e| AdapterError::connect_failed(&target, e))?;

                debug!(
                    target = %target,
                    interface = number,
                    bulk_out,
                    bulk_in,
                    "USBTMC interface claimed"
                );
                return Ok(UsbTmcHandle {
                    handle,
                    interface: number,
                    bulk_out,
                    bulk_in,
                });
            }
        }
    }

    Err(AdapterError::connect_failed(
        &target,
        "no matching USBTMC device found",
    ))
}

// =============================================================================
// UsbTmcAdapter
// =============================================================================

/// Adapter for USBTMC instruments.
pub struct UsbTmcAdapter {
    device: Arc<DeviceConfig>,
    selector: UsbSelector,
    state: Mutex<Option<Arc<UsbTmcHandle>>>,
    tag: AtomicU8,
}

impl UsbTmcAdapter {
    /// Builds the adapter; performs no USB access.
    pub fn new(device: Arc<DeviceConfig>) -> Result<Self, AdapterError> {
        let selector = match &device.transport {
            TransportParams::Usbtmc(selector) => selector.clone(),
            _ => {
                return Err(AdapterError::config(format!(
                    "device {:?} is not a usbtmc device",
                    device.name
                )))
            }
        };
        Ok(Self {
            device,
            selector,
            state: Mutex::new(None),
            tag: AtomicU8::new(1),
        })
    }

    fn next_tag(&self) -> u8 {
        loop {
            let tag = self.tag.fetch_add(1, Ordering::SeqCst);
            if tag != 0 {
                return tag;
            }
        }
    }

    async fn handle(&self) -> Result<Arc<UsbTmcHandle>, AdapterError> {
        self.state
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::not_connected(&self.device.name))
    }
}

fn msg_out_transfer(tag: u8, data: &[u8]) -> Vec<u8> {
    let mut transfer = Vec::with_capacity(HEADER_SIZE + data.len() + 3);
    transfer.push(DEV_DEP_MSG_OUT);
    transfer.push(tag);
    transfer.push(!tag);
    transfer.push(0);
    transfer.extend_from_slice(&(data.len() as u32).to_le_bytes());
    transfer.push(ATTR_EOM);
    transfer.extend_from_slice(&[0, 0, 0]);
    transfer.extend_from_slice(data);
    while transfer.len() % 4 != 0 {
        transfer.push(0);
    }
    transfer
}

fn msg_in_request(tag: u8, max_len: usize) -> Vec<u8> {
    let mut transfer = Vec::with_capacity(HEADER_SIZE);
    transfer.push(REQUEST_DEV_DEP_MSG_IN);
    transfer.push(tag);
    transfer.push(!tag);
    transfer.push(0);
    transfer.extend_from_slice(&(max_len as u32).to_le_bytes());
    transfer.extend_from_slice(&[0, 0, 0, 0]);
    transfer
}

#[async_trait]
impl InstrumentAdapter for UsbTmcAdapter {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usbtmc
    }

    fn requires_lock(&self) -> bool {
        self.device.requires_lock
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let selector = self.selector.clone();
        let handle = tokio::task::spawn_blocking(move || open_device(&selector))
            .await
            .map_err(|e| AdapterError::io("usb", e))??;
        *state = Some(Arc::new(handle));
        Ok(())
    }

    async fn release(&self) {
        // Dropping the handle releases the claimed interface.
        self.state.lock().await.take();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let handle = self.handle().await?;

        let mut payload = data.to_vec();
        if let Some(term) = &self.device.write_termination {
            if !payload.ends_with(term) {
                payload.extend_from_slice(term);
            }
        }

        let transfer = msg_out_transfer(self.next_tag(), &payload);
        let timeout = self.device.io_timeout;
        let selector = self.selector.clone();
        let accepted = payload.len();

        tokio::task::spawn_blocking(move || {
            handle
                .handle
                .write_bulk(handle.bulk_out, &transfer, timeout)
                .map_err(|e| map_usb_error(&selector, e, timeout))
        })
        .await
        .map_err(|e| AdapterError::io("usb", e))??;

        Ok(accepted)
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<ReadPayload, AdapterError> {
        let handle = self.handle().await?;
        let request = msg_in_request(self.next_tag(), max_len.max(1));
        let selector = self.selector.clone();
        let want = max_len.max(1);

        let (data, eom) = tokio::task::spawn_blocking(move || {
            handle
                .handle
                .write_bulk(handle.bulk_out, &request, timeout)
                .map_err(|e| map_usb_error(&selector, e, timeout))?;

            let mut buffer = vec![0u8; HEADER_SIZE + want + 3];
            let read = handle
                .handle
                .read_bulk(handle.bulk_in, &mut buffer, timeout)
                .map_err(|e| map_usb_error(&selector, e, timeout))?;

            if read < HEADER_SIZE {
                return Err(AdapterError::frame("short USBTMC response header"));
            }
            let size = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
            let available = read - HEADER_SIZE;
            let take = size.min(available).min(want);
            let eom = buffer[8] & ATTR_EOM != 0;
            Ok((buffer[HEADER_SIZE..HEADER_SIZE + take].to_vec(), eom))
        })
        .await
        .map_err(|e| AdapterError::io("usb", e))??;

        let mut bits = 0;
        if eom {
            bits |= reason::END;
        }
        if data.len() >= want {
            bits |= reason::REQCNT;
        }
        Ok(ReadPayload { data, reason: bits })
    }
}

// =============================================================================
// Tests
// =============================================================================
