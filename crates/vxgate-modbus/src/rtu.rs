// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MODBUS RTU framing.
//!
//! ADU = unit id + PDU + CRC-16 (poly 0xA001, init 0xFFFF), CRC transmitted
//! low byte first. Frame boundaries are timing-based: the bus must be silent
//! for at least 3.5 character times before a frame, and a gap of 1.75
//! character times after the last byte ends one. Both intervals derive from
//! the configured line settings.

use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use vxgate_core::error::AdapterError;
use vxgate_core::types::SerialSettings;

use crate::pdu::expected_rtu_frame_length;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes the MODBUS CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Silence required before transmitting, per the RTU timing rules.
pub fn guard_time(settings: &SerialSettings) -> Duration {
    // 3.5 character times, floored at the MODBUS minimum for fast links.
    let t = settings.char_time() * 7 / 2;
    t.max(Duration::from_micros(1750))
}

/// Inter-byte gap that terminates a frame.
pub fn frame_gap(settings: &SerialSettings) -> Duration {
    let t = settings.char_time() * 7 / 4;
    t.max(Duration::from_micros(750))
}

/// Wraps a PDU into an RTU ADU.
pub fn build_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Validates an ADU's CRC and strips framing, returning the PDU.
pub fn parse_frame(unit_id: u8, frame: &[u8]) -> Result<Option<Vec<u8>>, AdapterError> {
    if frame.len() < 4 {
        return Err(AdapterError::frame("MODBUS RTU frame too short"));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(AdapterError::frame(format!(
            "MODBUS RTU CRC mismatch: computed 0x{:04X} received 0x{:04X}",
            computed, received
        )));
    }
    if body[0] != unit_id {
        // A frame for another slave on the bus; skip it.
        return Ok(None);
    }
    Ok(Some(body[1..].to_vec()))
}

/// Performs one RTU request/response exchange on an open port.
///
/// The caller must hold the serial-bus arbiter for the whole call.
pub async fn transact<S>(
    stream: &mut S,
    unit_id: u8,
    settings: &SerialSettings,
    pdu: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = build_frame(unit_id, pdu);

    // Respect inter-frame silence before taking the bus.
    tokio::time::sleep(guard_time(settings)).await;

    stream
        .write_all(&frame)
        .await
        .map_err(|e| AdapterError::io(&settings.path, e))?;
    stream
        .flush()
        .await
        .map_err(|e| AdapterError::io(&settings.path, e))?;
    trace!(unit_id, len = frame.len(), "RTU frame sent");

    read_response(stream, unit_id, settings, timeout).await
}

async fn read_response<S>(
    stream: &mut S,
    unit_id: u8,
    settings: &SerialSettings,
    timeout: Duration,
) -> Result<Vec<u8>, AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout.max(Duration::from_millis(50));
    let gap = frame_gap(settings);

    let mut buffer: Vec<u8> = Vec::with_capacity(64);
    let mut expected: Option<usize> = None;
    let mut byte = [0u8; 1];

    loop {
        // Once a frame has started, a quiet gap longer than 1.75 character
        // times also terminates it; otherwise wait out the caller deadline.
        let limit = if buffer.is_empty() {
            deadline
        } else {
            (tokio::time::Instant::now() + gap).min(deadline)
        };

        let read = tokio::time::timeout_at(limit, stream.read(&mut byte)).await;
        match read {
            Ok(Ok(0)) => {
                return Err(AdapterError::io(&settings.path, "serial port closed"));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(AdapterError::io(&settings.path, e)),
            Err(_) if tokio::time::Instant::now() >= deadline => {
                return Err(AdapterError::Timeout { timeout });
            }
            Err(_) => {
                // Inter-byte gap elapsed mid-frame: treat what we have as a
                // complete frame attempt below, or resync.
                if let Some(result) = try_complete(unit_id, &mut buffer, &mut expected)? {
                    return Ok(result);
                }
                buffer.clear();
                expected = None;
                continue;
            }
        }

        buffer.push(byte[0]);

        // Resync: a frame must open with our unit id or an address we skip
        // wholesale once its length is known.
        if expected.is_none() {
            expected = expected_rtu_frame_length(&buffer);
        }

        if let Some(len) = expected {
            if buffer.len() >= len {
                if let Some(result) = try_complete(unit_id, &mut buffer, &mut expected)? {
                    return Ok(result);
                }
            }
        }
    }
}

/// Attempts to parse `buffer` as a complete frame for `unit_id`.
///
/// Returns `Ok(Some(pdu))` on success, `Ok(None)` after skipping a foreign
/// frame (buffer is reset), or an error on checksum/length violations.
fn try_complete(
    unit_id: u8,
    buffer: &mut Vec<u8>,
    expected: &mut Option<usize>,
) -> Result<Option<Vec<u8>>, AdapterError> {
    let len = match *expected {
        Some(len) if buffer.len() >= len => len,
        _ => return Ok(None),
    };
    let frame: Vec<u8> = buffer.drain(..len).collect();
    *expected = None;
    match parse_frame(unit_id, &frame)? {
        Some(pdu) => Ok(Some(pdu)),
        None => {
            buffer.clear();
            Ok(None)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vxgate_core::types::{ParityMode, StopBitsMode};

    fn settings() -> SerialSettings {
        SerialSettings {
            path: "/dev/ttyS0".into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityMode::None,
            stop_bits: StopBitsMode::One,
        }
    }

    #[test]
    fn test_crc16_known_vector() {
        // Reference vector: CRC-16/MODBUS of 01 04 02 FF FF is 0x80B8.
        assert_eq!(crc16(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
    }

    #[test]
    fn test_build_frame_appends_crc_little_endian() {
        let frame = build_frame(0x01, &[0x04, 0x02, 0xFF, 0xFF]);
        assert_eq!(frame, vec![0x01, 0x04, 0x02, 0xFF, 0xFF, 0xB8, 0x80]);
    }

    #[test]
    fn test_parse_frame_round_trip() {
        let frame = build_frame(0x05, &[0x03, 0x02, 0x00, 0x2A]);
        let pdu = parse_frame(0x05, &frame).unwrap().unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_parse_frame_rejects_bad_crc() {
        let mut frame = build_frame(0x05, &[0x03, 0x02, 0x00, 0x2A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_frame(0x05, &frame),
            Err(AdapterError::Frame { .. })
        ));
    }

    #[test]
    fn test_parse_frame_skips_foreign_unit() {
        let frame = build_frame(0x09, &[0x03, 0x02, 0x00, 0x2A]);
        assert_eq!(parse_frame(0x05, &frame).unwrap(), None);
    }

    #[test]
    fn test_timing_scales_with_baud_rate() {
        let s = settings();
        // 9600 baud: guard well above the timing floor.
        assert!(guard_time(&s) >= Duration::from_millis(3));
        assert!(frame_gap(&s) >= Duration::from_micros(1750));

        let fast = SerialSettings {
            baud_rate: 115_200,
            ..s
        };
        // Fast links hit the fixed timing floors.
        assert_eq!(guard_time(&fast), Duration::from_micros(1750));
        assert_eq!(frame_gap(&fast), Duration::from_micros(750));
    }

    #[tokio::test]
    async fn test_transact_over_pipe() {
        let (mut gateway, mut slave) = tokio::io::duplex(256);
        let s = settings();

        let request = build_frame(0x01, &[0x04, 0x00, 0x64, 0x00, 0x01]);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = slave.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &request[..]);
            // A reply for another slave arrives first; ours follows.
            let foreign = build_frame(0x07, &[0x04, 0x02, 0x00, 0x01]);
            let response = build_frame(0x01, &[0x04, 0x02, 0xFF, 0xFF]);
            slave.write_all(&foreign).await.unwrap();
            slave.write_all(&response).await.unwrap();
        });

        let pdu = transact(
            &mut gateway,
            0x01,
            &s,
            &[0x04, 0x00, 0x64, 0x00, 0x01],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(pdu, vec![0x04, 0x02, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_transact_surfaces_exception() {
        let (mut gateway, mut slave) = tokio::io::duplex(256);
        let s = settings();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = slave.read(&mut buf).await.unwrap();
            let response = build_frame(0x01, &[0x84, 0x02]);
            slave.write_all(&response).await.unwrap();
        });

        // The exception PDU comes back intact; the caller classifies it.
        let pdu = transact(
            &mut gateway,
            0x01,
            &s,
            &[0x04, 0x00, 0x64, 0x00, 0x01],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(pdu, vec![0x84, 0x02]);
    }

    #[tokio::test]
    async fn test_transact_times_out_on_silence() {
        let (mut gateway, _slave) = tokio::io::duplex(256);
        let s = settings();
        let err = transact(
            &mut gateway,
            0x01,
            &s,
            &[0x04, 0x00, 0x64, 0x00, 0x01],
            Duration::from_millis(60),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }
}
