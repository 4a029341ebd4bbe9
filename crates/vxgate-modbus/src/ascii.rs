// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MODBUS ASCII framing.
//!
//! ADU = `:` + uppercase hex of (unit id + PDU + LRC) + CRLF. The LRC is the
//! two's complement of the 8-bit sum of the binary bytes before hex
//! encoding. Framing is explicit, so no timing rules apply; responses end at
//! the LF.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use vxgate_core::error::AdapterError;
use vxgate_core::types::SerialSettings;

/// Largest ASCII frame the reader accepts.
const MAX_ASCII_FRAME: usize = 513;

/// Computes the longitudinal redundancy check of `data`.
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

fn hex_value(byte: u8) -> Result<u8, AdapterError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        _ => Err(AdapterError::frame(format!(
            "invalid hex digit 0x{:02X} in MODBUS ASCII frame",
            byte
        ))),
    }
}

/// Wraps a PDU into an ASCII ADU.
pub fn build_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut binary = Vec::with_capacity(pdu.len() + 2);
    binary.push(unit_id);
    binary.extend_from_slice(pdu);
    binary.push(lrc(&binary));

    let mut frame = Vec::with_capacity(binary.len() * 2 + 3);
    frame.push(b':');
    for byte in binary {
        frame.extend_from_slice(format!("{:02X}", byte).as_bytes());
    }
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Validates an ASCII ADU and strips framing, returning the PDU.
///
/// `Ok(None)` means the frame belongs to another unit on the bus.
pub fn parse_frame(unit_id: u8, frame: &[u8]) -> Result<Option<Vec<u8>>, AdapterError> {
    if !frame.starts_with(b":") || !frame.ends_with(b"\r\n") {
        return Err(AdapterError::frame("invalid MODBUS ASCII frame delimiters"));
    }
    let hex_payload = &frame[1..frame.len() - 2];
    if hex_payload.len() < 4 || hex_payload.len() % 2 != 0 {
        return Err(AdapterError::frame("invalid MODBUS ASCII payload length"));
    }

    let mut data = Vec::with_capacity(hex_payload.len() / 2);
    for pair in hex_payload.chunks_exact(2) {
        data.push(hex_value(pair[0])? << 4 | hex_value(pair[1])?);
    }

    if data.len() < 3 {
        return Err(AdapterError::frame("MODBUS ASCII payload too short"));
    }

    let checksum = data[data.len() - 1];
    let body = &data[..data.len() - 1];
    let expected = lrc(body);
    if checksum != expected {
        return Err(AdapterError::frame(format!(
            "MODBUS ASCII LRC mismatch: computed 0x{:02X} received 0x{:02X}",
            expected, checksum
        )));
    }

    if body[0] != unit_id {
        return Ok(None);
    }
    Ok(Some(body[1..].to_vec()))
}

/// Performs one ASCII request/response exchange on an open port.
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
    stream
        .write_all(&frame)
        .await
        .map_err(|e| AdapterError::io(&settings.path, e))?;
    stream
        .flush()
        .await
        .map_err(|e| AdapterError::io(&settings.path, e))?;
    trace!(unit_id, len = frame.len(), "ASCII frame sent");

    let deadline = tokio::time::Instant::now() + timeout.max(Duration::from_millis(50));
    let mut line: Vec<u8> = Vec::with_capacity(64);
    let mut started = false;
    let mut byte = [0u8; 1];

    loop {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut byte))
            .await
            .map_err(|_| AdapterError::Timeout { timeout })?
            .map_err(|e| AdapterError::io(&settings.path, e))?;
        if read == 0 {
            return Err(AdapterError::io(&settings.path, "serial port closed"));
        }

        if !started {
            if byte[0] == b':' {
                line.clear();
                line.push(b':');
                started = true;
            }
            continue;
        }

        line.push(byte[0]);
        if line.len() > MAX_ASCII_FRAME {
            return Err(AdapterError::frame("MODBUS ASCII frame too long"));
        }

        if byte[0] == b'\n' {
            match parse_frame(unit_id, &line)? {
                Some(pdu) => return Ok(pdu),
                None => {
                    // Another slave's reply; wait for ours.
                    started = false;
                    line.clear();
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrc_known_vector() {
        // Reference vector: LRC of 01 03 00 64 00 02 is 0x96.
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x02]), 0x96);
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(0x01, &[0x03, 0x00, 0x64, 0x00, 0x02]);
        assert_eq!(frame, b":01030064000296\r\n");
    }

    #[test]
    fn test_parse_frame_round_trip() {
        let frame = build_frame(0x11, &[0x03, 0x02, 0x00, 0x2A]);
        let pdu = parse_frame(0x11, &frame).unwrap().unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_parse_frame_accepts_lowercase_hex() {
        let frame = b":0103026f6b20\r\n";
        // LRC of 01 03 02 6F 6B must be 0x20 for this to parse.
        assert_eq!(lrc(&[0x01, 0x03, 0x02, 0x6F, 0x6B]), 0x20);
        let pdu = parse_frame(0x01, frame).unwrap().unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x6F, 0x6B]);
    }

    #[test]
    fn test_parse_frame_rejects_bad_lrc() {
        let frame = b":010300640002FF\r\n";
        assert!(matches!(
            parse_frame(0x01, frame),
            Err(AdapterError::Frame { .. })
        ));
    }

    #[test]
    fn test_parse_frame_rejects_bad_delimiters() {
        assert!(parse_frame(0x01, b"010300640002 96\r\n").is_err());
        assert!(parse_frame(0x01, b":01030096").is_err());
    }

    #[test]
    fn test_parse_frame_skips_foreign_unit() {
        let frame = build_frame(0x22, &[0x03, 0x02, 0x00, 0x2A]);
        assert_eq!(parse_frame(0x11, &frame).unwrap(), None);
    }

    #[test]
    fn test_parse_frame_rejects_odd_hex() {
        assert!(parse_frame(0x01, b":0103009\r\n").is_err());
    }

    #[tokio::test]
    async fn test_transact_over_pipe() {
        use vxgate_core::types::{ParityMode, StopBitsMode};
        let (mut gateway, mut slave) = tokio::io::duplex(256);
        let settings = SerialSettings {
            path: "/dev/ttyS1".into(),
            baud_rate: 9600,
            data_bits: 7,
            parity: ParityMode::Even,
            stop_bits: StopBitsMode::One,
        };

        let request = build_frame(0x01, &[0x03, 0x00, 0x64, 0x00, 0x02]);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = slave.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &request[..]);
            // Noise before the frame start and a foreign reply are skipped.
            slave.write_all(b"garbage").await.unwrap();
            let foreign = build_frame(0x09, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);
            slave.write_all(&foreign).await.unwrap();
            let response = build_frame(0x01, &[0x03, 0x04, 0x41, 0xC8, 0x00, 0x00]);
            slave.write_all(&response).await.unwrap();
        });

        let pdu = transact(
            &mut gateway,
            0x01,
            &settings,
            &[0x03, 0x00, 0x64, 0x00, 0x02],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(pdu, vec![0x03, 0x04, 0x41, 0xC8, 0x00, 0x00]);
    }
}
