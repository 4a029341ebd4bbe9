// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MODBUS PDU construction and parsing.
//!
//! A PDU is the framing-independent core of every MODBUS exchange:
//! function code plus payload. The TCP, RTU, and ASCII transports wrap the
//! same PDUs in their own ADUs. Requests are built from mapping-engine
//! actions; responses are parsed back into registers, bits, or write
//! acknowledgements, with exception PDUs surfaced as typed errors.

use vxgate_core::error::AdapterError;
use vxgate_core::mapping::{ModbusAction, ModbusOp};

/// Largest PDU either side may produce (function code + 252 payload bytes).
pub const MAX_PDU_SIZE: usize = 253;

/// A parsed MODBUS response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseValue {
    /// Register contents from FC 0x03 / 0x04.
    Registers(Vec<u16>),
    /// Coil / discrete-input states from FC 0x01 / 0x02.
    Bits(Vec<bool>),
    /// Echo acknowledgement of a write.
    WriteAck,
}

// =============================================================================
// Request construction
// =============================================================================

/// Builds the request PDU for a translated action.
pub fn build_request(action: &ModbusAction) -> Result<Vec<u8>, AdapterError> {
    let fc = action.op.function_code();
    let mut pdu = Vec::with_capacity(8);
    pdu.push(fc);
    pdu.extend_from_slice(&action.address.to_be_bytes());

    match action.op {
        ModbusOp::ReadCoils
        | ModbusOp::ReadDiscreteInputs
        | ModbusOp::ReadHoldingRegisters
        | ModbusOp::ReadInputRegisters => {
            pdu.extend_from_slice(&action.count.to_be_bytes());
        }
        ModbusOp::WriteSingleCoil => {
            let on = action.coils.first().copied().ok_or_else(|| {
                AdapterError::frame("write_single_coil action carries no coil state")
            })?;
            let value: u16 = if on { 0xFF00 } else { 0x0000 };
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        ModbusOp::WriteSingleRegister => {
            let value = action.values.first().copied().ok_or_else(|| {
                AdapterError::frame("write_single_register action carries no value")
            })?;
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        ModbusOp::WriteMultipleCoils => {
            if action.coils.is_empty() {
                return Err(AdapterError::frame(
                    "write_multiple_coils action carries no coil states",
                ));
            }
            let count = action.coils.len() as u16;
            let byte_count = action.coils.len().div_ceil(8);
            pdu.extend_from_slice(&count.to_be_bytes());
            pdu.push(byte_count as u8);
            let mut packed = vec![0u8; byte_count];
            for (i, &on) in action.coils.iter().enumerate() {
                if on {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            pdu.extend_from_slice(&packed);
        }
        ModbusOp::WriteMultipleRegisters => {
            if action.values.is_empty() {
                return Err(AdapterError::frame(
                    "write_holding_registers action carries no values",
                ));
            }
            let count = action.values.len() as u16;
            pdu.extend_from_slice(&count.to_be_bytes());
            pdu.push((action.values.len() * 2) as u8);
            for value in &action.values {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    Ok(pdu)
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parses a response PDU against the action that produced the request.
pub fn parse_response(action: &ModbusAction, pdu: &[u8]) -> Result<ResponseValue, AdapterError> {
    let expected_fc = action.op.function_code();
    let function = *pdu
        .first()
        .ok_or_else(|| AdapterError::frame("empty MODBUS response PDU"))?;

    if function & 0x80 != 0 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(AdapterError::ModbusException { function, code });
    }
    if function != expected_fc {
        return Err(AdapterError::frame(format!(
            "unexpected function code in response: expected=0x{:02X} got=0x{:02X}",
            expected_fc, function
        )));
    }

    match action.op {
        ModbusOp::ReadHoldingRegisters | ModbusOp::ReadInputRegisters => {
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| AdapterError::frame("response missing byte count"))? as usize;
            let data = pdu
                .get(2..2 + byte_count)
                .ok_or_else(|| AdapterError::frame("incomplete register payload"))?;
            if byte_count % 2 != 0 {
                return Err(AdapterError::frame("register payload length must be even"));
            }
            let registers = data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(ResponseValue::Registers(registers))
        }
        ModbusOp::ReadCoils | ModbusOp::ReadDiscreteInputs => {
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| AdapterError::frame("response missing byte count"))? as usize;
            let payload = pdu
                .get(2..2 + byte_count)
                .ok_or_else(|| AdapterError::frame("incomplete coil payload"))?;
            let bits = (0..action.count as usize)
                .map(|i| {
                    payload
                        .get(i / 8)
                        .map(|byte| byte >> (i % 8) & 0x01 == 1)
                        .unwrap_or(false)
                })
                .collect();
            Ok(ResponseValue::Bits(bits))
        }
        ModbusOp::WriteSingleCoil
        | ModbusOp::WriteSingleRegister
        | ModbusOp::WriteMultipleCoils
        | ModbusOp::WriteMultipleRegisters => {
            // Echo responses carry address and value/count; accept them as-is.
            Ok(ResponseValue::WriteAck)
        }
    }
}

/// Expected response frame length once the first three ADU bytes are known.
///
/// `buffer` holds unit id, function code, and the first payload byte. Used
/// by the RTU reader to know when a frame is complete.
pub fn expected_rtu_frame_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 3 {
        return None;
    }
    let function = buffer[1];

    if function & 0x80 != 0 {
        // unit + fc + exception + crc(2)
        return Some(5);
    }
    match function {
        0x01..=0x04 => {
            let byte_count = buffer[2] as usize;
            // unit + fc + byte_count + payload + crc(2)
            Some(3 + byte_count + 2)
        }
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vxgate_core::mapping::DataType;

    fn action(op: ModbusOp) -> ModbusAction {
        ModbusAction {
            op,
            address: 100,
            count: 2,
            values: Vec::new(),
            coils: Vec::new(),
            data_type: DataType::Float32Be,
            response_scale: None,
        }
    }

    #[test]
    fn test_read_holding_request_layout() {
        let pdu = build_request(&action(ModbusOp::ReadHoldingRegisters)).unwrap();
        assert_eq!(pdu, vec![0x03, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn test_write_single_register_request() {
        let mut a = action(ModbusOp::WriteSingleRegister);
        a.values = vec![0x1234];
        let pdu = build_request(&a).unwrap();
        assert_eq!(pdu, vec![0x06, 0x00, 0x64, 0x12, 0x34]);
    }

    #[test]
    fn test_write_single_coil_uses_ff00() {
        let mut a = action(ModbusOp::WriteSingleCoil);
        a.coils = vec![true];
        assert_eq!(build_request(&a).unwrap(), vec![0x05, 0x00, 0x64, 0xFF, 0x00]);
        a.coils = vec![false];
        assert_eq!(build_request(&a).unwrap(), vec![0x05, 0x00, 0x64, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_registers_request() {
        let mut a = action(ModbusOp::WriteMultipleRegisters);
        a.values = vec![0x41C8, 0x0000];
        let pdu = build_request(&a).unwrap();
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x64, 0x00, 0x02, 0x04, 0x41, 0xC8, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_multiple_coils_packs_lsb_first() {
        let mut a = action(ModbusOp::WriteMultipleCoils);
        a.coils = vec![true, false, true, true]; // 0b1101 = 0x0D
        let pdu = build_request(&a).unwrap();
        assert_eq!(pdu, vec![0x0F, 0x00, 0x64, 0x00, 0x04, 0x01, 0x0D]);
    }

    #[test]
    fn test_parse_register_response() {
        let a = action(ModbusOp::ReadHoldingRegisters);
        let response = [0x03, 0x04, 0x41, 0xC8, 0x00, 0x00];
        assert_eq!(
            parse_response(&a, &response).unwrap(),
            ResponseValue::Registers(vec![0x41C8, 0x0000])
        );
    }

    #[test]
    fn test_parse_coil_response() {
        let mut a = action(ModbusOp::ReadCoils);
        a.count = 4;
        let response = [0x01, 0x01, 0b0000_1101];
        assert_eq!(
            parse_response(&a, &response).unwrap(),
            ResponseValue::Bits(vec![true, false, true, true])
        );
    }

    #[test]
    fn test_parse_exception_response() {
        let a = action(ModbusOp::ReadHoldingRegisters);
        let err = parse_response(&a, &[0x83, 0x02]).unwrap_err();
        match err {
            AdapterError::ModbusException { function, code } => {
                assert_eq!(function, 0x83);
                assert_eq!(code, 0x02);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_mismatched_function_code() {
        let a = action(ModbusOp::ReadHoldingRegisters);
        assert!(matches!(
            parse_response(&a, &[0x04, 0x02, 0x00, 0x01]),
            Err(AdapterError::Frame { .. })
        ));
    }

    #[test]
    fn test_parse_truncated_response() {
        let a = action(ModbusOp::ReadHoldingRegisters);
        assert!(parse_response(&a, &[0x03, 0x04, 0x41]).is_err());
        assert!(parse_response(&a, &[]).is_err());
    }

    #[test]
    fn test_expected_rtu_frame_length() {
        // Read response: unit, fc 0x04, byte count 2 -> 3 + 2 + 2.
        assert_eq!(expected_rtu_frame_length(&[0x01, 0x04, 0x02]), Some(7));
        // Write echo is always 8.
        assert_eq!(expected_rtu_frame_length(&[0x01, 0x06, 0x00]), Some(8));
        // Exception is always 5.
        assert_eq!(expected_rtu_frame_length(&[0x01, 0x83, 0x02]), Some(5));
        // Need three bytes first.
        assert_eq!(expected_rtu_frame_length(&[0x01, 0x04]), None);
    }
}
