// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! ONC-RPC (RFC 5531) message model.
//!
//! Only the subset the gateway needs: version-2 CALL decoding with AUTH
//! fields skipped, and accepted/denied REPLY encoding including the standard
//! reject statuses for unknown programs, versions, and procedures.

use thiserror::Error;

use crate::xdr::{XdrDecoder, XdrEncoder, XdrError};

/// ONC-RPC protocol version.
pub const RPC_VERSION: u32 = 2;

/// Message type: call.
pub const MSG_CALL: u32 = 0;
/// Message type: reply.
pub const MSG_REPLY: u32 = 1;

/// Reply status: accepted.
pub const REPLY_ACCEPTED: u32 = 0;
/// Reply status: denied.
pub const REPLY_DENIED: u32 = 1;

/// AUTH_NULL flavor.
pub const AUTH_NULL: u32 = 0;

/// Denied status: RPC version mismatch.
pub const RPC_MISMATCH: u32 = 0;

// =============================================================================
// Errors
// =============================================================================

/// Faults while decoding an RPC message.
#[derive(Debug, Error)]
pub enum RpcError {
    /// XDR-level decoding failure.
    #[error(transparent)]
    Xdr(#[from] XdrError),

    /// The message was not a CALL.
    #[error("Expected an RPC CALL, got message type {0}")]
    NotACall(u32),

    /// The caller speaks an unsupported RPC version.
    #[error("Unsupported RPC version {0}")]
    VersionMismatch(u32),

    /// Record-marking framing violation.
    #[error("RPC record framing error: {0}")]
    Framing(String),
}

// =============================================================================
// Call
// =============================================================================

/// A decoded RPC call header. Procedure arguments remain in the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    /// Transaction id echoed in the reply.
    pub xid: u32,
    /// Remote program number.
    pub program: u32,
    /// Program version.
    pub version: u32,
    /// Procedure number.
    pub procedure: u32,
}

impl RpcCall {
    /// Decodes the call header, skipping credential and verifier bodies.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, RpcError> {
        let xid = dec.get_u32()?;
        let msg_type = dec.get_u32()?;
        if msg_type != MSG_CALL {
            return Err(RpcError::NotACall(msg_type));
        }
        let rpc_version = dec.get_u32()?;
        if rpc_version != RPC_VERSION {
            return Err(RpcError::VersionMismatch(rpc_version));
        }
        let program = dec.get_u32()?;
        let version = dec.get_u32()?;
        let procedure = dec.get_u32()?;

        // Credentials and verifier: flavor + opaque body, both ignored.
        for _ in 0..2 {
            let _flavor = dec.get_u32()?;
            let body = dec.get_opaque()?;
            let _ = body;
        }

        Ok(Self {
            xid,
            program,
            version,
            procedure,
        })
    }
}

// =============================================================================
// Reply
// =============================================================================

/// Accepted-reply status for an RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStatus {
    /// Procedure executed; results follow.
    Success,
    /// Program not exported by this server.
    ProgUnavail,
    /// Program exists, version out of range.
    ProgMismatch {
        /// Lowest supported version.
        low: u32,
        /// Highest supported version.
        high: u32,
    },
    /// Procedure not implemented.
    ProcUnavail,
    /// Arguments could not be decoded.
    GarbageArgs,
}

impl AcceptStatus {
    fn discriminant(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ProgUnavail => 1,
            Self::ProgMismatch { .. } => 2,
            Self::ProcUnavail => 3,
            Self::GarbageArgs => 4,
        }
    }
}

/// Encodes an accepted reply with `results` as the procedure result body.
pub fn encode_accepted_reply(xid: u32, status: AcceptStatus, results: &[u8]) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.put_u32(xid);
    enc.put_u32(MSG_REPLY);
    enc.put_u32(REPLY_ACCEPTED);
    // Verifier: AUTH_NULL with empty body.
    enc.put_u32(AUTH_NULL);
    enc.put_u32(0);
    enc.put_u32(status.discriminant());
    if let AcceptStatus::ProgMismatch { low, high } = status {
        enc.put_u32(low);
        enc.put_u32(high);
    }
    let mut bytes = enc.into_bytes();
    if status == AcceptStatus::Success {
        bytes.extend_from_slice(results);
    }
    bytes
}

/// Encodes a denied reply for an RPC version mismatch.
pub fn encode_rpc_mismatch(xid: u32) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.put_u32(xid);
    enc.put_u32(MSG_REPLY);
    enc.put_u32(REPLY_DENIED);
    enc.put_u32(RPC_MISMATCH);
    enc.put_u32(RPC_VERSION);
    enc.put_u32(RPC_VERSION);
    enc.into_bytes()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_call(xid: u32, program: u32, version: u32, procedure: u32) -> Vec<u8> {
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
        enc.into_bytes()
    }

    #[test]
    fn test_decode_call_header() {
        let bytes = encode_call(99, 0x0607AF, 1, 10);
        let mut dec = XdrDecoder::new(&bytes);
        let call = RpcCall::decode(&mut dec).unwrap();
        assert_eq!(call.xid, 99);
        assert_eq!(call.program, 0x0607AF);
        assert_eq!(call.version, 1);
        assert_eq!(call.procedure, 10);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_decode_rejects_reply_messages() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(1);
        enc.put_u32(MSG_REPLY);
        let bytes = enc.into_bytes();
        let mut dec = XdrDecoder::new(&bytes);
        assert!(matches!(
            RpcCall::decode(&mut dec),
            Err(RpcError::NotACall(1))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_rpc_version() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(1);
        enc.put_u32(MSG_CALL);
        enc.put_u32(3);
        let bytes = enc.into_bytes();
        let mut dec = XdrDecoder::new(&bytes);
        assert!(matches!(
            RpcCall::decode(&mut dec),
            Err(RpcError::VersionMismatch(3))
        ));
    }

    #[test]
    fn test_accepted_success_reply_layout() {
        let reply = encode_accepted_reply(7, AcceptStatus::Success, &[0xAA, 0xBB]);
        // xid, REPLY, ACCEPTED, verf flavor, verf len, SUCCESS, then results.
        assert_eq!(
            reply,
            vec![
                0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB
            ]
        );
    }

    #[test]
    fn test_prog_mismatch_carries_version_range() {
        let reply = encode_accepted_reply(1, AcceptStatus::ProgMismatch { low: 1, high: 1 }, &[]);
        let mut dec = XdrDecoder::new(&reply);
        dec.skip(20).unwrap();
        assert_eq!(dec.get_u32().unwrap(), 2); // PROG_MISMATCH
        assert_eq!(dec.get_u32().unwrap(), 1);
        assert_eq!(dec.get_u32().unwrap(), 1);
    }

    #[test]
    fn test_reject_statuses_omit_results() {
        let reply = encode_accepted_reply(1, AcceptStatus::ProcUnavail, &[0xFF]);
        assert!(!reply.contains(&0xFF));
    }
}
