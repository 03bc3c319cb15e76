// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Frame types and the RPC message carried across the conduit. The frame
// header and the message head codec are the only wire contracts; everything
// above them is opaque to the queues.

use crate::buffer::ContBuf;
use crate::error::{ConduitError, Result};

/// Code carried in a response's `code` field when the worker process owning
/// the request's handle has died before answering.
pub const NODE_OFFLINE: i32 = 0x0108;

// ---------------------------------------------------------------------------
// FrameType
// ---------------------------------------------------------------------------

/// Frame type byte. The numeric values are part of the wire format and must
/// never change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Request, parent → child. The only type valid on the child queue.
    Req = 1,
    /// Response, child → parent.
    Rsp = 2,
    /// Broken-link registration, child → parent.
    Regist = 3,
    /// Handle release, child → parent.
    Release = 4,
}

impl FrameType {
    /// Decode a wire byte. Returns `None` for anything a well-formed
    /// producer never writes.
    pub fn from_u8(b: u8) -> Option<FrameType> {
        match b {
            1 => Some(FrameType::Req),
            2 => Some(FrameType::Rsp),
            3 => Some(FrameType::Regist),
            4 => Some(FrameType::Release),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RpcMsg
// ---------------------------------------------------------------------------

/// The message the RPC layer exchanges with the conduit.
///
/// `handle` identifies the live client channel in the parent's RPC runtime,
/// `ahandle` is the runtime's opaque application handle, `ref_id` its
/// liveness token. `cont` is the payload buffer handed off to (or received
/// from) the RPC layer.
#[derive(Debug, Default)]
pub struct RpcMsg {
    pub handle: u64,
    pub ahandle: u64,
    pub ref_id: u64,
    pub code: i32,
    pub cont: Option<ContBuf>,
}

impl RpcMsg {
    /// Byte length of the encoded head.
    pub const HEAD_LEN: usize = 28;

    /// Encode the head fields little-endian: handle, ahandle, ref_id, code.
    pub fn encode_head(&self) -> [u8; Self::HEAD_LEN] {
        let mut out = [0u8; Self::HEAD_LEN];
        out[0..8].copy_from_slice(&self.handle.to_le_bytes());
        out[8..16].copy_from_slice(&self.ahandle.to_le_bytes());
        out[16..24].copy_from_slice(&self.ref_id.to_le_bytes());
        out[24..28].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    /// Decode a head produced by [`RpcMsg::encode_head`]. The continuation
    /// is not part of the head and starts out empty.
    pub fn decode_head(bytes: &[u8]) -> Result<RpcMsg> {
        if bytes.len() < Self::HEAD_LEN {
            return Err(ConduitError::InvalidPara);
        }
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        Ok(RpcMsg {
            handle: u64_at(0),
            ahandle: u64_at(8),
            ref_id: u64_at(16),
            code: i32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            cont: None,
        })
    }

    /// Continuation bytes, or the empty slice when no payload is attached.
    pub fn cont_bytes(&self) -> &[u8] {
        self.cont.as_ref().map_or(&[], |c| c.data())
    }

    /// Continuation length in bytes.
    pub fn cont_len(&self) -> usize {
        self.cont.as_ref().map_or(0, |c| c.len())
    }
}

// ---------------------------------------------------------------------------
// NodeMsg
// ---------------------------------------------------------------------------

/// The unit delivered to a node's message handler for each inbound request.
///
/// On failure the handler may leave a response payload in `rsp`; the child
/// dispatch loop folds it into the synthesized response.
#[derive(Debug, Default)]
pub struct NodeMsg {
    pub rpc: RpcMsg,
    pub rsp: Option<ContBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_wire_values_are_stable() {
        assert_eq!(FrameType::Req as u8, 1);
        assert_eq!(FrameType::Rsp as u8, 2);
        assert_eq!(FrameType::Regist as u8, 3);
        assert_eq!(FrameType::Release as u8, 4);
        assert_eq!(FrameType::from_u8(0), None);
        assert_eq!(FrameType::from_u8(5), None);
    }

    #[test]
    fn head_codec_round_trip() {
        let msg = RpcMsg {
            handle: 0xDEAD_BEEF_0000_0001,
            ahandle: 42,
            ref_id: u64::MAX,
            code: -7,
            cont: None,
        };
        let wire = msg.encode_head();
        let back = RpcMsg::decode_head(&wire).expect("decode");
        assert_eq!(back.handle, msg.handle);
        assert_eq!(back.ahandle, msg.ahandle);
        assert_eq!(back.ref_id, msg.ref_id);
        assert_eq!(back.code, msg.code);
        assert!(back.cont.is_none());
    }

    #[test]
    fn decode_rejects_short_head() {
        assert!(RpcMsg::decode_head(&[0u8; 27]).is_err());
    }
}
