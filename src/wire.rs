//! Fixed-layout control messages exchanged over a connection's send/recv
//! queue.
//!
//! `connection/rdma.rs::xchg_endp` already serializes a handshake message
//! with `bincode` over a plain `TcpStream` (using `ibverbs::EndpointMsg`).
//! This module follows the same recipe for the in-band control channel:
//! `serde` + `bincode` over a fixed-size buffer sized to hold exactly one
//! message.

use serde::{Deserialize, Serialize};

/// One of the control-message types exchanged between a client and server
/// (or between two Messenger peers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Ping,
    Pong,
    AckRdma,
    RejRdma,
    ReqRdma,
    RdmaDone,
    RdmaCancel,
    MsgStub,
    AckMsg,
    Realloc,
}

/// Remote memory descriptor plus an application-level correlation id
/// (`handle`), carried on the wire as the peer's memory-region info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerMri {
    pub addr: u64,
    pub length: u64,
    pub rkey: u32,
    pub handle: u32,
}

impl PeerMri {
    pub const EMPTY: PeerMri = PeerMri {
        addr: 0,
        length: 0,
        rkey: 0,
        handle: 0,
    };
}

/// The fixed-layout control record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub msg_type: MsgType,
    pub peer_mri: PeerMri,
}

impl ControlMessage {
    pub fn new(msg_type: MsgType, peer_mri: PeerMri) -> ControlMessage {
        ControlMessage { msg_type, peer_mri }
    }

    pub fn simple(msg_type: MsgType) -> ControlMessage {
        ControlMessage::new(msg_type, PeerMri::EMPTY)
    }

    pub fn with_handle(msg_type: MsgType, handle: u32) -> ControlMessage {
        ControlMessage::new(
            msg_type,
            PeerMri {
                handle,
                ..PeerMri::EMPTY
            },
        )
    }

    /// Size, in bytes, a serialized `ControlMessage` is guaranteed not to
    /// exceed. Control buffers are allocated to exactly this size.
    pub const WIRE_SIZE: usize = 64;

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(buf: &[u8]) -> Result<ControlMessage, bincode::Error> {
        bincode::deserialize(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let msg = ControlMessage::new(
            MsgType::ReqRdma,
            PeerMri {
                addr: 0xdead_beef,
                length: 4096,
                rkey: 42,
                handle: 7,
            },
        );
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() <= ControlMessage::WIRE_SIZE);
        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn simple_messages_carry_an_empty_descriptor() {
        let msg = ControlMessage::simple(MsgType::Ping);
        assert_eq!(msg.peer_mri, PeerMri::EMPTY);
    }
}
