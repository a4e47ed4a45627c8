//! Messenger message types.

use crate::rdma::region::Rmr;

/// Which side of a connection a Messenger plays. Behavior after connection
/// is symmetric; this only matters for which binary calls `connect` versus
/// `accept` on the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Passive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Received,
    SendSuccess,
    SendFailed,
}

/// A message handed to a callback. `message_handled` starts `false`; the
/// receive path already hands the callback an independently owned `Vec<u8>`
/// copied out of the transfer's RMR before the callback runs, so unlike the
/// pointer-ownership flag this is modeled on, setting it doesn't change what
/// gets freed. It only records, for API fidelity, whether the callback
/// considers itself to have taken the payload, and, per the dispatch
/// contract, stops any later-registered receive callback from running.
#[derive(Debug, Clone)]
pub struct KiroMessage {
    pub tag: u32,
    pub status: MessageStatus,
    pub payload: Vec<u8>,
    pub message_handled: bool,
}

/// Per-direction in-flight state: at most one send and one receive in
/// flight at a time. `owns_payload` is always `true` on the send side in
/// this crate: `Messenger::submit` takes its payload by value, so Rust's
/// ownership already answers what a runtime flag tracks in a language
/// without move semantics.
pub(crate) struct PendingMessage {
    pub handle: u32,
    pub tag: u32,
    pub payload: Vec<u8>,
    pub rmr: Option<Rmr>,
    pub owns_payload: bool,
    pub status: MessageStatus,
    pub write_wr_id: Option<u64>,
}
