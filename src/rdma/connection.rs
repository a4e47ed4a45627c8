//! Per-connection control-buffer context.
//!
//! Allocated at connection setup, destroyed after the connection is torn
//! down; the optional bulk RDMA region only outlives `ConnectionContext`
//! destruction if the caller calls [`ConnectionContext::take_bulk`] first,
//! avoiding a region that outlives the context that registered it from
//! silently leaking.

use crate::error::Result;
use crate::rdma::region::{AccessFlags, Rmr};
use crate::rdma::transport::Transport;
use crate::wire::ControlMessage;

/// A monotonically increasing id used as the RDMA `wr_id` for the next
/// operation posted on a connection. `connection/rdma.rs` uses one fixed
/// magic constant (`WR_ID`) because it only ever has one operation in
/// flight; this crate issues a fresh id per post so the event harness can
/// tell operations apart on connections with a control send and a bulk RDMA
/// operation outstanding at once.
#[derive(Debug, Default)]
pub struct WrIdAllocator(u64);

impl WrIdAllocator {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

pub struct ConnectionContext {
    pub send_buf: Rmr,
    pub recv_buf: Rmr,
    pub bulk: Option<Rmr>,
    pub wr_ids: WrIdAllocator,
}

impl ConnectionContext {
    /// Allocates the fixed-size send/recv control buffers for a new
    /// connection. No bulk region yet: callers that need one (the
    /// Shared-Memory Channel, or a Messenger mid-transfer) register it
    /// separately and attach it with [`ConnectionContext::set_bulk`].
    pub fn new(transport: &mut dyn Transport) -> Result<ConnectionContext> {
        let send_buf = transport.register(ControlMessage::WIRE_SIZE, AccessFlags::LOCAL_WRITE)?;
        let recv_buf = transport.register(ControlMessage::WIRE_SIZE, AccessFlags::LOCAL_WRITE)?;
        Ok(ConnectionContext {
            send_buf,
            recv_buf,
            bulk: None,
            wr_ids: WrIdAllocator::default(),
        })
    }

    pub fn set_bulk(&mut self, rmr: Rmr) {
        self.bulk = Some(rmr);
    }

    /// Detaches the bulk region so it survives this context's destruction,
    /// for a connection whose bulk buffer is freed on a different schedule
    /// than its control buffers.
    pub fn take_bulk(&mut self) -> Option<Rmr> {
        self.bulk.take()
    }

    /// Serializes `msg` into the send control buffer and posts a signaled
    /// SEND carrying `imm` as immediate data.
    pub fn send_control(
        &mut self,
        transport: &mut dyn Transport,
        msg: ControlMessage,
        imm: u32,
    ) -> Result<u64> {
        let encoded = msg.encode().map_err(|e| {
            crate::error::KiroError::TransferFailed(format!("encoding control message: {}", e))
        })?;
        let buf = transport.local_bytes_mut(&self.send_buf);
        buf[..encoded.len()].copy_from_slice(&encoded);
        let wr_id = self.wr_ids.next();
        transport.post_send_imm(&self.send_buf, encoded.len(), imm, wr_id)?;
        Ok(wr_id)
    }

    /// Posts a RECV on the recv control buffer. Callers do this once at
    /// connection setup and once again after every control message they
    /// consume, since every posted receive consumes exactly one completion.
    pub fn post_control_recv(&mut self, transport: &mut dyn Transport) -> Result<u64> {
        let wr_id = self.wr_ids.next();
        transport.post_recv(&self.recv_buf, wr_id)?;
        Ok(wr_id)
    }

    /// Decodes whatever is currently sitting in the recv control buffer.
    pub fn decode_recv(&self, transport: &dyn Transport) -> Result<ControlMessage> {
        let buf = transport.local_bytes(&self.recv_buf);
        ControlMessage::decode(buf).map_err(|e| {
            crate::error::KiroError::TransferFailed(format!("decoding control message: {}", e))
        })
    }

    pub fn destroy(mut self, transport: &mut dyn Transport) -> Result<()> {
        transport.destroy(self.send_buf)?;
        transport.destroy(self.recv_buf)?;
        if let Some(bulk) = self.bulk.take() {
            transport.destroy(bulk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::transport::LoopbackTransport;
    use crate::wire::{MsgType, PeerMri};

    #[test]
    fn control_message_round_trips_through_a_connection_context() {
        let (mut a, mut b) = LoopbackTransport::pair();
        let mut ctx_a = ConnectionContext::new(&mut a).unwrap();
        let mut ctx_b = ConnectionContext::new(&mut b).unwrap();

        let recv_wr = ctx_b.post_control_recv(&mut b).unwrap();
        let msg = ControlMessage::new(
            MsgType::AckRdma,
            PeerMri {
                addr: 1,
                length: 4096,
                rkey: 9,
                handle: 3,
            },
        );
        ctx_a.send_control(&mut a, msg, 0xAB).unwrap();

        // Simulate the SEND landing on b's posted RECV.
        let encoded = msg.encode().unwrap();
        b.complete_recv(&ctx_b.recv_buf, recv_wr, &encoded, 0xAB);

        let completion = b.poll_one(recv_wr).unwrap();
        assert_eq!(completion.imm_data, Some(0xAB));
        let decoded = ctx_b.decode_recv(&b).unwrap();
        assert_eq!(decoded, msg);
    }
}
