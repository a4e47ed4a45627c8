//! Messenger: a symmetric point-to-point channel for arbitrary-size
//! messages over a two-phase control/RDMA protocol: a control message
//! negotiates a buffer and permissions, then the sender performs one RDMA
//! WRITE directly into the peer's registered memory.

mod message;

pub use message::{KiroMessage, MessageStatus, Role};
use message::PendingMessage;

use crate::error::{CompletionStatus, KiroError, Result};
use crate::rdma::connection::ConnectionContext;
use crate::rdma::region::AccessFlags;
use crate::rdma::transport::{Transport, WcOpcode};
use crate::wire::{ControlMessage, MsgType, PeerMri};
use std::sync::Mutex;
use tracing::debug;

type ReceiveCallback = Box<dyn FnMut(&mut KiroMessage) + Send>;
type SendCallback = Box<dyn FnMut(&KiroMessage) + Send>;

pub struct Messenger<T: Transport> {
    transport: T,
    ctx: ConnectionContext,
    role: Role,
    next_handle: u32,
    pending_send: Option<PendingMessage>,
    pending_recv: Option<PendingMessage>,
    pending_recv_wr: u64,
    /// Guards `pending_send`: held by `submit` for its whole duration, and
    /// try-locked by the loop-side reply handlers (`ACK_MSG`/`REJ_RDMA`/
    /// `ACK_RDMA`) so a submit in progress on another thread defers them to
    /// the next `poll`.
    connection_handling: Mutex<()>,
    /// Guards `pending_recv`: try-locked by the loop-side request/teardown
    /// handlers (`MSG_STUB`/`REQ_RDMA`/`RDMA_DONE`/`RDMA_CANCEL`).
    rdma_handling: Mutex<()>,
    next_callback_id: u64,
    /// Ordered by registration: `add_receive_callback`/`add_send_callback`
    /// push onto the end, so dispatch always runs handlers in insertion
    /// order, as spec.md §9 requires.
    receive_callbacks: Vec<(u64, ReceiveCallback)>,
    send_callbacks: Vec<(u64, SendCallback)>,
}

impl<T: Transport> Messenger<T> {
    pub fn start(mut transport: T, role: Role) -> Result<Messenger<T>> {
        let mut ctx = ConnectionContext::new(&mut transport)?;
        let pending_recv_wr = ctx.post_control_recv(&mut transport)?;
        Ok(Messenger {
            transport,
            ctx,
            role,
            next_handle: 0,
            pending_send: None,
            pending_recv: None,
            pending_recv_wr,
            connection_handling: Mutex::new(()),
            rdma_handling: Mutex::new(()),
            next_callback_id: 0,
            receive_callbacks: Vec::new(),
            send_callbacks: Vec::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn add_receive_callback<F>(&mut self, callback: F) -> u64
    where
        F: FnMut(&mut KiroMessage) + Send + 'static,
    {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.receive_callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn add_send_callback<F>(&mut self, callback: F) -> u64
    where
        F: FnMut(&KiroMessage) + Send + 'static,
    {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.send_callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn remove_receive_callback(&mut self, id: u64) {
        self.receive_callbacks.retain(|(cid, _)| *cid != id);
    }

    pub fn remove_send_callback(&mut self, id: u64) {
        self.send_callbacks.retain(|(cid, _)| *cid != id);
    }

    /// Clears both callback lists. Callbacks are append-only while running;
    /// this is the only way to drop them.
    pub fn stop(&mut self) {
        self.receive_callbacks.clear();
        self.send_callbacks.clear();
    }

    /// Submits a message for sending: a monotonically increasing 32-bit
    /// handle is assigned, and an empty payload takes the stub path
    /// (`MSG_STUB`, tag carried as immediate data) while a non-empty one
    /// registers it in place and negotiates a buffer (`REQ_RDMA`). Only one
    /// send may be in flight at a time.
    pub fn submit(&mut self, tag: u32, payload: Vec<u8>) -> Result<u32> {
        let _guard = self.connection_handling.lock().unwrap();
        if self.pending_send.is_some() {
            return Err(KiroError::InvalidState("a send is already in flight".into()));
        }
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = self.next_handle;

        if payload.is_empty() {
            self.ctx
                .send_control(&mut self.transport, ControlMessage::with_handle(MsgType::MsgStub, handle), tag)?;
            self.pending_send = Some(PendingMessage {
                handle,
                tag,
                payload,
                rmr: None,
                owns_payload: true,
                status: MessageStatus::Pending,
                write_wr_id: None,
            });
        } else {
            let rmr = self.transport.register_existing(&payload, AccessFlags::LOCAL_WRITE)?;
            let req = ControlMessage::new(
                MsgType::ReqRdma,
                PeerMri {
                    addr: 0,
                    length: rmr.length as u64,
                    rkey: 0,
                    handle,
                },
            );
            self.ctx.send_control(&mut self.transport, req, tag)?;
            self.pending_send = Some(PendingMessage {
                handle,
                tag,
                payload,
                rmr: Some(rmr),
                owns_payload: true,
                status: MessageStatus::Pending,
                write_wr_id: None,
            });
        }
        Ok(handle)
    }

    /// Drains ready completions: control-message receives are dispatched by
    /// type, and a completed RDMA WRITE finishes whatever send posted it.
    pub fn poll(&mut self) -> Result<()> {
        let completions = self.transport.poll_completions();
        let mut inbound = Vec::new();
        let mut finished_write: Option<CompletionStatus> = None;

        for completion in completions {
            match completion.opcode {
                WcOpcode::Recv if completion.wr_id == self.pending_recv_wr => {
                    let msg = self.ctx.decode_recv(&self.transport)?;
                    self.pending_recv_wr = self.ctx.post_control_recv(&mut self.transport)?;
                    inbound.push((msg, completion.imm_data.unwrap_or(0)));
                }
                WcOpcode::RdmaWrite => {
                    let matches = matches!(
                        self.pending_send.as_ref().and_then(|p| p.write_wr_id),
                        Some(wr_id) if wr_id == completion.wr_id
                    );
                    if matches {
                        finished_write = Some(completion.status);
                    }
                }
                _ => {}
            }
        }

        if let Some(status) = finished_write {
            self.finish_send(status)?;
        }
        for (msg, imm) in inbound {
            self.handle_control(msg, imm)?;
        }
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage, imm: u32) -> Result<()> {
        match msg.msg_type {
            MsgType::Ping => {
                self.ctx.send_control(&mut self.transport, ControlMessage::simple(MsgType::Pong), 0)?;
            }
            MsgType::Pong => debug!("messenger observed a stray PONG"),
            MsgType::MsgStub => self.handle_msg_stub(msg.peer_mri.handle, imm)?,
            MsgType::ReqRdma => self.handle_req_rdma(msg.peer_mri, imm)?,
            MsgType::AckMsg => self.handle_ack_msg(msg.peer_mri.handle)?,
            MsgType::RejRdma => self.handle_rej_rdma(msg.peer_mri.handle)?,
            MsgType::AckRdma => self.handle_ack_rdma(msg.peer_mri)?,
            MsgType::RdmaDone => self.handle_rdma_done(msg.peer_mri.handle)?,
            MsgType::RdmaCancel => self.handle_rdma_cancel(msg.peer_mri.handle)?,
            MsgType::Realloc => debug!("messenger ignoring a shared-memory-channel control message"),
        }
        Ok(())
    }

    /// Stub receive: deliver immediately if a callback exists and nothing
    /// else is in flight, else reject.
    fn handle_msg_stub(&mut self, handle: u32, tag: u32) -> Result<()> {
        let guard = match self.rdma_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("rdma_handling contended, deferring MSG_STUB to the next poll");
                return Ok(());
            }
        };
        if self.pending_recv.is_some() || self.receive_callbacks.is_empty() {
            drop(guard);
            self.ctx
                .send_control(&mut self.transport, ControlMessage::with_handle(MsgType::RejRdma, handle), 0)?;
            return Ok(());
        }
        drop(guard);
        self.ctx
            .send_control(&mut self.transport, ControlMessage::with_handle(MsgType::AckMsg, handle), 0)?;
        let mut msg = KiroMessage {
            tag,
            status: MessageStatus::Received,
            payload: Vec::new(),
            message_handled: false,
        };
        self.dispatch_receive(&mut msg);
        Ok(())
    }

    fn handle_req_rdma(&mut self, peer_mri: PeerMri, tag: u32) -> Result<()> {
        let guard = match self.rdma_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("rdma_handling contended, deferring REQ_RDMA to the next poll");
                return Ok(());
            }
        };
        if self.pending_recv.is_some() || self.receive_callbacks.is_empty() {
            drop(guard);
            self.ctx.send_control(
                &mut self.transport,
                ControlMessage::with_handle(MsgType::RejRdma, peer_mri.handle),
                0,
            )?;
            return Ok(());
        }
        let length = peer_mri.length as usize;
        let rmr = match self
            .transport
            .register(length, AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE)
        {
            Ok(rmr) => rmr,
            Err(_) => {
                drop(guard);
                self.ctx.send_control(
                    &mut self.transport,
                    ControlMessage::with_handle(MsgType::RejRdma, peer_mri.handle),
                    0,
                )?;
                return Ok(());
            }
        };
        self.pending_recv = Some(PendingMessage {
            handle: peer_mri.handle,
            tag,
            payload: Vec::new(),
            rmr: Some(rmr),
            owns_payload: false,
            status: MessageStatus::Pending,
            write_wr_id: None,
        });
        drop(guard);
        let ack = ControlMessage::new(
            MsgType::AckRdma,
            PeerMri {
                addr: rmr.addr,
                length: rmr.length as u64,
                rkey: rmr.rkey,
                handle: peer_mri.handle,
            },
        );
        self.ctx.send_control(&mut self.transport, ack, 0)?;
        Ok(())
    }

    fn handle_ack_msg(&mut self, handle: u32) -> Result<()> {
        let guard = match self.connection_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("connection_handling contended, deferring ACK_MSG to the next poll");
                return Ok(());
            }
        };
        if !matches!(self.pending_send.as_ref(), Some(p) if p.handle == handle) {
            drop(guard);
            debug!(handle, "ignoring ACK_MSG for an unknown or mismatched handle");
            return Ok(());
        }
        let mut pending = self.pending_send.take().unwrap();
        drop(guard);
        pending.status = MessageStatus::SendSuccess;
        self.dispatch_send(pending);
        Ok(())
    }

    fn handle_rej_rdma(&mut self, handle: u32) -> Result<()> {
        let guard = match self.connection_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("connection_handling contended, deferring REJ_RDMA to the next poll");
                return Ok(());
            }
        };
        if !matches!(self.pending_send.as_ref(), Some(p) if p.handle == handle) {
            drop(guard);
            debug!(handle, "ignoring REJ_RDMA for an unknown or mismatched handle");
            return Ok(());
        }
        let mut pending = self.pending_send.take().unwrap();
        drop(guard);
        if let Some(rmr) = pending.rmr.take() {
            self.transport.destroy(rmr)?;
        }
        pending.status = MessageStatus::SendFailed;
        self.dispatch_send(pending);
        Ok(())
    }

    fn handle_ack_rdma(&mut self, peer_mri: PeerMri) -> Result<()> {
        let guard = match self.connection_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("connection_handling contended, deferring ACK_RDMA to the next poll");
                return Ok(());
            }
        };
        if !matches!(self.pending_send.as_ref(), Some(p) if p.handle == peer_mri.handle) {
            drop(guard);
            debug!(handle = peer_mri.handle, "ignoring ACK_RDMA for an unknown or mismatched handle");
            return Ok(());
        }
        let pending = self.pending_send.as_mut().unwrap();
        let rmr = pending
            .rmr
            .ok_or_else(|| KiroError::InvalidState("ACK_RDMA received for a stub send".into()))?;
        let len = pending.payload.len();
        let wr_id = self.ctx.wr_ids.next();
        drop(guard);
        self.transport.post_write(&rmr, 0, peer_mri.addr, peer_mri.rkey, len, wr_id)?;
        if let Some(pending) = self.pending_send.as_mut() {
            pending.write_wr_id = Some(wr_id);
        }
        Ok(())
    }

    fn finish_send(&mut self, status: CompletionStatus) -> Result<()> {
        let mut pending = match self.pending_send.take() {
            Some(p) => p,
            None => return Ok(()),
        };
        let (reply, final_status) = match status {
            CompletionStatus::Success => (MsgType::RdmaDone, MessageStatus::SendSuccess),
            _ => (MsgType::RdmaCancel, MessageStatus::SendFailed),
        };
        self.ctx
            .send_control(&mut self.transport, ControlMessage::with_handle(reply, pending.handle), 0)?;
        if let Some(rmr) = pending.rmr.take() {
            self.transport.destroy(rmr)?;
        }
        pending.status = final_status;
        self.dispatch_send(pending);
        Ok(())
    }

    fn handle_rdma_done(&mut self, handle: u32) -> Result<()> {
        let guard = match self.rdma_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("rdma_handling contended, deferring RDMA_DONE to the next poll");
                return Ok(());
            }
        };
        if !matches!(self.pending_recv.as_ref(), Some(p) if p.handle == handle) {
            drop(guard);
            debug!(handle, "ignoring RDMA_DONE for an unknown or mismatched handle");
            return Ok(());
        }
        let mut pending = self.pending_recv.take().unwrap();
        drop(guard);
        let rmr = pending.rmr.take().unwrap();
        pending.payload = self.transport.local_bytes(&rmr).to_vec();
        let mut msg = KiroMessage {
            tag: pending.tag,
            status: MessageStatus::Received,
            payload: pending.payload,
            message_handled: false,
        };
        self.dispatch_receive(&mut msg);
        self.transport.destroy(rmr)?;
        Ok(())
    }

    fn handle_rdma_cancel(&mut self, handle: u32) -> Result<()> {
        let guard = match self.rdma_handling.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("rdma_handling contended, deferring RDMA_CANCEL to the next poll");
                return Ok(());
            }
        };
        if !matches!(self.pending_recv.as_ref(), Some(p) if p.handle == handle) {
            drop(guard);
            debug!(handle, "ignoring RDMA_CANCEL for an unknown or mismatched handle");
            return Ok(());
        }
        let mut pending = self.pending_recv.take().unwrap();
        drop(guard);
        if let Some(rmr) = pending.rmr.take() {
            self.transport.destroy(rmr)?;
        }
        Ok(())
    }

    /// Runs receive callbacks in registration order until one claims the
    /// message by setting `message_handled = true`, per spec.md §9.
    fn dispatch_receive(&mut self, msg: &mut KiroMessage) {
        for (_, callback) in self.receive_callbacks.iter_mut() {
            callback(msg);
            if msg.message_handled {
                break;
            }
        }
    }

    fn dispatch_send(&mut self, pending: PendingMessage) {
        let msg = KiroMessage {
            tag: pending.tag,
            status: pending.status,
            payload: if pending.owns_payload { pending.payload } else { Vec::new() },
            message_handled: false,
        };
        for (_, callback) in self.send_callbacks.iter_mut() {
            callback(&msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::transport::LoopbackTransport;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn stub_message_round_trips_with_callbacks() {
        let (active_t, passive_t) = LoopbackTransport::pair();
        let mut active = Messenger::start(active_t, Role::Active).unwrap();
        let mut passive = Messenger::start(passive_t, Role::Passive).unwrap();

        let received: Arc<StdMutex<Vec<KiroMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        passive.add_receive_callback(move |msg| {
            received_clone.lock().unwrap().push(msg.clone());
        });

        let sent: Arc<StdMutex<Vec<KiroMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        active.add_send_callback(move |msg| {
            sent_clone.lock().unwrap().push(msg.clone());
        });

        active.submit(0x1234, Vec::new()).unwrap();
        passive.poll().unwrap();
        active.poll().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].tag, 0x1234);
        assert_eq!(received[0].status, MessageStatus::Received);
        assert!(received[0].payload.is_empty());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, MessageStatus::SendSuccess);
    }

    #[test]
    fn receive_callbacks_run_in_registration_order_and_stop_once_claimed() {
        let (active_t, passive_t) = LoopbackTransport::pair();
        let mut active = Messenger::start(active_t, Role::Active).unwrap();
        let mut passive = Messenger::start(passive_t, Role::Passive).unwrap();

        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let order_a = order.clone();
        passive.add_receive_callback(move |msg| {
            order_a.lock().unwrap().push("first");
            msg.message_handled = true;
        });
        let order_b = order.clone();
        passive.add_receive_callback(move |_msg| {
            order_b.lock().unwrap().push("second");
        });

        active.submit(1, Vec::new()).unwrap();
        passive.poll().unwrap();

        let order = order.lock().unwrap();
        assert_eq!(*order, vec!["first"]);
    }

    #[test]
    fn large_payload_transfers_via_rdma_write() {
        let (active_t, passive_t) = LoopbackTransport::pair();
        let mut active = Messenger::start(active_t, Role::Active).unwrap();
        let mut passive = Messenger::start(passive_t, Role::Passive).unwrap();

        let payload: Vec<u8> = (0..=255u8).cycle().take(65536).collect();

        let received: Arc<StdMutex<Option<KiroMessage>>> = Arc::new(StdMutex::new(None));
        let received_clone = received.clone();
        passive.add_receive_callback(move |msg| {
            *received_clone.lock().unwrap() = Some(msg.clone());
        });

        let sent: Arc<StdMutex<Option<MessageStatus>>> = Arc::new(StdMutex::new(None));
        let sent_clone = sent.clone();
        active.add_send_callback(move |msg| {
            *sent_clone.lock().unwrap() = Some(msg.status);
        });

        active.submit(7, payload.clone()).unwrap();
        // REQ_RDMA -> ACK_RDMA
        passive.poll().unwrap();
        active.poll().unwrap();
        // RDMA WRITE completion -> RDMA_DONE
        active.poll().unwrap();
        passive.poll().unwrap();

        let received = received.lock().unwrap();
        let received = received.as_ref().expect("message delivered");
        assert_eq!(received.tag, 7);
        assert_eq!(received.payload, payload);
        assert_eq!(*sent.lock().unwrap(), Some(MessageStatus::SendSuccess));
    }

    #[test]
    fn rejects_a_second_concurrent_send() {
        let (active_t, _passive_t) = LoopbackTransport::pair();
        let mut active = Messenger::start(active_t, Role::Active).unwrap();
        active.submit(1, vec![1, 2, 3]).unwrap();
        let err = active.submit(2, vec![4]).unwrap_err();
        assert!(matches!(err, KiroError::InvalidState(_)));
    }
}
