//! Shared-Memory Client: connects to a server, mirrors its region, and
//! issues RDMA READs (full or partial) against the mirror.

use crate::config::Config;
use crate::error::{KiroError, Result};
use crate::rdma::connection::ConnectionContext;
use crate::rdma::region::{AccessFlags, Rmr};
use crate::rdma::transport::{Transport, WcOpcode};
use crate::wire::{ControlMessage, MsgType, PeerMri};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Provisioned,
    Syncing,
}

/// The PING/PONG timing slot: idle, or awaiting a reply since a given
/// instant. Scoped to the `Client` that owns it rather than kept as a
/// process-wide sentinel.
enum PingSlot {
    Idle,
    Awaiting { sent_at: Instant },
}

pub struct Client<T: Transport> {
    transport: T,
    ctx: Option<ConnectionContext>,
    state: ClientState,
    peer: PeerMri,
    mirror: Option<Rmr>,
    pending_recv_wr: u64,
    ping_slot: Mutex<PingSlot>,
    sync_lock: Mutex<()>,
    ping_timeout: Duration,
}

impl<T: Transport> Client<T> {
    pub fn connect(transport: T) -> Result<Client<T>> {
        Self::connect_with_config(transport, &Config::default())
    }

    /// Posts a preemptive receive, then blocks until the first `ACK_RDMA`
    /// populates the peer descriptor and a mirror sized to it is
    /// registered.
    pub fn connect_with_config(mut transport: T, config: &Config) -> Result<Client<T>> {
        let mut ctx = ConnectionContext::new(&mut transport)?;
        let recv_wr = ctx.post_control_recv(&mut transport)?;

        let completion = transport.poll_one(recv_wr)?;
        completion.status.into_result()?;
        let msg = ctx.decode_recv(&transport)?;
        if msg.msg_type != MsgType::AckRdma {
            return Err(KiroError::HandshakeFailed(format!(
                "expected ACK_RDMA, got {:?}",
                msg.msg_type
            )));
        }
        let peer = msg.peer_mri;
        let mirror = transport.register(peer.length as usize, AccessFlags::LOCAL_WRITE)?;
        let pending_recv_wr = ctx.post_control_recv(&mut transport)?;

        Ok(Client {
            transport,
            ctx: Some(ctx),
            state: ClientState::Provisioned,
            peer,
            mirror: Some(mirror),
            pending_recv_wr,
            ping_slot: Mutex::new(PingSlot::Idle),
            sync_lock: Mutex::new(()),
            ping_timeout: config.ping_timeout,
        })
    }

    pub fn get_memory_size(&self) -> usize {
        self.mirror.map(|m| m.length).unwrap_or(0)
    }

    pub fn get_memory(&self) -> &[u8] {
        match &self.mirror {
            Some(m) => self.transport.local_bytes(m),
            None => &[],
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        self.sync_partial(0, 0, 0)
    }

    /// `size == 0` means "to the end of the remote region from
    /// `remote_offset`".
    pub fn sync_partial(&mut self, remote_offset: u64, size: u64, local_offset: usize) -> Result<()> {
        let _guard = self.sync_lock.lock().unwrap();
        if self.state != ClientState::Provisioned {
            return Err(KiroError::InvalidState(format!(
                "cannot sync from state {:?}",
                self.state
            )));
        }
        let mirror = self
            .mirror
            .ok_or_else(|| KiroError::InvalidState("no mirror registered".into()))?;
        let effective_size = if size == 0 {
            self.peer.length.saturating_sub(remote_offset)
        } else {
            size
        };
        if remote_offset > self.peer.length || remote_offset + effective_size > self.peer.length {
            return Err(KiroError::InvalidArgument(
                "remote_offset/size exceed the peer's advertised region".into(),
            ));
        }
        let effective_size = effective_size as usize;
        if local_offset + effective_size > mirror.length {
            return Err(KiroError::InvalidArgument(
                "local_offset/size exceed the local mirror".into(),
            ));
        }

        self.state = ClientState::Syncing;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| KiroError::InvalidState("connection torn down".into()))?;
        let wr_id = ctx.wr_ids.next();
        self.transport.post_read(
            &mirror,
            local_offset,
            self.peer.addr + remote_offset,
            self.peer.rkey,
            effective_size,
            wr_id,
        )?;
        let result = self.transport.poll_one(wr_id).and_then(|c| c.status.into_result());
        match result {
            Ok(()) => {
                self.state = ClientState::Provisioned;
                Ok(())
            }
            Err(KiroError::ServerUnresponsive) => {
                self.teardown();
                Err(KiroError::ServerUnresponsive)
            }
            Err(KiroError::AccessRevoked) => {
                self.teardown();
                Err(KiroError::AccessRevoked)
            }
            Err(e) => {
                self.state = ClientState::Provisioned;
                Err(e)
            }
        }
    }

    /// Sends a `PING` and busy-waits on the timing slot until `PONG`
    /// arrives or the configured timeout elapses, returning elapsed
    /// microseconds or `-1` on timeout.
    pub fn ping(&mut self) -> Result<i64> {
        {
            let mut slot = self.ping_slot.lock().unwrap();
            if !matches!(*slot, PingSlot::Idle) {
                return Err(KiroError::InvalidState("a ping is already outstanding".into()));
            }
            *slot = PingSlot::Awaiting { sent_at: Instant::now() };
        }

        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| KiroError::InvalidState("connection torn down".into()))?;
        ctx.send_control(&mut self.transport, ControlMessage::simple(MsgType::Ping), 0)?;

        let deadline = Instant::now() + self.ping_timeout;
        loop {
            for completion in self.transport.poll_completions() {
                if completion.opcode != WcOpcode::Recv || completion.wr_id != self.pending_recv_wr {
                    continue;
                }
                let msg = self.ctx.as_ref().unwrap().decode_recv(&self.transport)?;
                self.pending_recv_wr = self.ctx.as_mut().unwrap().post_control_recv(&mut self.transport)?;
                if msg.msg_type == MsgType::Pong {
                    let sent_at = match *self.ping_slot.lock().unwrap() {
                        PingSlot::Awaiting { sent_at } => sent_at,
                        PingSlot::Idle => Instant::now(),
                    };
                    *self.ping_slot.lock().unwrap() = PingSlot::Idle;
                    return Ok(sent_at.elapsed().as_micros() as i64);
                } else if msg.msg_type == MsgType::Realloc {
                    self.handle_realloc(msg.peer_mri)?;
                }
            }
            if Instant::now() >= deadline {
                *self.ping_slot.lock().unwrap() = PingSlot::Idle;
                return Ok(-1);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Drains ready completions and reacts to whatever control message
    /// isn't a direct reply to a caller-side call already waiting on it
    /// (in practice, `REALLOC`). Call this from an event-loop tick, or
    /// directly in tests that drive a reallocation scenario.
    pub fn poll(&mut self) -> Result<()> {
        let completions = self.transport.poll_completions();
        for completion in completions {
            if completion.opcode != WcOpcode::Recv || completion.wr_id != self.pending_recv_wr {
                continue;
            }
            let ctx = match self.ctx.as_ref() {
                Some(ctx) => ctx,
                None => continue,
            };
            let msg = ctx.decode_recv(&self.transport)?;
            self.pending_recv_wr = self.ctx.as_mut().unwrap().post_control_recv(&mut self.transport)?;
            match msg.msg_type {
                MsgType::Realloc => self.handle_realloc(msg.peer_mri)?,
                MsgType::Pong => debug!("shared-memory client observed a stray PONG outside of ping()"),
                other => debug!(?other, "shared-memory client ignoring unexpected control message"),
            }
        }
        Ok(())
    }

    fn handle_realloc(&mut self, new_peer: PeerMri) -> Result<()> {
        let _guard = self.sync_lock.lock().unwrap();
        if let Some(old_mirror) = self.mirror.take() {
            self.transport.destroy(old_mirror)?;
        }
        match self.transport.register(new_peer.length as usize, AccessFlags::LOCAL_WRITE) {
            Ok(mirror) => {
                self.mirror = Some(mirror);
                self.peer = new_peer;
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.send_control(&mut self.transport, ControlMessage::simple(MsgType::AckRdma), 0)?;
                }
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    fn teardown(&mut self) {
        self.state = ClientState::Disconnected;
        if let Some(ctx) = self.ctx.take() {
            let _ = ctx.destroy(&mut self.transport);
        }
        if let Some(mirror) = self.mirror.take() {
            let _ = self.transport.destroy(mirror);
        }
    }

    /// Leaves the connection; the mirror region's bytes are gone once this
    /// returns, so callers that still need them must copy first.
    pub fn disconnect(&mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::transport::LoopbackTransport;
    use crate::shm::server::Server;

    #[test]
    fn connect_mirrors_the_advertised_region() {
        let publisher = LoopbackTransport::new();
        let (server_side, client_side) = publisher.accept_connection();
        let mut server = Server::new(publisher, &[7u8; 256]).unwrap();
        server.accept_client(server_side).unwrap();

        let client = Client::connect(client_side).unwrap();
        assert_eq!(client.get_memory_size(), 256);
    }

    #[test]
    fn sync_partial_validates_bounds() {
        let publisher = LoopbackTransport::new();
        let (server_side, client_side) = publisher.accept_connection();
        let mut server = Server::new(publisher, &[0u8; 1024]).unwrap();
        server.accept_client(server_side).unwrap();
        let mut client = Client::connect(client_side).unwrap();

        let err = client.sync_partial(2000, 0, 0).unwrap_err();
        assert!(matches!(err, KiroError::InvalidArgument(_)));
    }

    #[test]
    fn partial_sync_copies_only_the_requested_window() {
        let publisher = LoopbackTransport::new();
        let (server_side, client_side) = publisher.accept_connection();
        let mut region = vec![0u8; 1024];
        for (i, b) in region[256..384].iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut server = Server::new(publisher, &region).unwrap();
        server.accept_client(server_side).unwrap();
        let mut client = Client::connect(client_side).unwrap();

        client.sync_partial(256, 128, 512).unwrap();
        assert_eq!(&client.get_memory()[512..640], &region[256..384]);
        assert_eq!(&client.get_memory()[0..512], &vec![0u8; 512][..]);
    }
}
