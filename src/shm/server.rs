//! Shared-Memory Server: owns one advertised region and a set of client
//! connections.

use crate::error::{KiroError, Result};
use crate::rdma::connection::ConnectionContext;
use crate::rdma::region::{AccessFlags, Rmr};
use crate::rdma::transport::{Transport, WcOpcode};
use crate::wire::{ControlMessage, MsgType, PeerMri};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub type ClientId = u64;

struct ClientConnection<T: Transport> {
    transport: T,
    ctx: ConnectionContext,
    pending_recv_wr: u64,
}

/// Tracks an in-flight reallocation: the region being retired, and the set
/// of clients that still haven't acknowledged the new one. The old region
/// is only destroyed once this set is empty, closing the window where a
/// client could RDMA READ a region that no longer exists.
struct PendingTeardown {
    old_region: Rmr,
    awaiting: HashSet<ClientId>,
}

pub struct Server<T: Transport> {
    publisher: T,
    region: Rmr,
    next_client_id: ClientId,
    clients: HashMap<ClientId, ClientConnection<T>>,
    pending_teardown: Option<PendingTeardown>,
}

impl<T: Transport> Server<T> {
    /// Registers `initial` as the advertised region and starts with no
    /// connected clients.
    pub fn new(mut publisher: T, initial: &[u8]) -> Result<Server<T>> {
        let region = publisher.register_existing(initial, AccessFlags::REMOTE_READ)?;
        Ok(Server {
            publisher,
            region,
            next_client_id: 1,
            clients: HashMap::new(),
            pending_teardown: None,
        })
    }

    pub fn region(&self) -> Rmr {
        self.region
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Accepts a new client connection over `transport`: allocates its
    /// control buffers, posts a preemptive receive, and immediately
    /// advertises the region with `ACK_RDMA`.
    pub fn accept_client(&mut self, mut transport: T) -> Result<ClientId> {
        let mut ctx = ConnectionContext::new(&mut transport)?;
        let pending_recv_wr = ctx.post_control_recv(&mut transport)?;
        let ack = ControlMessage::new(
            MsgType::AckRdma,
            PeerMri {
                addr: self.region.addr,
                length: self.region.length as u64,
                rkey: self.region.rkey,
                handle: 0,
            },
        );
        ctx.send_control(&mut transport, ack, 0)?;

        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            id,
            ClientConnection {
                transport,
                ctx,
                pending_recv_wr,
            },
        );
        Ok(id)
    }

    /// Tears down one client's connection and releases its resources. If a
    /// reallocation is waiting on this client's `ACK_RDMA`, this also
    /// counts as acknowledgement (a disconnected client cannot read the
    /// stale region).
    pub fn disconnect_client(&mut self, id: ClientId) -> Result<()> {
        if let Some(ClientConnection { ctx, mut transport, .. }) = self.clients.remove(&id) {
            ctx.destroy(&mut transport)?;
        }
        self.note_client_gone(id);
        Ok(())
    }

    /// Replaces the advertised region with `new_bytes`, broadcasts
    /// `REALLOC` to every connected client, and keeps the previous region
    /// registered until every client has replied `ACK_RDMA` (or
    /// disconnected).
    pub fn reallocate(&mut self, new_bytes: &[u8]) -> Result<()> {
        let new_region = self.publisher.register_existing(new_bytes, AccessFlags::REMOTE_READ)?;
        let old_region = std::mem::replace(&mut self.region, new_region);

        let mut awaiting = HashSet::new();
        for (&id, conn) in self.clients.iter_mut() {
            let realloc = ControlMessage::new(
                MsgType::Realloc,
                PeerMri {
                    addr: new_region.addr,
                    length: new_region.length as u64,
                    rkey: new_region.rkey,
                    handle: 0,
                },
            );
            conn.ctx.send_control(&mut conn.transport, realloc, 0)?;
            awaiting.insert(id);
        }

        if awaiting.is_empty() {
            self.publisher.destroy(old_region)?;
        } else {
            self.pending_teardown = Some(PendingTeardown { old_region, awaiting });
        }
        Ok(())
    }

    fn note_client_gone(&mut self, id: ClientId) {
        let finalize = if let Some(teardown) = self.pending_teardown.as_mut() {
            teardown.awaiting.remove(&id);
            teardown.awaiting.is_empty()
        } else {
            false
        };
        if finalize {
            let teardown = self.pending_teardown.take().unwrap();
            if let Err(e) = self.publisher.destroy(teardown.old_region) {
                warn!(error = %e, "failed to destroy retired shared-memory region");
            }
        }
    }

    /// Drains ready completions for one client and reacts to whatever
    /// control message arrived. Call once per client per event-loop tick,
    /// or directly in tests driving a specific scenario.
    pub fn poll_client(&mut self, id: ClientId) -> Result<()> {
        let mut delivered = Vec::new();
        {
            let conn = match self.clients.get_mut(&id) {
                Some(conn) => conn,
                None => return Ok(()),
            };
            for completion in conn.transport.poll_completions() {
                if completion.opcode != WcOpcode::Recv || completion.wr_id != conn.pending_recv_wr {
                    continue;
                }
                let msg = conn.ctx.decode_recv(&conn.transport)?;
                conn.pending_recv_wr = conn.ctx.post_control_recv(&mut conn.transport)?;
                delivered.push(msg);
            }
        }
        for msg in delivered {
            self.handle_control(id, msg)?;
        }
        Ok(())
    }

    pub fn poll_all(&mut self) -> Result<()> {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.poll_client(id)?;
        }
        Ok(())
    }

    fn handle_control(&mut self, id: ClientId, msg: ControlMessage) -> Result<()> {
        match msg.msg_type {
            MsgType::Ping => {
                if let Some(conn) = self.clients.get_mut(&id) {
                    conn.ctx
                        .send_control(&mut conn.transport, ControlMessage::simple(MsgType::Pong), 0)?;
                }
            }
            MsgType::AckRdma => {
                self.note_client_gone(id);
            }
            other => {
                debug!(client = id, ?other, "shared-memory server ignoring unexpected control message");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::transport::LoopbackTransport;
    use crate::shm::client::Client;

    #[test]
    fn accepting_a_client_advertises_the_region() {
        let publisher = LoopbackTransport::new();
        let (server_side, client_side) = publisher.accept_connection();
        let mut server = Server::new(publisher, &[0xABu8; 64]).unwrap();
        server.accept_client(server_side).unwrap();
        assert_eq!(server.client_count(), 1);

        let client = Client::connect(client_side).unwrap();
        assert_eq!(client.get_memory_size(), 64);
        assert_eq!(client.get_memory(), &[0xAB; 64][..]);
    }

    #[test]
    fn reallocation_keeps_old_region_until_every_client_acks() {
        let publisher = LoopbackTransport::new();
        let (server_side_a, client_side_a) = publisher.accept_connection();
        let mut server = Server::new(publisher, &[0u8; 16]).unwrap();
        let id_a = server.accept_client(server_side_a).unwrap();
        let mut client_a = Client::connect(client_side_a).unwrap();

        server.reallocate(&[1u8; 32]).unwrap();
        assert!(server.pending_teardown.is_some());

        client_a.poll().unwrap();
        assert_eq!(client_a.get_memory_size(), 32);

        server.poll_client(id_a).unwrap();
        assert!(server.pending_teardown.is_none());
    }
}
