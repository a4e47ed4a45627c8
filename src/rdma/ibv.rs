//! Real-hardware [`Transport`], built on the `ibverbs` crate. This is a
//! direct generalization of `connection/rdma.rs`'s `RdmaServerConnector`:
//! that type hardcodes one 4096-byte buffer and one peer; this one manages
//! an arbitrary number of registered regions behind `Rmr` handles so the
//! shared-memory channel and messenger can register/destroy regions as the
//! protocol demands.

use crate::error::{CompletionStatus, KiroError, Result};
use crate::rdma::region::{AccessFlags, Rmr};
use crate::rdma::transport::{Completion, Transport, WcOpcode};
use std::collections::HashMap;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

static FORK_INIT: Once = Once::new();

#[allow(dead_code)]
fn to_access(flags: AccessFlags) -> ibverbs::ibv_access_flags {
    let mut bits = ibverbs::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    if flags.contains(AccessFlags::REMOTE_READ) {
        bits |= ibverbs::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlags::REMOTE_WRITE) {
        bits |= ibverbs::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    bits
}

struct Registration {
    mr: ibverbs::MemoryRegion<u8>,
    access: AccessFlags,
}

/// A single established queue pair plus the protection domain and
/// completion queue it was built from, and the table of regions registered
/// against that protection domain.
///
/// Field order matters, as in `connection/rdma.rs`'s `RdmaServerConnector`
/// ("field order matters!!! Otherwise will panic on drop."): the queue pair
/// must be dropped before the completion queue and protection domain, and
/// registrations must be dropped before the protection domain they were
/// allocated from.
pub struct IbvTransport {
    qp: Arc<ibverbs::QueuePair>,
    regions: HashMap<u64, Registration>,
    next_id: AtomicU64,
    cq: Arc<ibverbs::CompletionQueue>,
    pd: Arc<ibverbs::ProtectionDomain>,
    ctx: Arc<ibverbs::Context>,
}

impl IbvTransport {
    /// Opens the first RDMA device, allocates a protection domain and
    /// completion queue, and performs the connection-manager handshake
    /// against `addr` over a plain TCP rendezvous socket, exactly
    /// `connection/rdma.rs`'s `setup_qp`/`xchg_endp` sequence, generalized
    /// to accept the queue-pair depth from [`crate::config::Config`]
    /// instead of hardcoding it.
    pub fn connect<A: ToSocketAddrs>(addr: A, send_wrs: u32, recv_wrs: u32) -> Result<IbvTransport> {
        Self::fork_init()?;
        let ctx = Self::acquire_ctx()?;
        let pd = Self::acquire_pd(ctx.clone())?;
        let cq = Self::acquire_cq(ctx.clone())?;

        let qp_init = pd
            .create_qp(&cq, &cq, ibverbs::ibv_qp_type::IBV_QPT_RC)
            .allow_remote_rw()
            .set_max_send_wr(send_wrs)
            .set_max_recv_wr(recv_wrs)
            .set_max_send_sge(1)
            .set_max_recv_sge(1)
            .build()
            .map_err(|e| KiroError::EndpointCreation(e.to_string()))?;

        let endpoint = qp_init.endpoint();
        let mut msg = ibverbs::EndpointMsg::from(endpoint);

        let mut stream = std::net::TcpStream::connect(addr)
            .map_err(|e| KiroError::AddressResolution(e.to_string()))?;
        bincode::serialize_into(&mut stream, &msg)
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;
        let rmsg: ibverbs::EndpointMsg = bincode::deserialize_from(&mut stream)
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;
        msg.rkey = rmsg.rkey;
        msg.raddr = rmsg.raddr;

        let qp = qp_init
            .handshake(rmsg.into())
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;

        Ok(IbvTransport {
            ctx,
            pd,
            cq,
            qp: Arc::new(qp),
            regions: HashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Server-side counterpart: accept one connection on a listener already
    /// bound by the caller, same verb sequence as above.
    pub fn accept(stream: &mut std::net::TcpStream, send_wrs: u32, recv_wrs: u32) -> Result<IbvTransport> {
        Self::fork_init()?;
        let ctx = Self::acquire_ctx()?;
        let pd = Self::acquire_pd(ctx.clone())?;
        let cq = Self::acquire_cq(ctx.clone())?;

        let qp_init = pd
            .create_qp(&cq, &cq, ibverbs::ibv_qp_type::IBV_QPT_RC)
            .allow_remote_rw()
            .set_max_send_wr(send_wrs)
            .set_max_recv_wr(recv_wrs)
            .set_max_send_sge(1)
            .set_max_recv_sge(1)
            .build()
            .map_err(|e| KiroError::EndpointCreation(e.to_string()))?;

        let msg = ibverbs::EndpointMsg::from(qp_init.endpoint());
        let rmsg: ibverbs::EndpointMsg = bincode::deserialize_from(&mut *stream)
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;
        bincode::serialize_into(&mut *stream, &msg)
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;

        let qp = qp_init
            .handshake(rmsg.into())
            .map_err(|e| KiroError::HandshakeFailed(e.to_string()))?;

        Ok(IbvTransport {
            ctx,
            pd,
            cq,
            qp: Arc::new(qp),
            regions: HashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn fork_init() -> Result<()> {
        let mut result = Ok(());
        FORK_INIT.call_once(|| {
            if unsafe { ibverbs::ffi::ibv_fork_init() } != 0 {
                result = Err(KiroError::EndpointCreation(format!(
                    "ibv_fork_init failed: {}",
                    io::Error::last_os_error()
                )));
            }
        });
        result
    }

    fn acquire_ctx() -> Result<Arc<ibverbs::Context>> {
        let dev_list =
            ibverbs::devices().map_err(|e| KiroError::EndpointCreation(e.to_string()))?;
        let dev = dev_list
            .get(0)
            .ok_or_else(|| KiroError::EndpointCreation("no RDMA devices in list".into()))?;
        dev.open()
            .map_err(|e| KiroError::EndpointCreation(e.to_string()))
    }

    fn acquire_pd(ctx: Arc<ibverbs::Context>) -> Result<Arc<ibverbs::ProtectionDomain>> {
        ctx.alloc_pd()
            .map(Arc::new)
            .map_err(|_| KiroError::EndpointCreation("allocating protection domain failed".into()))
    }

    fn acquire_cq(ctx: Arc<ibverbs::Context>) -> Result<Arc<ibverbs::CompletionQueue>> {
        let dev_attr = ctx
            .query_device()
            .map_err(|e| KiroError::EndpointCreation(e.to_string()))?;
        ctx.create_cq(dev_attr.max_cqe, 0)
            .map(Arc::new)
            .map_err(|e| KiroError::EndpointCreation(e.to_string()))
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn status_of(status: u32) -> CompletionStatus {
        match status {
            s if s == ibverbs::ffi::ibv_wc_status_IBV_WC_SUCCESS => CompletionStatus::Success,
            s if s == ibverbs::ffi::ibv_wc_status_IBV_WC_RETRY_EXC_ERR => {
                CompletionStatus::RetryExceeded
            }
            s if s == ibverbs::ffi::ibv_wc_status_IBV_WC_REM_ACCESS_ERR => {
                CompletionStatus::RemoteAccessError
            }
            _ => CompletionStatus::Other,
        }
    }

    fn opcode_of(opcode: u32) -> WcOpcode {
        match opcode {
            o if o == ibverbs::ffi::ibv_wc_opcode_IBV_WC_SEND => WcOpcode::Send,
            o if o == ibverbs::ffi::ibv_wc_opcode_IBV_WC_RECV => WcOpcode::Recv,
            o if o == ibverbs::ffi::ibv_wc_opcode_IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            _ => WcOpcode::RdmaWrite,
        }
    }
}

impl Transport for IbvTransport {
    fn register(&mut self, size: usize, access: AccessFlags) -> Result<Rmr> {
        let mr = self
            .pd
            .allocate::<u8>(size)
            .map_err(|e| KiroError::RegistrationFailed(e.to_string()))?;
        let addr = mr.as_ptr() as u64;
        let lkey = mr.rkey();
        let id = self.alloc_id();
        self.regions.insert(id, Registration { mr, access });
        Ok(Rmr {
            id,
            addr,
            length: size,
            lkey,
            rkey: lkey,
            access,
        })
    }

    fn register_existing(&mut self, bytes: &[u8], access: AccessFlags) -> Result<Rmr> {
        // `connection/rdma.rs` never pins a foreign buffer in place; it
        // always allocates through the protection domain (`register_mr`).
        // A messenger send of a caller-owned payload needs the same thing,
        // so this registers a PD-owned buffer of the same size and copies
        // the payload in, the verbs-level equivalent of `ibv_reg_mr` on
        // existing memory, minus the `unsafe` pointer plumbing a raw FFI
        // call would need.
        let rmr = self.register(bytes.len(), access)?;
        self.local_bytes_mut(&rmr).copy_from_slice(bytes);
        Ok(rmr)
    }

    fn destroy(&mut self, rmr: Rmr) -> Result<Vec<u8>> {
        match self.regions.remove(&rmr.id) {
            Some(reg) => Ok(reg.mr.to_vec()),
            None => Ok(Vec::new()),
        }
    }

    fn local_bytes(&self, rmr: &Rmr) -> &[u8] {
        &self.regions.get(&rmr.id).expect("unknown region").mr[..]
    }

    fn local_bytes_mut(&mut self, rmr: &Rmr) -> &mut [u8] {
        &mut self.regions.get_mut(&rmr.id).expect("unknown region").mr[..]
    }

    fn post_send_imm(&mut self, local: &Rmr, len: usize, imm: u32, wr_id: u64) -> Result<()> {
        let reg = self.regions.get(&local.id).expect("unknown region");
        unsafe {
            self.qp
                .post_send_imm(&reg.mr, len, imm, wr_id)
                .map_err(|e| KiroError::Verbs(e.to_string()))
        }
    }

    fn post_recv(&mut self, local: &Rmr, wr_id: u64) -> Result<()> {
        let reg = self.regions.get(&local.id).expect("unknown region");
        unsafe {
            self.qp
                .post_receive(&reg.mr, wr_id)
                .map_err(|e| KiroError::Verbs(e.to_string()))
        }
    }

    fn post_read(
        &mut self,
        local: &Rmr,
        local_offset: usize,
        remote_addr: u64,
        remote_rkey: u32,
        effective_size: usize,
        wr_id: u64,
    ) -> Result<()> {
        let reg = self.regions.get(&local.id).expect("unknown region");
        unsafe {
            self.qp
                .post_read_buf_at(
                    &reg.mr,
                    local_offset,
                    effective_size,
                    remote_addr,
                    remote_rkey,
                    wr_id,
                    true,
                )
                .map_err(|e| KiroError::Verbs(e.to_string()))
        }
    }

    fn post_write(
        &mut self,
        local: &Rmr,
        local_offset: usize,
        remote_addr: u64,
        remote_rkey: u32,
        effective_size: usize,
        wr_id: u64,
    ) -> Result<()> {
        let reg = self.regions.get(&local.id).expect("unknown region");
        unsafe {
            self.qp
                .post_write_buf_at(
                    &reg.mr,
                    local_offset,
                    effective_size,
                    remote_addr,
                    remote_rkey,
                    wr_id,
                    true,
                )
                .map_err(|e| KiroError::Verbs(e.to_string()))
        }
    }

    fn poll_one(&mut self, wr_id: u64) -> Result<Completion> {
        let mut wcs = [ibverbs::ibv_wc::default(); 16];
        loop {
            let completed = self
                .cq
                .poll(&mut wcs)
                .map_err(|e| KiroError::Verbs(e.to_string()))?;
            for wc in completed.iter() {
                if wc.wr_id() == wr_id {
                    return Ok(Completion {
                        wr_id,
                        status: Self::status_of(wc.status()),
                        opcode: Self::opcode_of(wc.opcode()),
                        imm_data: wc.imm_data(),
                        byte_len: wc.byte_len() as usize,
                    });
                }
            }
        }
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        let mut wcs = [ibverbs::ibv_wc::default(); 16];
        match self.cq.poll(&mut wcs) {
            Ok(completed) => completed
                .iter()
                .map(|wc| Completion {
                    wr_id: wc.wr_id(),
                    status: Self::status_of(wc.status()),
                    opcode: Self::opcode_of(wc.opcode()),
                    imm_data: wc.imm_data(),
                    byte_len: wc.byte_len() as usize,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
