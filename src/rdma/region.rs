//! Registered Memory Region (RMR) descriptor.
//!
//! `connection/rdma.rs` keeps its pinned buffer behind
//! `ibverbs::MemoryRegion<T>` and reaches into it by index (`self.mr[0]`). A
//! real `MemoryRegion` can't be copied or shared cheaply, so the rest of
//! this crate holds RMRs by a lightweight, `Copy` descriptor (`Rmr`) and
//! asks the owning `Transport` for the backing bytes when it needs them.
//! The `Transport` is the only thing that actually owns registrations.

use std::ops::{BitOr, BitOrAssign};

/// Access flags for a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const NONE: AccessFlags = AccessFlags(0);
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 2);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;
    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: AccessFlags) {
        self.0 |= rhs.0;
    }
}

/// A pinned, RDMA-accessible byte buffer descriptor.
///
/// Invariant: while a peer holds `rkey`, the region behind this descriptor
/// must not be freed or reallocated without an explicit control message
/// invalidating it first (the ACK-first reallocation handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rmr {
    /// Opaque handle the owning `Transport` uses to find the backing bytes.
    pub(crate) id: u64,
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
    pub access: AccessFlags,
}

impl Rmr {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}
