//! # KIRO
//! A remote-memory communication library over RDMA (InfiniBand/RoCE): a
//! shared-memory channel, where a server publishes a region and clients
//! mirror it with RDMA READ, and a messenger, a symmetric two-phase
//! message channel built on RDMA WRITE.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod messenger;
pub mod rdma;
pub mod shm;
pub mod trb;
pub mod wire;

pub use config::Config;
pub use error::{KiroError, Result};
