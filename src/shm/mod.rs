//! The Shared-Memory Channel: a server publishes a region, and clients pull
//! it into a local mirror with one-sided RDMA READs.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;
