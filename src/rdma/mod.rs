//! RDMA primitives: registered memory, transport abstraction, and the
//! per-connection control-buffer context.

pub mod connection;
pub mod ibv;
pub mod region;
pub mod transport;

pub use connection::ConnectionContext;
pub use ibv::IbvTransport;
pub use region::{AccessFlags, Rmr};
pub use transport::{Completion, LoopbackTransport, Transport, WcOpcode};
