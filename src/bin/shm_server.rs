//! Publishes a shared-memory region over RDMA and keeps serving clients as
//! they connect, accepting the first connection as the publisher's own
//! bulk RDMA buffer and every connection after that as a mirroring client.
//!
//! Grounded in `rdma_server.rs`'s CLI-then-bind-and-accept shape,
//! generalized from its single fixed 4096-byte buffer to the Triple Ring
//! Buffer the Shared-Memory Server publishes from (spec.md §4.6).

use clap::{crate_authors, crate_version, App, Arg};
use kiro::config::Config;
use kiro::event_loop::EventHarness;
use kiro::rdma::ibv::IbvTransport;
use kiro::shm::Server;
use kiro::trb::TripleRingBuffer;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

fn main() -> kiro::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = App::new("kiro-shm-server")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Publishes a shared-memory region over RDMA")
        .arg(
            Arg::with_name("elem-size")
                .long("elem-size")
                .takes_value(true)
                .default_value("64")
                .help("Element size of the published Triple Ring Buffer"),
        )
        .arg(
            Arg::with_name("count")
                .long("count")
                .takes_value(true)
                .default_value("8")
                .help("Element count of the published Triple Ring Buffer"),
        )
        .get_matches();

    let elem_size: usize = matches.value_of("elem-size").unwrap().parse().unwrap();
    let count: usize = matches.value_of("count").unwrap().parse().unwrap();

    let config = Config::from_env();
    let listener = TcpListener::bind(&config.shm_addr)?;
    info!(addr = %config.shm_addr, "shared-memory server listening");

    let mut trb = TripleRingBuffer::reshape(elem_size, count);
    trb.push(&vec![0xABu8; elem_size]);

    let (mut stream, peer) = listener.accept()?;
    info!(%peer, "publisher connection accepted");
    let publisher = IbvTransport::accept(&mut stream, config.qp_send_wrs, config.qp_recv_wrs)?;
    let server = Arc::new(Mutex::new(Server::new(publisher, trb.get(-1))?));

    // The harness's idle tick keeps every connected client's completions
    // drained; this thread is now free to block on `accept` for new ones.
    let dispatch_server = server.clone();
    let _harness = EventHarness::spawn_ticking(move || {
        if let Ok(mut server) = dispatch_server.lock() {
            let _ = server.poll_all();
        }
    })?;

    loop {
        let (mut stream, peer) = listener.accept()?;
        let client_transport = match IbvTransport::accept(&mut stream, config.qp_send_wrs, config.qp_recv_wrs) {
            Ok(t) => t,
            Err(e) => {
                warn!(%peer, error = %e, "rejecting client: RDMA handshake failed");
                continue;
            }
        };
        let id = server.lock().unwrap().accept_client(client_transport)?;
        info!(client = id, %peer, "accepted shared-memory client");
    }
}
