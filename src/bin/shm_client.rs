//! Connects to a `kiro-shm-server`, mirrors its region, and repeatedly
//! syncs and pings it, printing round-trip latency. The client-side
//! counterpart of `shm_server.rs`, grounded in `rdma_client.rs`'s
//! connect-then-loop shape.

use clap::{crate_authors, crate_version, App, Arg};
use kiro::config::Config;
use kiro::event_loop::EventHarness;
use kiro::rdma::ibv::IbvTransport;
use kiro::shm::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

fn main() -> kiro::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = App::new("kiro-shm-client")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Mirrors a shared-memory server's region over RDMA")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .short("a")
                .takes_value(true)
                .help("Server address, overrides KIRO_SHM_ADDR"),
        )
        .arg(
            Arg::with_name("iterations")
                .long("iterations")
                .short("n")
                .takes_value(true)
                .default_value("10"),
        )
        .get_matches();

    let mut config = Config::from_env();
    if let Some(addr) = matches.value_of("addr") {
        config.shm_addr = addr.to_string();
    }
    let iterations: usize = matches.value_of("iterations").unwrap().parse().unwrap();

    let transport = IbvTransport::connect(&config.shm_addr, config.qp_send_wrs, config.qp_recv_wrs)?;
    let client = Client::connect_with_config(transport, &config)?;
    info!(size = client.get_memory_size(), "mirror provisioned");
    let client = Arc::new(Mutex::new(client));

    // The harness's idle tick keeps the mirror's REALLOC handling live
    // between sync/ping calls, so a server-side resize is picked up even
    // while this thread is sleeping.
    let dispatch_client = client.clone();
    let _harness = EventHarness::spawn_ticking(move || {
        if let Ok(mut client) = dispatch_client.lock() {
            let _ = client.poll();
        }
    })?;

    for i in 0..iterations {
        let mut client = client.lock().unwrap();
        client.sync()?;
        match client.ping()? {
            -1 => info!(iteration = i, "ping timed out"),
            micros => info!(iteration = i, micros, "ping round trip"),
        }
        drop(client);
        std::thread::sleep(Duration::from_millis(200));
    }

    client.lock().unwrap().disconnect()?;
    Ok(())
}
