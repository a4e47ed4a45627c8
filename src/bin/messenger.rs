//! Runs one endpoint of a Messenger channel: `--role passive` listens and
//! accepts the peer, `--role active` connects to it. After the connection
//! is up both sides behave symmetrically; this binary additionally submits
//! one message if `--tag`/`--payload` are given, and prints every message
//! it receives.
//!
//! Grounded in `netcat.rs`'s clap-based connection-type selection, applied
//! to the Messenger's Active/Passive roles instead of NetCAT's rdma/local.

use clap::{crate_authors, crate_version, App, Arg};
use kiro::config::Config;
use kiro::event_loop::EventHarness;
use kiro::messenger::{Messenger, Role};
use kiro::rdma::ibv::IbvTransport;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

fn main() -> kiro::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = App::new("kiro-messenger")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Runs one endpoint of a KIRO Messenger channel")
        .arg(
            Arg::with_name("role")
                .long("role")
                .short("r")
                .takes_value(true)
                .possible_values(&["passive", "active"])
                .required(true),
        )
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .short("a")
                .takes_value(true)
                .help("Address to listen on (passive) or connect to (active), overrides KIRO_MSG_ADDR"),
        )
        .arg(
            Arg::with_name("tag")
                .long("tag")
                .takes_value(true)
                .help("If set, submits one message with this 32-bit tag after connecting"),
        )
        .arg(
            Arg::with_name("payload-size")
                .long("payload-size")
                .takes_value(true)
                .default_value("0")
                .help("Payload size in bytes for the submitted message (0 = stub message)"),
        )
        .get_matches();

    let mut config = Config::from_env();
    if let Some(addr) = matches.value_of("addr") {
        config.msg_addr = addr.to_string();
    }

    let (role, transport) = match matches.value_of("role").unwrap() {
        "passive" => {
            let listener = TcpListener::bind(&config.msg_addr)?;
            info!(addr = %config.msg_addr, "messenger listening");
            let (mut stream, peer) = listener.accept()?;
            info!(%peer, "peer connected");
            (
                Role::Passive,
                IbvTransport::accept(&mut stream, config.qp_send_wrs, config.qp_recv_wrs)?,
            )
        }
        "active" => {
            info!(addr = %config.msg_addr, "connecting to peer");
            (
                Role::Active,
                IbvTransport::connect(&config.msg_addr, config.qp_send_wrs, config.qp_recv_wrs)?,
            )
        }
        _ => unreachable!("clap restricted to known values"),
    };

    let mut messenger = Messenger::start(transport, role)?;
    messenger.add_receive_callback(|msg| {
        info!(tag = msg.tag, size = msg.payload.len(), status = ?msg.status, "received message");
    });
    messenger.add_send_callback(|msg| {
        info!(tag = msg.tag, status = ?msg.status, "send completed");
    });

    if let Some(tag) = matches.value_of("tag") {
        let tag: u32 = tag.parse().expect("--tag must be a u32");
        let size: usize = matches.value_of("payload-size").unwrap().parse().unwrap();
        let payload = vec![0u8; size];
        let handle = messenger.submit(tag, payload)?;
        info!(handle, "message submitted");
    }

    // The cooperative harness's idle tick drives every further poll; this
    // thread just keeps the process alive.
    let messenger = Arc::new(Mutex::new(messenger));
    let dispatch_messenger = messenger.clone();
    let _harness = EventHarness::spawn_ticking(move || {
        if let Ok(mut messenger) = dispatch_messenger.lock() {
            let _ = messenger.poll();
        }
    })?;

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
