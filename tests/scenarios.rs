//! Integration scenarios from the shared-memory channel and messenger
//! specifications, run against [`kiro::rdma::LoopbackTransport`] so no RDMA
//! hardware is required — the same idiom as the teacher's
//! `tests/local_tests.rs`, generalized from its `LocalMemoryConnector` to
//! this crate's `Transport` trait.

use kiro::error::KiroError;
use kiro::messenger::{Messenger, MessageStatus, Role};
use kiro::rdma::LoopbackTransport;
use kiro::shm::{Client, Server};

#[test]
fn scenario_single_sync() {
    let publisher = LoopbackTransport::new();
    let (server_side, client_side) = publisher.accept_connection();
    let mut server = Server::new(publisher, &[0xABu8; 4096]).unwrap();
    server.accept_client(server_side).unwrap();

    let mut client = Client::connect(client_side).unwrap();
    client.sync().unwrap();

    let mirror = client.get_memory();
    assert_eq!(mirror.len(), 4096);
    assert!(mirror.iter().all(|&b| b == 0xAB));
}

#[test]
fn scenario_partial_sync() {
    let mut region = vec![0u8; 1024];
    for b in region[0..1024].iter_mut() {
        *b = 0;
    }
    for (i, b) in region[256..384].iter_mut().enumerate() {
        *b = i as u8;
    }

    let publisher = LoopbackTransport::new();
    let (server_side, client_side) = publisher.accept_connection();
    let mut server = Server::new(publisher, &region).unwrap();
    server.accept_client(server_side).unwrap();

    let mut client = Client::connect(client_side).unwrap();
    client.sync_partial(256, 128, 512).unwrap();

    assert_eq!(&client.get_memory()[512..640], &region[256..384]);
    assert_eq!(&client.get_memory()[0..512], &vec![0u8; 512][..]);
}

#[test]
fn scenario_out_of_bounds_sync_is_rejected() {
    let publisher = LoopbackTransport::new();
    let (server_side, client_side) = publisher.accept_connection();
    let mut server = Server::new(publisher, &[0u8; 1024]).unwrap();
    server.accept_client(server_side).unwrap();

    let mut client = Client::connect(client_side).unwrap();
    let err = client.sync_partial(2000, 0, 0).unwrap_err();
    assert!(matches!(err, KiroError::InvalidArgument(_)));
    // The mirror must be untouched by the rejected call.
    assert!(client.get_memory().iter().all(|&b| b == 0));
}

#[test]
fn scenario_reallocation_across_multiple_clients() {
    let publisher = LoopbackTransport::new();
    let (server_side_a, client_side_a) = publisher.accept_connection();
    let (server_side_b, client_side_b) = publisher.accept_connection();
    let mut server = Server::new(publisher, &[0u8; 1024]).unwrap();
    let id_a = server.accept_client(server_side_a).unwrap();
    let id_b = server.accept_client(server_side_b).unwrap();

    let mut client_a = Client::connect(client_side_a).unwrap();
    let mut client_b = Client::connect(client_side_b).unwrap();
    assert_eq!(client_a.get_memory_size(), 1024);
    assert_eq!(client_b.get_memory_size(), 1024);

    server.reallocate(&[0x42u8; 8192]).unwrap();
    assert_eq!(server.client_count(), 2);

    client_a.poll().unwrap();
    client_b.poll().unwrap();
    assert_eq!(client_a.get_memory_size(), 8192);
    assert_eq!(client_b.get_memory_size(), 8192);

    client_a.sync().unwrap();
    client_b.sync().unwrap();
    assert!(client_a.get_memory().iter().all(|&b| b == 0x42));
    assert!(client_b.get_memory().iter().all(|&b| b == 0x42));

    // The server only finishes tearing down the old region once every
    // client has acknowledged the new one.
    server.poll_client(id_a).unwrap();
    server.poll_client(id_b).unwrap();
}

#[test]
fn scenario_messenger_stub_message() {
    let (active_t, passive_t) = LoopbackTransport::pair();
    let mut active = Messenger::start(active_t, Role::Active).unwrap();
    let mut passive = Messenger::start(passive_t, Role::Passive).unwrap();

    let mut delivered = None;
    passive.add_receive_callback(|msg| {
        delivered = Some((msg.tag, msg.status, msg.payload.is_empty()));
    });
    let mut send_status = None;
    active.add_send_callback(|msg| {
        send_status = Some(msg.status);
    });

    active.submit(0x1234, Vec::new()).unwrap();
    passive.poll().unwrap(); // MSG_STUB -> deliver + ACK_MSG
    active.poll().unwrap(); // ACK_MSG -> send callback

    let (tag, status, empty) = delivered.expect("message delivered");
    assert_eq!(tag, 0x1234);
    assert_eq!(status, MessageStatus::Received);
    assert!(empty);
    assert_eq!(send_status, Some(MessageStatus::SendSuccess));
}

#[test]
fn scenario_messenger_large_payload() {
    let (active_t, passive_t) = LoopbackTransport::pair();
    let mut active = Messenger::start(active_t, Role::Active).unwrap();
    let mut passive = Messenger::start(passive_t, Role::Passive).unwrap();

    let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let mut received_payload = None;
    let mut received_tag = None;
    passive.add_receive_callback(|msg| {
        received_payload = Some(msg.payload.clone());
        received_tag = Some(msg.tag);
    });

    let mut send_status = None;
    active.add_send_callback(|msg| {
        send_status = Some(msg.status);
    });

    active.submit(7, payload.clone()).unwrap();
    passive.poll().unwrap(); // REQ_RDMA -> register + ACK_RDMA
    active.poll().unwrap(); // ACK_RDMA -> RDMA WRITE posted + completed
    active.poll().unwrap(); // WRITE completion -> RDMA_DONE sent
    passive.poll().unwrap(); // RDMA_DONE -> deliver to callback

    assert_eq!(received_tag, Some(7));
    assert_eq!(received_payload, Some(payload));
    assert_eq!(send_status, Some(MessageStatus::SendSuccess));
}

#[test]
fn scenario_ping_times_out_when_no_pong_arrives() {
    let publisher = LoopbackTransport::new();
    let (server_side, client_side) = publisher.accept_connection();
    let mut server = Server::new(publisher, &[0u8; 16]).unwrap();
    server.accept_client(server_side).unwrap();

    let mut config = kiro::Config::default();
    config.ping_timeout = std::time::Duration::from_millis(50);
    let mut client = Client::connect_with_config(client_side, &config).unwrap();

    // The server's event loop never runs again, so PING is never answered.
    let start = std::time::Instant::now();
    let result = client.ping().unwrap();
    assert_eq!(result, -1);
    assert!(start.elapsed() >= std::time::Duration::from_millis(50));
}
