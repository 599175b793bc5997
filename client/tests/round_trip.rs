#![cfg(unix)]

mod common;

use std::thread;

use common::*;
use localwire_client::{Client, IpcError, Message};
use localwire_common::Status;
use localwire_server::Server;

#[test]
fn messages_arrive_in_order_both_ways() {
    let dir = socket_dir();
    let (server, client) = connected_pair(
        "ordered",
        server_config(dir.path()),
        client_config(dir.path()),
    );

    for i in 1..=20u32 {
        client.send(i, format!("to server {i}")).unwrap();
    }
    for i in 1..=20u32 {
        assert_eq!(
            expect_message(&server),
            Message::new(i, format!("to server {i}"))
        );
    }

    for i in 1..=20u32 {
        server.send(100 + i, format!("to client {i}")).unwrap();
    }
    for i in 1..=20u32 {
        let message = expect_message(&client);
        assert_eq!(message.msg_type, 100 + i);
        assert_eq!(message.text(), format!("to client {i}"));
    }

    client.close();
    server.close();
}

#[test]
fn empty_and_maximum_payloads() {
    let dir = socket_dir();
    let (server, client) = connected_pair(
        "sizes",
        server_config(dir.path()).with_max_msg_size(64 * 1024),
        client_config(dir.path()),
    );
    assert_eq!(client.max_msg_size(), 64 * 1024);

    client.send(1, Vec::new()).unwrap();
    assert_eq!(expect_message(&server), Message::new(1, Vec::new()));

    // Large enough to fill the socket buffer; the server reads on this thread
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    thread::scope(|scope| {
        let expected = payload.clone();
        scope.spawn(|| client.send(2, expected).unwrap());
        assert_eq!(expect_message(&server), Message::new(2, payload.clone()));
    });

    client.close();
    server.close();
}

#[test]
fn encrypted_channel_hides_payloads() {
    let dir = socket_dir();
    let harness = Harness::new();

    let server = Server::start("sealed", server_config(dir.path()).with_encryption(true)).unwrap();
    expect_status(&server, Status::Listening);
    let client = Client::connect_with(
        harness.transport(),
        "sealed",
        client_config(dir.path()).with_encryption_required(true),
    )
    .unwrap();
    expect_status(&client, Status::Connecting);
    expect_status(&client, Status::Connected);
    expect_status(&server, Status::Connected);

    client.send(7, "client secret payload").unwrap();
    assert_eq!(
        expect_message(&server),
        Message::new(7, "client secret payload")
    );
    server.send(8, "server secret payload").unwrap();
    assert_eq!(
        expect_message(&client),
        Message::new(8, "server secret payload")
    );

    let wire = harness.wire();
    assert!(!wire.is_empty());
    assert!(!contains(&wire, b"client secret payload"));
    assert!(!contains(&wire, b"server secret payload"));

    client.close();
    server.close();
}

#[test]
fn plaintext_channel_is_readable_on_the_wire() {
    let dir = socket_dir();
    let harness = Harness::new();

    let server = Server::start("plain", server_config(dir.path()).with_encryption(false)).unwrap();
    expect_status(&server, Status::Listening);
    let client =
        Client::connect_with(harness.transport(), "plain", client_config(dir.path())).unwrap();
    expect_status(&client, Status::Connecting);
    expect_status(&client, Status::Connected);
    expect_status(&server, Status::Connected);

    client.send(3, "visible payload").unwrap();
    assert_eq!(expect_message(&server), Message::new(3, "visible payload"));
    assert!(contains(&harness.wire(), b"visible payload"));

    client.close();
    server.close();
}

#[test]
fn invalid_sends_are_rejected() {
    let dir = socket_dir();
    let (server, client) = connected_pair(
        "invalid-sends",
        server_config(dir.path()).with_max_msg_size(2048),
        client_config(dir.path()),
    );

    assert!(matches!(client.send(0, "control"), Err(IpcError::ReservedType)));
    assert!(matches!(server.send(0, "control"), Err(IpcError::ReservedType)));

    let err = client.send(1, vec![0u8; 2049]).unwrap_err();
    assert!(matches!(err, IpcError::MessageTooLarge { len: 2049, max: 2048 }));
    assert!(matches!(
        server.send(1, vec![0u8; 2049]),
        Err(IpcError::MessageTooLarge { .. })
    ));

    // Nothing was written, the channel still works
    client.send(1, vec![0u8; 2048]).unwrap();
    assert_eq!(expect_message(&server).data.len(), 2048);

    client.close();
    server.close();
}
