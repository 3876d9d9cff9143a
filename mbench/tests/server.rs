use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Barrier,
    thread,
    time::{Duration, Instant},
};

use mbench::{
    backend::in_memory::InMemoryBackend,
    client::Client,
    protocol::{Command, CommandKind, Response, decode_response, encode_command},
    server::{Server, ServerConfig, ServerHandle},
    workload::BatchParams,
};
use pretty_assertions::assert_eq;

fn start(backend: InMemoryBackend) -> ServerHandle {
    Server::start(
        ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            poll_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        },
        backend,
    )
    .unwrap()
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn batch(client_id: i32, num_clients: i64, base_insert_key: i64, base_delete_key: i64) -> BatchParams {
    BatchParams {
        num_ops: 100,
        insert_prob: 0.4,
        delete_prob: 0.3,
        update_prob: 0.3,
        client_id,
        num_clients,
        base_insert_key,
        base_delete_key,
    }
}

#[test_log::test]
fn full_command_sequence() {
    let server = start(InMemoryBackend::new());
    let mut client = Client::connect(server.local_addr()).unwrap();

    let response = client.create_schema(10).unwrap();
    assert!(response.success, "{}", response.message);

    let response = client.populate(0, 1000).unwrap();
    assert!(response.success);
    assert_eq!(response.message, "");

    let reply = client.batch_op(batch(0, 1, 999, 0)).unwrap();
    assert!(reply.response.success, "{}", reply.response.message);
    assert!(reply.base_insert_key >= 999);
    assert!(reply.base_delete_key >= 0);

    let reply = client
        .batch_op(batch(0, 1, reply.base_insert_key, reply.base_delete_key))
        .unwrap();
    assert!(reply.response.success, "{}", reply.response.message);

    assert!(client.query(CommandKind::Query1).unwrap().success);
    assert_eq!(
        client.query(CommandKind::Query2).unwrap(),
        Response::not_implemented(CommandKind::Query2)
    );
    assert_eq!(
        client.query(CommandKind::Query3).unwrap(),
        Response::not_implemented(CommandKind::Query3)
    );

    client.disconnect().unwrap();
    server.shutdown().unwrap();
}

#[test_log::test]
fn configuration_errors_keep_the_session_open() {
    let server = start(InMemoryBackend::new());
    let mut client = Client::connect(server.local_addr()).unwrap();
    client.create_schema(10).unwrap();

    let reply = client
        .batch_op(BatchParams {
            insert_prob: 0.5,
            delete_prob: 0.5,
            update_prob: 0.5,
            ..batch(0, 1, 10, 0)
        })
        .unwrap();
    assert!(!reply.response.success);
    assert_eq!((reply.base_insert_key, reply.base_delete_key), (10, 0));

    assert!(!client.populate(10, 0).unwrap().success);
    assert!(!client.create_schema(-1).unwrap().success);
    assert!(client.populate(0, 10).unwrap().success);
}

#[test_log::test]
fn oversized_requests_are_refused_and_the_server_keeps_serving() {
    let server = start(InMemoryBackend::new());
    let mut client = Client::connect(server.local_addr()).unwrap();
    assert!(client.create_schema(10).unwrap().success);

    let reply = client
        .batch_op(BatchParams {
            num_ops: i32::MAX,
            insert_prob: 1.0,
            delete_prob: 0.0,
            update_prob: 0.0,
            ..batch(0, 1, 10, 0)
        })
        .unwrap();
    assert!(!reply.response.success);
    assert_eq!((reply.base_insert_key, reply.base_delete_key), (10, 0));

    assert!(!client.populate(i64::MIN, i64::MAX).unwrap().success);
    assert!(!client.create_schema(i32::MAX).unwrap().success);

    // the same session and a fresh one are both still answered
    assert!(client.populate(0, 10).unwrap().success);
    let mut other = Client::connect(server.local_addr()).unwrap();
    assert!(other.query(CommandKind::Query1).unwrap().success);
    assert_eq!(server.active_sessions(), 2);
}

#[test_log::test]
fn disconnect_removes_exactly_one_session() {
    let server = start(InMemoryBackend::new());

    let first = Client::connect(server.local_addr()).unwrap();
    let mut second = Client::connect(server.local_addr()).unwrap();
    wait_for("two sessions", || server.active_sessions() == 2);

    first.disconnect().unwrap();
    wait_for("one session", || server.active_sessions() == 1);

    // the listener keeps accepting
    let mut third = Client::connect(server.local_addr()).unwrap();
    assert!(!third.query(CommandKind::Query2).unwrap().success);
    assert!(!second.query(CommandKind::Query3).unwrap().success);
    assert_eq!(server.active_sessions(), 2);

    drop(second);
    wait_for("closed socket to be noticed", || server.active_sessions() == 1);
}

#[test_log::test]
fn malformed_frame_closes_only_its_session() {
    let server = start(InMemoryBackend::new());
    let mut healthy = Client::connect(server.local_addr()).unwrap();

    let mut raw = TcpStream::connect(server.local_addr()).unwrap();
    let mut frame = 12i64.to_le_bytes().to_vec();
    frame.extend_from_slice(&99i32.to_le_bytes());
    raw.write_all(&frame).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut buffer = [0u8; 16];
    // either a clean close or a reset, never a response
    assert!(matches!(raw.read(&mut buffer), Ok(0) | Err(_)));

    assert!(healthy.create_schema(10).unwrap().success);
    wait_for("one session", || server.active_sessions() == 1);
}

#[test_log::test]
fn pipelined_commands_are_all_answered() {
    let server = start(InMemoryBackend::new());
    let mut raw = TcpStream::connect(server.local_addr()).unwrap();

    let mut frames = vec![];
    for command in [Command::Query2, Command::Query3, Command::Query2] {
        encode_command(&command, &mut frames);
    }
    // sent in two pieces that split the second frame
    raw.write_all(&frames[..17]).unwrap();
    raw.flush().unwrap();
    thread::sleep(Duration::from_millis(20));
    raw.write_all(&frames[17..]).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut received = vec![];
    let mut messages = vec![];
    let mut chunk = [0u8; 256];
    while messages.len() < 3 {
        let read = raw.read(&mut chunk).unwrap();
        assert!(read > 0, "server closed the session");
        received.extend_from_slice(&chunk[..read]);

        // the stubs share one response layout
        while let Some((response, len)) = decode_response(CommandKind::Query2, &received).unwrap() {
            messages.push(response.message);
            received.drain(..len);
        }
    }

    messages.sort();
    assert_eq!(
        messages,
        vec![
            "Q2 is not implemented",
            "Q2 is not implemented",
            "Q3 is not implemented"
        ]
    );
}

#[test_log::test]
fn concurrent_clients_never_collide() {
    const CLIENTS: i32 = 4;
    const BATCHES: usize = 20;

    let backend = InMemoryBackend::new();
    let server = start(backend.clone());

    let mut setup = Client::connect(server.local_addr()).unwrap();
    assert!(setup.create_schema(10).unwrap().success);
    assert!(setup.populate(0, 1000).unwrap().success);

    let barrier = Barrier::new(usize::try_from(CLIENTS).unwrap());
    let num_clients = i64::from(CLIENTS);

    let watermarks: Vec<(i64, i64)> = thread::scope(|s| {
        let handles: Vec<_> = (0..CLIENTS)
            .map(|client_id| {
                let barrier = &barrier;
                let address = server.local_addr();

                s.spawn(move || {
                    let mut client = Client::connect(address).unwrap();
                    let class = i64::from(client_id);
                    // highest populated key of this client's class
                    let mut marks = (999 - (999 - class) % num_clients, class);

                    barrier.wait();
                    for _ in 0..BATCHES {
                        let reply = client
                            .batch_op(batch(client_id, num_clients, marks.0, marks.1))
                            .unwrap();
                        assert!(reply.response.success, "{}", reply.response.message);
                        marks = (reply.base_insert_key, reply.base_delete_key);
                    }

                    marks
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected_rows: i64 = watermarks
        .iter()
        .map(|(insert, delete)| (insert - delete) / num_clients + 1)
        .sum();
    assert_eq!(
        i64::try_from(backend.row_count().unwrap()).unwrap(),
        expected_rows
    );
}

#[test_log::test]
fn shutdown_closes_open_sessions() {
    let server = start(InMemoryBackend::new());
    let mut client = Client::connect(server.local_addr()).unwrap();
    assert!(!client.query(CommandKind::Query2).unwrap().success);

    server.shutdown().unwrap();

    assert!(client.query(CommandKind::Query2).is_err());
}
