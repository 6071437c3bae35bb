//! End-to-end scenarios over real loopback sockets and in-process pipes.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{eventually, Event, Recorder};
use relay_transport::{BindError, PrefixLayer};

fn alpha() -> Arc<PrefixLayer> {
    Arc::new(PrefixLayer::new("alpha", "tcp", &b"ALPH"[..]))
}

fn beta() -> Arc<PrefixLayer> {
    Arc::new(PrefixLayer::new("beta", "tcp", &b"BETA"[..]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_protocol_opens_before_any_byte() {
    // Arrange
    let service = common::service(2);
    assert!(service.register_layer(alpha()));
    let recorder = Recorder::new();
    let address = service.address("alpha://127.0.0.1:0").unwrap();
    service.bind(address.clone(), recorder.clone(), None).await.unwrap();
    let local = service.local_addrs(&address)[0];

    // Act: connect and send nothing.
    let _client = TcpStream::connect(local).await.unwrap();
    eventually("opened", || recorder.opened() == 1).await;

    // Assert
    let sessions = recorder.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(recorder.events_of(sessions[0]), vec![Event::Created, Event::Opened]);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_port_delivers_only_to_sniffed_protocol() {
    // Arrange
    let service = common::service(2);
    service.register_layer(alpha());
    service.register_layer(beta());
    let alpha_rec = Recorder::new();
    let beta_rec = Recorder::new();
    let alpha_addr = service.address("alpha://127.0.0.1:0").unwrap();
    let beta_addr = service.address("beta://127.0.0.1:0").unwrap();
    service.bind(alpha_addr.clone(), alpha_rec.clone(), None).await.unwrap();
    service.bind(beta_addr.clone(), beta_rec.clone(), None).await.unwrap();
    assert_eq!(service.listen_count("tcp"), 1);
    let local = service.local_addrs(&alpha_addr)[0];
    assert_eq!(service.local_addrs(&beta_addr), vec![local]);

    // Act
    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"ALPHA says hi").await.unwrap();
    eventually("alpha receives", || {
        alpha_rec.received().values().any(|b| &b[..] == b"ALPHA says hi")
    })
    .await;

    // Assert
    assert_eq!(alpha_rec.count(|e| *e == Event::Created), 1);
    assert!(beta_rec.records().is_empty());

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrecognised_bytes_close_connection_before_created() {
    // Arrange: two sniffed protocols and no fallback on one port.
    let service = common::service(2);
    service.register_layer(alpha());
    service.register_layer(beta());
    let alpha_rec = Recorder::new();
    let beta_rec = Recorder::new();
    let alpha_addr = service.address("alpha://127.0.0.1:0").unwrap();
    let beta_addr = service.address("beta://127.0.0.1:0").unwrap();
    service.bind(alpha_addr.clone(), alpha_rec.clone(), None).await.unwrap();
    service.bind(beta_addr, beta_rec.clone(), None).await.unwrap();
    let local = service.local_addrs(&alpha_addr)[0];

    // Act
    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("server closes the connection");

    // Assert: closed (EOF or reset) with nothing delivered to either handler.
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {read:?}");
    assert!(alpha_rec.records().is_empty());
    assert!(beta_rec.records().is_empty());
    assert_eq!(service.listen_count("tcp"), 1);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_layer_unbind_keeps_shared_listener_open() {
    // Arrange
    let service = common::service(2);
    assert!(service.register_layer(Arc::new(PrefixLayer::new("ws", "tcp", Bytes::new()))));
    let first = Recorder::new();
    let second = Recorder::new();
    let third = Recorder::new();
    let a = service.address("ws://127.0.0.1:0/a").unwrap();
    let b = service.address("ws://127.0.0.1:0/b").unwrap();
    let c = service.address("ws://127.0.0.1:0/c").unwrap();
    service.bind(a.clone(), first.clone(), None).await.unwrap();
    service.bind(b.clone(), second.clone(), None).await.unwrap();
    let listening = service.local_addrs(&a);
    assert_eq!(listening.len(), 1);
    assert_eq!(service.listen_count("tcp"), 1);

    // Act
    service.unbind(a.clone()).await.unwrap();

    // Assert: the path is gone but the socket is not.
    assert!(service.lookup(&a).is_none());
    assert_eq!(service.listen_count("tcp"), 1);
    assert_eq!(service.local_addrs(&a), listening);

    // Act: a new path on the same authority reuses the listener.
    service.bind(c.clone(), third.clone(), None).await.unwrap();

    // Assert
    assert_eq!(service.listen_count("tcp"), 1);
    assert_eq!(service.local_addrs(&c), listening);
    assert!(service.lookup(&c).is_some());

    let _client = TcpStream::connect(listening[0]).await.unwrap();
    eventually("routed session opens", || second.opened() + third.opened() == 1).await;
    assert_eq!(first.opened(), 0);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_layer_path_conflict_is_reported() {
    // Arrange
    let service = common::service(1);
    service.register_layer(Arc::new(PrefixLayer::new("ws", "tcp", Bytes::new())));
    let address = service.address("ws://127.0.0.1:0/chat").unwrap();
    service.bind(address.clone(), Recorder::new(), None).await.unwrap();

    // Act
    let result = service.bind(address.clone(), Recorder::new(), None).await;

    // Assert
    assert!(matches!(result, Err(BindError::Conflict { .. })));
    assert_eq!(service.listen_count("tcp"), 1);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_connections_spread_over_four_workers() {
    // Arrange
    let service = common::service(4);
    let server = Recorder::new();
    let client = Recorder::new();
    let address = service.address("pipe://scenario-d").unwrap();
    service.bind(address.clone(), server.clone(), None).await.unwrap();

    // Act
    let connects = (0..1000).map(|_| service.connect(address.clone(), client.clone(), None, None));
    let sessions = join_all(connects).await;

    // Assert
    assert!(sessions.iter().all(Result::is_ok));
    eventually("every accepted session opens", || server.opened() == 1000).await;
    let loads = service.pool().loads();
    assert_eq!(loads.iter().sum::<usize>(), 2000);
    let (min, max) = (loads.iter().min().unwrap(), loads.iter().max().unwrap());
    assert!(max - min <= 1, "unbalanced loads {loads:?}");

    service.dispose().await;

    for recorder in [&server, &client] {
        let mut threads: HashMap<_, HashSet<_>> = HashMap::new();
        for record in recorder.records() {
            assert_eq!(record.callback_worker, record.session_worker);
            threads.entry(record.session).or_default().insert(record.thread);
        }
        assert_eq!(threads.len(), 1000);
        assert!(threads.values().all(|t| t.len() == 1));
    }
}
