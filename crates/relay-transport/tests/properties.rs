//! Behavioural guarantees of the transport service: binding symmetry,
//! listener reference counting, worker affinity, dispatch determinism and
//! idle notification timing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{eventually, Event, Recorder};
use relay_transport::{
    BindError, IdleStatus, IoHandler, PrefixLayer, ResourceAddress, ResourceOptions, Session,
    TransportService, UnbindError, WorkerContext, WorkerId,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bind_unbind_symmetry_under_interleaving() {
    // Arrange
    let service = common::service(2);

    // Act: eight tasks cycle their own address while the others do the same.
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                let address = service.address(&format!("pipe://symmetry-{i}")).unwrap();
                for _ in 0..25 {
                    service.bind(address.clone(), Recorder::new(), None).await.unwrap();
                    let bound = service.lookup(&address).expect("bound address resolves");
                    assert_eq!(bound.address(), &address);
                    service.unbind(address.clone()).await.unwrap();
                    assert!(service.lookup(&address).is_none());
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Assert
    assert_eq!(service.listen_count("pipe"), 0);
    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_protocols_share_one_listener_until_both_unbind() {
    // Arrange
    let service = common::service(2);
    service.register_layer(Arc::new(PrefixLayer::new("alpha", "tcp", &b"ALPH"[..])));
    service.register_layer(Arc::new(PrefixLayer::new("beta", "tcp", &b"BETA"[..])));
    let alpha = service.address("alpha://127.0.0.1:0").unwrap();
    let beta = service.address("beta://127.0.0.1:0").unwrap();

    // Act / Assert
    service.bind(alpha.clone(), Recorder::new(), None).await.unwrap();
    service.bind(beta.clone(), Recorder::new(), None).await.unwrap();
    assert_eq!(service.listen_count("tcp"), 1);

    service.unbind(alpha.clone()).await.unwrap();
    assert_eq!(service.listen_count("tcp"), 1);
    assert!(service.lookup(&alpha).is_none());
    assert!(service.lookup(&beta).is_some());

    service.unbind(beta.clone()).await.unwrap();
    assert_eq!(service.listen_count("tcp"), 0);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alternate_failure_rolls_back_primary() {
    // Arrange: something else already listens on the alternate's port.
    let service = common::service(1);
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let busy = format!("tcp://127.0.0.1:{port}");
    let address = service
        .address_with_alternates(&["pipe://primary", busy.as_str()], ResourceOptions::default())
        .unwrap();
    let alternate = address.alternates()[0].clone();

    // Act
    let result = service.bind(address, Recorder::new(), None).await;

    // Assert: the whole bind fails, names the alternate and leaves nothing bound.
    let error = result.expect_err("busy alternate fails the bind");
    assert!(matches!(error, BindError::AddressInUse { .. }), "unexpected error: {error}");
    assert_eq!(error.address(), alternate.uri());
    let primary = service.address("pipe://primary").unwrap();
    assert!(service.lookup(&primary).is_none());
    assert!(service.lookup(&alternate).is_none());
    assert_eq!(service.listen_count("pipe"), 0);
    assert_eq!(service.listen_count("tcp"), 0);

    service.dispose().await;
}

/// Unbinds its own listening address from inside `session_opened`.
struct UnbindOnOpen {
    service: TransportService,
    address: Mutex<Option<ResourceAddress>>,
    outcome: Arc<Mutex<Option<Result<(), UnbindError>>>>,
}

impl IoHandler for UnbindOnOpen {
    fn session_opened(&self, cx: &WorkerContext, _session: &Session) {
        let Some(address) = self.address.lock().take() else {
            return;
        };
        let unbinding = self.service.unbind(address);
        let outcome = Arc::clone(&self.outcome);
        cx.spawn_local(async move {
            *outcome.lock() = Some(unbinding.await);
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbind_from_own_callback_completes() {
    // Arrange
    let service = common::service(1);
    let outcome = Arc::new(Mutex::new(None));
    let handler = Arc::new(UnbindOnOpen {
        service: service.clone(),
        address: Mutex::new(None),
        outcome: Arc::clone(&outcome),
    });
    let address = service.address("tcp://127.0.0.1:0").unwrap();
    service.bind(address.clone(), handler.clone(), None).await.unwrap();
    *handler.address.lock() = Some(address.clone());
    let local = service.local_addrs(&address)[0];

    // Act
    let _client = TcpStream::connect(local).await.unwrap();
    eventually("unbind completes", || outcome.lock().is_some()).await;

    // Assert: the worker was not blocked and the listener is gone.
    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert_eq!(service.listen_count("tcp"), 0);
    assert!(service.lookup(&address).is_none());

    service.dispose().await;
}

/// Records the worker of every session it sees, then dials `target` from
/// inside the callback pinned to the same worker.
struct AffinityRecorder {
    service: TransportService,
    target: ResourceAddress,
    outbound: Arc<Recorder>,
    seen: Mutex<Vec<(WorkerId, WorkerId)>>,
}

impl IoHandler for AffinityRecorder {
    fn session_opened(&self, cx: &WorkerContext, session: &Session) {
        let parent = session.parent().map(Session::worker);
        self.seen
            .lock()
            .push((cx.worker(), parent.unwrap_or_else(|| session.worker())));
        let connecting = self
            .service
            .connect_from(cx, self.target.clone(), self.outbound.clone(), None);
        cx.spawn_local(async move {
            let _ = connecting.await;
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_layered_and_outbound_sessions_stay_on_accepting_worker() {
    // Arrange
    let service = common::service(4);
    service.register_layer(Arc::new(PrefixLayer::new("alpha", "tcp", &b"ALPH"[..])));
    let backend = service.address("pipe://backend").unwrap();
    service.bind(backend.clone(), Recorder::new(), None).await.unwrap();
    let outbound = Recorder::new();
    let front_handler = Arc::new(AffinityRecorder {
        service: service.clone(),
        target: backend,
        outbound: outbound.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let front = service.address("alpha://127.0.0.1:0").unwrap();
    service.bind(front.clone(), front_handler.clone(), None).await.unwrap();
    let local = service.local_addrs(&front)[0];

    // Act
    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(TcpStream::connect(local).await.unwrap());
    }
    eventually("outbound sessions open", || outbound.opened() == 8).await;

    // Assert: bridge sessions run on their parent's worker...
    let seen = front_handler.seen.lock().clone();
    assert_eq!(seen.len(), 8);
    assert!(seen.iter().all(|(callback, parent)| callback == parent));

    // ...and every outbound session runs on the worker that dialled it.
    let accepting: Vec<WorkerId> = seen.iter().map(|(w, _)| *w).collect();
    let mut dialled: Vec<WorkerId> = outbound
        .records()
        .iter()
        .filter(|r| r.event == Event::Opened)
        .map(|r| r.session_worker)
        .collect();
    let mut expected = accepting.clone();
    expected.sort();
    dialled.sort();
    assert_eq!(dialled, expected);

    drop(clients);
    service.dispose().await;
}

async fn deliver(local: std::net::SocketAddr, payload: &[u8], byte_by_byte: bool) {
    let mut client = TcpStream::connect(local).await.unwrap();
    client.set_nodelay(true).unwrap();
    if byte_by_byte {
        for byte in payload {
            client.write_all(&[*byte]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    } else {
        client.write_all(payload).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_is_independent_of_chunking() {
    // Arrange
    let service = common::service(2);
    service.register_layer(Arc::new(PrefixLayer::new("alpha", "tcp", &b"ALPH"[..])));
    service.register_layer(Arc::new(PrefixLayer::new("beta", "tcp", &b"BETA"[..])));
    let alpha_rec = Recorder::new();
    let beta_rec = Recorder::new();
    let alpha = service.address("alpha://127.0.0.1:0").unwrap();
    let beta = service.address("beta://127.0.0.1:0").unwrap();
    service.bind(alpha.clone(), alpha_rec.clone(), None).await.unwrap();
    service.bind(beta, beta_rec.clone(), None).await.unwrap();
    let local = service.local_addrs(&alpha)[0];
    let payload = b"BETA:hello over a shared port";

    // Act
    tokio::join!(deliver(local, payload, false), deliver(local, payload, true));
    eventually("both connections deliver everything", || {
        let received = beta_rec.received();
        received.len() == 2 && received.values().all(|b| &b[..] == payload)
    })
    .await;

    // Assert
    assert!(alpha_rec.records().is_empty());
    assert_eq!(beta_rec.opened(), 2);

    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_idle_fires_once_then_resets_on_read() {
    // Arrange
    let threshold = Duration::from_millis(300);
    let service = common::service(1);
    let recorder = Recorder::new();
    let address = service
        .address_with(
            "tcp://127.0.0.1:0",
            ResourceOptions::default().with_read_idle(threshold),
        )
        .unwrap();
    service.bind(address.clone(), recorder.clone(), None).await.unwrap();
    let mut client = TcpStream::connect(service.local_addrs(&address)[0]).await.unwrap();
    eventually("opened", || recorder.opened() == 1).await;
    let opened_at = recorder.records()[1].at;

    // Act: stay silent past the threshold.
    eventually("first idle", || recorder.idle_records().len() == 1).await;
    client.write_all(b"ping").await.unwrap();
    eventually("read", || recorder.count(|e| matches!(e, Event::Received(_))) == 1).await;
    let read_at = recorder
        .records()
        .iter()
        .find(|r| matches!(r.event, Event::Received(_)))
        .map(|r| r.at)
        .unwrap();
    eventually("second idle", || recorder.idle_records().len() == 2).await;

    // Assert
    let idle = recorder.idle_records();
    let first = match &idle[0].event {
        Event::Idle(e) => *e,
        other => panic!("unexpected {other:?}"),
    };
    let second = match &idle[1].event {
        Event::Idle(e) => *e,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(first.status, IdleStatus::ReaderIdle);
    assert_eq!(first.idle_count, 1);
    assert!(idle[0].at.duration_since(opened_at) >= threshold - Duration::from_millis(25));
    assert_eq!(second.status, IdleStatus::ReaderIdle);
    assert_eq!(second.idle_count, 1, "a read starts a new idle window");
    assert!(idle[1].at.duration_since(read_at) >= threshold - Duration::from_millis(25));

    drop(client);
    service.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_threshold_disabled_means_no_events() {
    // Arrange
    let service = common::service(1);
    let recorder = Recorder::new();
    let address = service.address("tcp://127.0.0.1:0").unwrap();
    service.bind(address.clone(), recorder.clone(), None).await.unwrap();
    let _client = TcpStream::connect(service.local_addrs(&address)[0]).await.unwrap();
    eventually("opened", || recorder.opened() == 1).await;

    // Act
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Assert
    assert!(recorder.idle_records().is_empty());
    service.dispose().await;
}
