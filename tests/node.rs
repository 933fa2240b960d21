use std::{
    net::{IpAddr, Ipv4Addr},
    time::{Duration, Instant},
};

use futures::future::join_all;
use synapse::{
    net::wire::{PacketFlags, CHANNEL_RPC_REPLY, DEFAULT_TTL, SERVICE_RPC},
    rpc::{codec::to_bytes, dispatch::RpcMessage},
    Address, CallError, Node, NodeConfig, NodeError, Packet, PromiseState, RouteError, Uri,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> NodeConfig {
    NodeConfig::builder()
        .listen_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .maintenance_interval(Duration::from_millis(100))
        .cleanup_interval(Duration::from_millis(500))
        .call_timeout(Duration::from_secs(5))
        .build()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Starts `a` listening on an ephemeral port and `b` with `a` as its
/// persistent peer, then waits for the routing handshake on both sides.
async fn connected_pair() -> (Node, Node, Uri) {
    init_tracing();
    let a = Node::new(config());
    a.start(&[0], []).await.unwrap();
    let locator = Uri::tcp("127.0.0.1", a.listening_ports()[0]);

    let b = Node::new(config());
    b.start(&[], [locator.clone()]).await.unwrap();

    eventually("both sides to see one direct peer", || {
        a.direct_peers().len() == 1 && b.direct_peers().len() == 1
    })
    .await;
    (a, b, locator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_lists_exactly_one_direct_peer_each() {
    let (a, b, locator) = connected_pair().await;

    let seen_by_a = &a.direct_peers()[0];
    let seen_by_b = &b.direct_peers()[0];
    assert_eq!(seen_by_a.address, b.address());
    assert_eq!(seen_by_b.address, a.address());
    assert_eq!(seen_by_b.locator, Some(locator.clone()));
    assert_eq!(seen_by_b.direction, Some(synapse::Direction::Outgoing));
    assert_eq!(seen_by_a.direction, Some(synapse::Direction::Incoming));

    assert_eq!(b.uri_to_direct_address(&locator), Some(a.address()));
    assert_eq!(
        a.handle_to_direct_address(seen_by_a.handle),
        Some(b.address())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_call_round_trips() {
    let (a, b, _) = connected_pair().await;
    a.expose(1, 1, |message: String| message);

    let promise = b.call(a.address(), 1, 1, ("hi",));
    assert_eq!(promise.settled().await, PromiseState::Success);
    assert_eq!(promise.decode::<String>().unwrap(), "hi");
    assert_eq!(b.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_flow_both_ways() {
    let (a, b, _) = connected_pair().await;
    a.expose(7, 3, |x: u32, y: u32| x + y);
    b.expose(7, 3, |x: u32, y: u32| x * y);

    let sum = b.call(a.address(), 7, 3, (4u32, 5u32));
    let product = a.call(b.address(), 7, 3, (4u32, 5u32));
    assert_eq!(sum.settled().await, PromiseState::Success);
    assert_eq!(product.settled().await, PromiseState::Success);
    assert_eq!(sum.decode::<u32>().unwrap(), 9);
    assert_eq!(product.decode::<u32>().unwrap(), 20);

    let missing = b.call(a.address(), 7, 99, ());
    assert_eq!(missing.settled().await, PromiseState::Failed);
    assert_eq!(
        missing.error(),
        Some(CallError::NotFound {
            protocol: 7,
            function: 99
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_concurrent_calls_all_resolve() {
    let (a, b, _) = connected_pair().await;
    a.expose(2, 1, |n: u64| n * 2);

    let promises: Vec<_> = (0..100u64).map(|n| b.call(a.address(), 2, 1, (n,))).collect();
    let states = join_all(promises.iter().map(|p| p.settled())).await;
    assert!(states.iter().all(|state| *state == PromiseState::Success));
    for (n, promise) in promises.iter().enumerate() {
        assert_eq!(promise.decode::<u64>().unwrap(), n as u64 * 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_failures_reach_the_caller() {
    let (a, b, _) = connected_pair().await;
    a.expose(3, 1, |divisor: u32| -> Result<u32, String> {
        if divisor == 0 {
            Err("division by zero".into())
        } else {
            Ok(100 / divisor)
        }
    });

    let failed = b.call(a.address(), 3, 1, (0u32,));
    failed.set_name("divide");
    assert_eq!(failed.settled().await, PromiseState::Failed);
    let error = failed.wait_checked(Duration::ZERO).unwrap_err();
    assert_eq!(
        error.reason,
        Some(CallError::TargetFailed("division by zero".into()))
    );
    assert_eq!(error.name.as_deref(), Some("divide"));

    let malformed = b.call(a.address(), 3, 1, ("not a number",));
    assert_eq!(malformed.settled().await, PromiseState::Failed);
    assert!(matches!(malformed.error(), Some(CallError::Malformed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_peer_is_redialled_after_a_drop() {
    let (a, b, locator) = connected_pair().await;
    let old = b.registry().lookup_by_locator(&locator).unwrap();
    let old_handle = old.handle();
    old.close();

    eventually("a fresh connection to replace the dropped one", || {
        b.direct_peers()
            .iter()
            .any(|peer| peer.address == a.address() && peer.handle != old_handle)
    })
    .await;

    a.expose(1, 1, |message: String| message);
    let promise = b.call(a.address(), 1, 1, ("again",));
    assert_eq!(promise.settled().await, PromiseState::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unroutable_calls_fail_without_waiting_for_the_deadline() {
    init_tracing();
    let node = Node::new(config());
    node.start(&[], []).await.unwrap();

    let started = Instant::now();
    let promise = node.call(Address::derive(b"nobody"), 1, 1, ());
    assert_eq!(promise.settled().await, PromiseState::Failed);
    assert!(matches!(promise.error(), Some(CallError::Unreachable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_to_self_are_served_locally() {
    init_tracing();
    let node = Node::new(config());
    node.start(&[], []).await.unwrap();
    node.expose(5, 5, || 42u8);

    let promise = node.call(node.address(), 5, 5, ());
    assert_eq!(promise.settled().await, PromiseState::Success);
    assert_eq!(promise.decode::<u8>().unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_node_rejects_calls() {
    init_tracing();
    let node = Node::new(config());
    let promise = node.call(Address::derive(b"anyone"), 1, 1, ());
    assert_eq!(promise.state(), PromiseState::Failed);
    assert_eq!(
        promise.error(),
        Some(CallError::Unreachable(RouteError::NotRunning.to_string()))
    );
    assert!(matches!(
        node.connect(Uri::tcp("127.0.0.1", 1)),
        Err(NodeError::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_fails_pending_calls() {
    let (a, b, _) = connected_pair().await;
    a.expose(9, 9, || std::thread::sleep(Duration::from_secs(2)));

    let promise = b.call(a.address(), 9, 9, ());
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.shutdown();

    assert_eq!(promise.state(), PromiseState::Failed);
    assert_eq!(promise.error(), Some(CallError::Shutdown));
    assert!(!b.is_running());
    assert!(b.direct_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_disconnects_peers_and_allows_a_restart() {
    let (a, b, locator) = connected_pair().await;
    a.expose(9, 9, || std::thread::sleep(Duration::from_secs(2)));

    let promise = b.call(a.address(), 9, 9, ());
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.stop();

    assert_eq!(promise.state(), PromiseState::Failed);
    assert!(matches!(promise.error(), Some(CallError::Unreachable(_))));
    assert!(!b.is_running());
    assert!(b.direct_peers().is_empty());
    eventually("a to see b leave", || a.direct_peers().is_empty()).await;

    b.start(&[], [locator]).await.unwrap();
    eventually("the pair to reconnect", || {
        a.direct_peers().len() == 1 && b.direct_peers().len() == 1
    })
    .await;
    a.expose(1, 1, |message: String| message);
    let promise = b.call(a.address(), 1, 1, ("back",));
    assert_eq!(promise.settled().await, PromiseState::Success);
    assert_eq!(promise.decode::<String>().unwrap(), "back");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replies_from_a_third_node_are_ignored() {
    init_tracing();
    let a = Node::new(config());
    a.start(&[0], []).await.unwrap();
    let b = Node::new(config());
    b.start(&[0], [Uri::tcp("127.0.0.1", a.listening_ports()[0])])
        .await
        .unwrap();
    let b_locator = Uri::tcp("127.0.0.1", b.listening_ports()[0]);
    let c = Node::new(config());
    c.start(&[], [b_locator.clone()]).await.unwrap();
    eventually("b to see both a and c", || b.direct_peers().len() == 2).await;
    eventually("c to see b", || c.direct_peers().len() == 1).await;

    a.expose(4, 4, || {
        std::thread::sleep(Duration::from_millis(300));
        7u32
    });
    let promise = b.call(a.address(), 4, 4, ());

    let forged = RpcMessage::Reply {
        id: promise.id(),
        result: Ok(to_bytes(&999u32).unwrap()),
    };
    let packet = Packet {
        flags: PacketFlags::new(false, false, false),
        ttl: DEFAULT_TTL,
        service: SERVICE_RPC,
        channel: CHANNEL_RPC_REPLY,
        counter: 0,
        sender: c.address(),
        target: b.address(),
        payload: forged.encode().unwrap(),
    };
    c.registry()
        .lookup_by_locator(&b_locator)
        .unwrap()
        .send(packet.encode())
        .unwrap();

    assert_eq!(promise.settled().await, PromiseState::Success);
    assert_eq!(promise.decode::<u32>().unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn application_packets_reach_subscribers() {
    let (a, b, _) = connected_pair().await;
    let mut inbox = a.subscribe(42, 7);

    b.send(a.address(), 42, 7, b"hello".to_vec()).await.unwrap();
    let packet = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.sender, b.address());
    assert_eq!(packet.payload, b"hello".to_vec());

    assert_eq!(
        b.send(Address::derive(b"nobody"), 42, 7, Vec::new()).await,
        Err(RouteError::NoRoute(Address::derive(b"nobody")))
    );
    assert_eq!(
        b.send(a.address(), SERVICE_RPC, 1, Vec::new()).await,
        Err(RouteError::ReservedService(SERVICE_RPC))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcasts_reach_every_peer_once() {
    init_tracing();
    let hub = Node::new(config());
    hub.start(&[0], []).await.unwrap();
    let locator = Uri::tcp("127.0.0.1", hub.listening_ports()[0]);

    let left = Node::new(config());
    let right = Node::new(config());
    left.start(&[], [locator.clone()]).await.unwrap();
    right.start(&[], [locator]).await.unwrap();
    eventually("hub to see both spokes", || hub.direct_peers().len() == 2).await;
    eventually("spokes to see the hub", || {
        left.direct_peers().len() == 1 && right.direct_peers().len() == 1
    })
    .await;

    let mut hub_inbox = hub.subscribe(50, 1);
    let mut right_inbox = right.subscribe(50, 1);
    left.broadcast(50, 1, b"news".to_vec()).unwrap();

    for inbox in [&mut hub_inbox, &mut right_inbox] {
        let packet = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.payload, b"news".to_vec());
        assert_eq!(packet.sender, left.address());
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(hub_inbox.try_recv().is_err());
    assert!(right_inbox.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blacklisted_peers_are_cut_off() {
    let (a, b, _) = connected_pair().await;
    a.blacklist(b.address()).unwrap();

    eventually("a to drop b", || a.direct_peers().is_empty()).await;
    let promise = a.call(b.address(), 1, 1, ());
    assert_eq!(promise.settled().await, PromiseState::Failed);
    assert!(matches!(promise.error(), Some(CallError::Unreachable(_))));

    a.whitelist(b.address()).unwrap();
    eventually("b to reconnect once whitelisted", || {
        a.direct_peers().iter().any(|peer| peer.address == b.address())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_reports_bind_failures_and_double_starts() {
    init_tracing();
    let first = Node::new(config());
    first.start(&[0], []).await.unwrap();
    let taken = first.listening_ports()[0];

    assert!(matches!(
        first.start(&[0], []).await,
        Err(NodeError::AlreadyRunning)
    ));

    let second = Node::new(config());
    match second.start(&[taken], []).await {
        Err(NodeError::Bind { port, .. }) => assert_eq!(port, taken),
        other => panic!("expected a bind error, got {:?}", other),
    }
    assert!(!second.is_running());
}
