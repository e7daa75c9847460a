//! End-to-end scenarios exercising a full `Instance` over
//! `LoopbackTransport` — the request lifecycle, provider muxing, bulk
//! transfer, timeout/cancellation, a registry race, and progress ULT
//! migration. Each test uses uniquely-named loopback nodes since the
//! loopback directory is a single process-wide namespace shared by the
//! whole test binary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use margo::bulk::chunked_transfer;
use margo::{ErrorKind, HandlerContext, Instance, MargoError, RpcHandler, NO_PROVIDER};
use margo_config::{AccessConfig, MargoConfig, PoolConfig, PoolKindConfig, PoolRef, SchedulerConfig, XstreamConfig};
use margo_transport::loopback::LoopbackTransport;
use margo_transport::{BulkKind, BulkOp, BulkSegment};

/// A config with one extra `handlers` pool/xstream alongside
/// `__primary__`, so a handler that blocks its thread doesn't also
/// stall the progress loop sharing that thread.
fn config_with_handler_pool() -> MargoConfig {
    let mut config = MargoConfig::default();
    config.argobots.pools.push(PoolConfig {
        name: Some("handlers".to_string()),
        kind: PoolKindConfig::BlockingFifo,
        access: AccessConfig::Mpmc,
    });
    config.argobots.xstreams.push(XstreamConfig {
        name: Some("__primary__".to_string()),
        cpubind: None,
        affinity: Vec::new(),
        scheduler: SchedulerConfig {
            kind: Default::default(),
            pools: vec![PoolRef::Name("__primary__".to_string())],
        },
    });
    config.argobots.xstreams.push(XstreamConfig {
        name: Some("xs-handlers".to_string()),
        cpubind: None,
        affinity: Vec::new(),
        scheduler: SchedulerConfig {
            kind: Default::default(),
            pools: vec![PoolRef::Name("handlers".to_string())],
        },
    });
    config.rpc_pool = "handlers".to_string();
    config
}

/// A config with two non-primary pools, each backed by its own
/// execution stream, so the progress ULT can migrate between them and
/// the donor's execution stream can then be retired.
fn config_with_two_pools() -> MargoConfig {
    let mut config = MargoConfig::default();
    for name in ["pool-a", "pool-b"] {
        config.argobots.pools.push(PoolConfig {
            name: Some(name.to_string()),
            kind: PoolKindConfig::BlockingFifo,
            access: AccessConfig::Mpmc,
        });
    }
    for (xs_name, pool_name) in [("xs-a", "pool-a"), ("xs-b", "pool-b")] {
        config.argobots.xstreams.push(XstreamConfig {
            name: Some(xs_name.to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name(pool_name.to_string())],
            },
        });
    }
    config.progress_pool = "pool-a".to_string();
    config
}

struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn handle(&self, ctx: HandlerContext) {
        let message: String = serde_json::from_slice(&ctx.payload).unwrap();
        let _ = ctx.instance.respond(ctx.handle, &message).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip_leaves_no_handle_in_use_at_quiescence() {
    let config = MargoConfig::default();

    let server_transport = LoopbackTransport::new("echo-scenario-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();
    server.register("echo", EchoHandler).unwrap();

    let client_transport = LoopbackTransport::new("echo-scenario-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    let response: String = client
        .forward(
            "echo-scenario-server",
            "echo",
            NO_PROVIDER,
            &"hello".to_string(),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(response, "hello");

    let diag = client.diagnostics_snapshot();
    assert_eq!(diag.handle_cache_in_use, 0);
    assert_eq!(diag.handle_cache_hits + diag.handle_cache_misses, 1);

    client.finalize_and_wait();
    server.finalize_and_wait();
}

struct Noop;

#[async_trait]
impl RpcHandler for Noop {
    async fn handle(&self, ctx: HandlerContext) {
        let _ = ctx.instance.respond(ctx.handle, &()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_to_unregistered_provider_returns_no_match() {
    let config = MargoConfig::default();

    let server_transport = LoopbackTransport::new("nomatch-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();
    server.provider_register("svc", 1, Noop).unwrap();

    let client_transport = LoopbackTransport::new("nomatch-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    let result: Result<(), MargoError> = client.forward("nomatch-server", "svc", 2, &(), Some(Duration::from_secs(5))).await;

    match result {
        Err(MargoError::NoMatch { name, provider }) => {
            assert_eq!(name, "svc");
            assert_eq!(provider, 2);
        }
        other => panic!("expected no-match, got {other:?}"),
    }

    client.finalize_and_wait();
    server.finalize_and_wait();
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_to_a_totally_unknown_name_returns_no_entry() {
    let config = MargoConfig::default();
    let server_transport = LoopbackTransport::new("noentry-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();

    let client_transport = LoopbackTransport::new("noentry-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    let result: Result<(), MargoError> = client.forward("noentry-server", "never_registered", NO_PROVIDER, &(), Some(Duration::from_secs(5))).await;
    match result {
        Err(e) if e.kind() == ErrorKind::NoEntry => {}
        other => panic!("expected no-entry, got {other:?}"),
    }

    client.finalize_and_wait();
    server.finalize_and_wait();
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_bulk_transfer_pulls_one_mebibyte_in_sixteen_chunks() {
    const SIZE: usize = 1024 * 1024;
    const CHUNK: usize = 64 * 1024;

    let origin_transport = LoopbackTransport::new("bulk-origin");
    let origin = Instance::init(&MargoConfig::default(), origin_transport, None, false).unwrap();
    let local_transport = LoopbackTransport::new("bulk-local");
    let local_instance = Instance::init(&MargoConfig::default(), local_transport, None, false).unwrap();

    let source: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let origin_handle = origin.bulk_create(vec![BulkSegment::new(source.clone())], BulkKind::Read).unwrap();

    let dest_segment = BulkSegment::new(vec![0u8; SIZE]);
    let dest_data = dest_segment.data.clone();
    let local_handle = local_instance.bulk_create(vec![dest_segment], BulkKind::Write).unwrap();

    let origin_addr = local_instance.lookup("bulk-origin").unwrap();

    chunked_transfer(
        &local_instance,
        BulkOp::Pull,
        origin_addr,
        origin_handle.clone(),
        0,
        local_handle.clone(),
        0,
        SIZE,
        CHUNK,
        Some(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(*dest_data.lock(), source);

    origin.bulk_free(origin_handle);
    local_instance.bulk_free(local_handle);
    origin.finalize_and_wait();
    local_instance.finalize_and_wait();
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_bulk_transfer_surfaces_an_out_of_bounds_chunk_error() {
    const SIZE: usize = 128 * 1024;
    const CHUNK: usize = 32 * 1024;

    let origin_transport = LoopbackTransport::new("bulk-oob-origin");
    let origin = Instance::init(&MargoConfig::default(), origin_transport, None, false).unwrap();
    let local_transport = LoopbackTransport::new("bulk-oob-local");
    let local_instance = Instance::init(&MargoConfig::default(), local_transport, None, false).unwrap();

    let origin_handle = origin.bulk_create(vec![BulkSegment::new(vec![7u8; SIZE])], BulkKind::Read).unwrap();
    // Undersized destination: chunks past the first run out of room.
    let local_handle = local_instance.bulk_create(vec![BulkSegment::new(vec![0u8; CHUNK])], BulkKind::Write).unwrap();
    let origin_addr = local_instance.lookup("bulk-oob-origin").unwrap();

    let result = chunked_transfer(
        &local_instance,
        BulkOp::Pull,
        origin_addr,
        origin_handle.clone(),
        0,
        local_handle.clone(),
        0,
        SIZE,
        CHUNK,
        Some(Duration::from_secs(5)),
    )
    .await;

    assert!(result.is_err(), "an out-of-bounds chunk must surface, not be dropped silently");

    origin.bulk_free(origin_handle);
    local_instance.bulk_free(local_handle);
    origin.finalize_and_wait();
    local_instance.finalize_and_wait();
}

struct SlowHandler;

#[async_trait]
impl RpcHandler for SlowHandler {
    async fn handle(&self, ctx: HandlerContext) {
        std::thread::sleep(Duration::from_millis(1200));
        let _ = ctx.instance.respond(ctx.handle, &"done".to_string()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_times_out_while_the_handler_keeps_running() {
    let config = config_with_handler_pool();

    let server_transport = LoopbackTransport::new("timeout-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();
    server.register("slow_echo", SlowHandler).unwrap();

    let client_transport = LoopbackTransport::new("timeout-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    let result: Result<String, MargoError> = client
        .forward("timeout-server", "slow_echo", NO_PROVIDER, &"ping".to_string(), Some(Duration::from_millis(150)))
        .await;
    assert!(matches!(result, Err(MargoError::Timeout)));

    // The handler is still running server-side; give it time to finish,
    // then confirm both instances still finalize cleanly afterward.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    client.finalize_and_wait();
    server.finalize_and_wait();
}

struct RacyHandler {
    count: Arc<AtomicUsize>,
    dereg_at: usize,
}

#[async_trait]
impl RpcHandler for RacyHandler {
    async fn handle(&self, ctx: HandlerContext) {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.dereg_at {
            let _ = ctx.instance.deregister(ctx.rpc_id);
        }
        let _ = ctx.instance.respond(ctx.handle, &n).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_forwards_survive_a_deregister_mid_flight() {
    const N: usize = 64;

    let config = MargoConfig::default();
    let server_transport = LoopbackTransport::new("racer-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();
    server
        .register(
            "racer",
            RacyHandler {
                count: Arc::new(AtomicUsize::new(0)),
                dereg_at: N / 2,
            },
        )
        .unwrap();

    let client_transport = LoopbackTransport::new("racer-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    let mut tasks = Vec::with_capacity(N);
    for _ in 0..N {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .forward::<(), usize>("racer-server", "racer", NO_PROVIDER, &(), Some(Duration::from_secs(5)))
                .await
        }));
    }

    let mut successes = 0usize;
    let mut failures = 0usize;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(MargoError::NoMatch { .. }) => failures += 1,
            Err(other) => panic!("unexpected failure mode: {other:?}"),
        }
    }

    assert!(successes >= 1, "some requests dispatched before deregister must still succeed");
    assert!(failures >= 1, "some requests dispatched after deregister must see no-match");
    assert_eq!(successes + failures, N);

    // No handle ever gets stuck in the client's cache, win or lose.
    assert_eq!(client.diagnostics_snapshot().handle_cache_in_use, 0);

    client.finalize_and_wait();
    server.finalize_and_wait();
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_ult_migrates_and_frees_its_old_pool() {
    let config = config_with_two_pools();
    let transport = LoopbackTransport::new("migrate-node");
    let instance = Instance::init(&config, transport, None, false).unwrap();
    instance.register("ping", Noop).unwrap();

    instance
        .forward::<(), ()>("migrate-node", "ping", NO_PROVIDER, &(), Some(Duration::from_secs(2)))
        .await
        .unwrap();

    instance.migrate_progress("pool-b").unwrap();
    // Let the progress ULT notice the request at the top of its next
    // iteration and re-spawn itself onto pool-b.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // pool-a's execution stream carried nothing but the progress ULT;
    // once it's moved off, the stream can be retired.
    instance.substrate().remove_xstream("xs-a").unwrap();

    instance
        .forward::<(), ()>("migrate-node", "ping", NO_PROVIDER, &(), Some(Duration::from_secs(2)))
        .await
        .unwrap();

    instance.finalize_and_wait();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_any_returns_whichever_forward_completes_first() {
    let config = MargoConfig::default();
    let server_transport = LoopbackTransport::new("waitany-server");
    let server = Instance::init(&config, server_transport, None, false).unwrap();
    server.register("echo", EchoHandler).unwrap();

    let client_transport = LoopbackTransport::new("waitany-client");
    let client = Instance::init(&config, client_transport, None, false).unwrap();

    type PendingEcho = Pin<Box<dyn Future<Output = Result<String, MargoError>> + Send>>;
    let first: PendingEcho = Box::pin(client.forward(
        "waitany-server",
        "echo",
        NO_PROVIDER,
        &"first".to_string(),
        Some(Duration::from_secs(5)),
    ));
    let second: PendingEcho = Box::pin(client.forward(
        "waitany-server",
        "echo",
        NO_PROVIDER,
        &"second".to_string(),
        Some(Duration::from_secs(5)),
    ));

    let (index, result) = margo::wait_any(vec![first, second]).await;
    let message = result.unwrap();
    assert!(index == 0 || index == 1);
    assert!(message == "first" || message == "second");

    client.finalize_and_wait();
    server.finalize_and_wait();
}
