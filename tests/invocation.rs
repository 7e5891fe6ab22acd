//! End-to-end invocation scenarios through `ServiceProxy`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use serde_json::{json, Value};

use surge::{
    AddressModel, BreakerState, ClientConfig, CommandStore, HealthCheckService, HealthConfig, HealthEvent,
    HealthProbe, HealthState, InvokeHandler, InvokeServer, RemoteInvokeMessage, RemoteInvokeResult, SelectorMode,
    ServiceCommand, ServiceDescriptor, ServiceProxy, ServiceRoute,
    StaticRouteProvider, StrategyKind, SurgeError, TcpTransport, Transport, TransportCodec,
};

/// In-memory transport that answers with the request parameters, after an
/// optional delay. Ports listed in `down` fail with a transport error.
struct LocalTransport {
    codec: Arc<TransportCodec>,
    delay: Duration,
    down: DashSet<u16>,
    calls: AtomicUsize,
}

impl LocalTransport {
    fn new(codec: Arc<TransportCodec>) -> Self {
        Self {
            codec,
            delay: Duration::ZERO,
            down: DashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, address: &AddressModel, frame: Bytes, _timeout: Duration) -> surge::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.contains(&address.port) {
            return Err(SurgeError::Communication(format!("connection refused: {}", address)));
        }
        let (message, request) = self.codec.decode_request(&frame)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut reply = request.parameters.clone();
        reply.insert("port".into(), json!(address.port));
        self.codec
            .encode_response(&message, &RemoteInvokeResult::success(json!(reply)))
    }
}

fn passive_health() -> HealthConfig {
    HealthConfig {
        check_interval: 0,
        ..Default::default()
    }
}

fn echo_route(ports: &[u16]) -> Arc<StaticRouteProvider> {
    let addresses = ports.iter().map(|p| AddressModel::new("10.0.0.1", *p)).collect();
    Arc::new(StaticRouteProvider::with_routes(vec![ServiceRoute::new(
        ServiceDescriptor::new("Echo"),
        addresses,
    )]))
}

fn params(v: Value) -> HashMap<String, Value> {
    serde_json::from_value(v).unwrap()
}

fn reply_port(value: &Value) -> u64 {
    value["port"].as_u64().unwrap()
}

#[tokio::test]
async fn test_unhealthy_address_is_skipped_and_recovers() {
    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _address: &AddressModel) -> surge::Result<()> {
            Ok(())
        }
    }

    let codec = Arc::new(TransportCodec::default());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&codec)));
    transport.down.insert(9001);

    let mut random = ServiceCommand::new("Echo");
    random.shunt_strategy = SelectorMode::Random;
    let health = Arc::new(HealthCheckService::with_probe(passive_health(), Arc::new(AlwaysUp)));
    let mut events = health.subscribe();
    let proxy = ServiceProxy::builder(echo_route(&[9001, 9002]), Arc::clone(&transport) as Arc<dyn Transport>)
        .codec(codec)
        .health(Arc::clone(&health))
        .commands(Arc::new(CommandStore::with_commands(vec![random]).unwrap()))
        .build();
    let a = AddressModel::new("10.0.0.1", 9001);

    // Calls that land on A fail over to B; A goes down after three failures
    let mut attempts = 0;
    while proxy.health().state(&a) != Some(HealthState::Unhealthy) {
        attempts += 1;
        assert!(attempts <= 200, "A never became unhealthy");
        let value = proxy.invoke("Echo", params(json!({"n": attempts})), None).await.unwrap();
        assert_eq!(reply_port(&value), 9002);
    }

    let before = transport.calls.load(Ordering::SeqCst);
    for i in 0..50 {
        let value = proxy.invoke("Echo", params(json!({"i": i})), None).await.unwrap();
        assert_eq!(reply_port(&value), 9002);
    }
    // One transport call per invoke: A is never tried
    assert_eq!(transport.calls.load(Ordering::SeqCst) - before, 50);

    transport.down.remove(&9001);
    assert!(health.check_now(&a).await);
    assert_eq!(health.state(&a), Some(HealthState::Healthy));

    let mut saw_recovery = false;
    while let Ok(event) = events.try_recv() {
        if event == (HealthEvent::Changed { address: a.clone(), state: HealthState::Healthy }) {
            saw_recovery = true;
        }
    }
    assert!(saw_recovery);

    let mut reached_a = false;
    for i in 0..200 {
        let value = proxy.invoke("Echo", params(json!({"after": i})), None).await.unwrap();
        if reply_port(&value) == 9001 {
            reached_a = true;
            break;
        }
    }
    assert!(reached_a, "recovered address was never selected");
}

#[tokio::test]
async fn test_slow_operation_times_out_once_per_call() {
    let codec = Arc::new(TransportCodec::default());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&codec)).with_delay(Duration::from_millis(200)));

    let mut slow = ServiceCommand::new("slow-op");
    slow.execution_timeout_in_milliseconds = 100;
    let commands = Arc::new(CommandStore::with_commands(vec![slow]).unwrap());

    let proxy = ServiceProxy::builder(echo_route(&[9001]), transport)
        .codec(codec)
        .health_config(passive_health())
        .commands(commands)
        .build();

    let err = proxy.invoke("Echo", params(json!({})), Some("slow-op")).await.unwrap_err();
    assert!(matches!(err, SurgeError::Timeout(100)), "{:?}", err);

    let breaker = proxy.breakers().get("Echo", "slow-op").unwrap();
    assert_eq!(breaker.window_counts().failures, 1);
    assert_eq!(breaker.in_flight(), 0);
}

#[tokio::test]
async fn test_bulkhead_rejects_excess_calls() {
    let codec = Arc::new(TransportCodec::default());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&codec)).with_delay(Duration::from_millis(100)));

    let mut guarded = ServiceCommand::new("Echo");
    guarded.max_concurrent_requests = 2;
    let proxy = Arc::new(
        ServiceProxy::builder(echo_route(&[9001]), transport)
            .codec(codec)
            .health_config(passive_health())
            .commands(Arc::new(CommandStore::with_commands(vec![guarded]).unwrap()))
            .build(),
    );

    let mut handles = Vec::new();
    for i in 0..3 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move { proxy.invoke("Echo", params(json!({"n": i})), None).await }));
    }

    let mut rejected = 0;
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(SurgeError::RequestRejected { limit, .. }) => {
                assert_eq!(limit, 2);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
    assert!(rejected >= 1);
    assert_eq!(succeeded + rejected, 3);
    assert_eq!(proxy.breakers().get("Echo", "Echo").unwrap().in_flight(), 0);
}

#[tokio::test]
async fn test_open_breaker_short_circuits_transport() {
    let codec = Arc::new(TransportCodec::default());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&codec)));
    transport.down.insert(9001);

    let mut policy = ServiceCommand::new("Echo");
    policy.breaker_request_volume_threshold = 2;
    policy.breaker_sleep_window_in_milliseconds = 60_000;
    let proxy = ServiceProxy::builder(echo_route(&[9001]), Arc::clone(&transport) as Arc<dyn Transport>)
        .codec(codec)
        .health_config(HealthConfig {
            failure_threshold: 100,
            ..passive_health()
        })
        .commands(Arc::new(CommandStore::with_commands(vec![policy]).unwrap()))
        .build();

    // The call and its single retry fill the volume threshold
    let err = proxy.invoke("Echo", params(json!({})), None).await.unwrap_err();
    assert!(matches!(err, SurgeError::Communication(_)));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.breakers().get("Echo", "Echo").unwrap().state(), BreakerState::Open);

    let before = transport.calls.load(Ordering::SeqCst);
    let err = proxy.invoke("Echo", params(json!({})), None).await.unwrap_err();
    assert!(matches!(err, SurgeError::CircuitOpen { .. }));
    assert_eq!(transport.calls.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_injection_fallback_on_open_circuit() {
    let codec = Arc::new(TransportCodec::default());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&codec)));

    let mut policy = ServiceCommand::new("Echo");
    policy.strategy = StrategyKind::Injection;
    policy.injection = Some("cached-echo".into());
    policy.breaker_force_open = true;

    let proxy = ServiceProxy::builder(echo_route(&[9001]), transport)
        .codec(codec)
        .health_config(passive_health())
        .commands(Arc::new(CommandStore::with_commands(vec![policy]).unwrap()))
        .build();
    proxy
        .fallbacks()
        .register_fn("cached-echo", |req: &RemoteInvokeMessage, _err: &SurgeError| {
            Ok(json!({"fallback": req.service_id}))
        });

    let value = proxy.invoke("Echo", params(json!({})), None).await.unwrap();
    assert_eq!(value, json!({"fallback": "Echo"}));
}

struct EchoHandler;

#[async_trait]
impl InvokeHandler for EchoHandler {
    async fn handle(&self, request: RemoteInvokeMessage) -> RemoteInvokeResult {
        match request.parameters.get("fail") {
            Some(Value::String(reason)) => RemoteInvokeResult::failure(500, reason.clone()),
            _ => RemoteInvokeResult::success(json!({
                "service": request.service_id,
                "params": request.parameters,
            })),
        }
    }
}

#[tokio::test]
async fn test_loopback_over_tcp() {
    let config = ClientConfig::from_toml_str(
        r#"
        [health]
        check_interval = 0

        [codec]
        content_type = "application/x-bincode"

        [[commands]]
        Key = "Echo"
        ExecutionTimeoutInMilliseconds = 2000
        "#,
    )
    .unwrap();

    let codec = Arc::new(config.codec());
    let server = InvokeServer::bind("127.0.0.1:0", Arc::clone(&codec), Arc::new(EchoHandler))
        .await
        .unwrap();
    let port = server.local_addr().port();

    let routes = Arc::new(StaticRouteProvider::new());
    routes.set_route(ServiceRoute::new(
        ServiceDescriptor::new("Echo"),
        vec![AddressModel::new("127.0.0.1", port)],
    ));
    let transport = Arc::new(TcpTransport::with_config(Arc::clone(&codec), config.transport.clone()));
    let proxy = ServiceProxy::builder(routes, transport)
        .config(&config)
        .unwrap()
        .build();

    let value = proxy.invoke("Echo", params(json!({"text": "hello"})), None).await.unwrap();
    assert_eq!(value, json!({"service": "Echo", "params": {"text": "hello"}}));

    let err = proxy.invoke("Echo", params(json!({"fail": "boom"})), None).await.unwrap_err();
    assert!(matches!(err, SurgeError::Remote { code: 500, ref message } if message == "boom"));

    // Remote errors do not count against address health
    let addr = AddressModel::new("127.0.0.1", port);
    assert!(proxy.health().is_healthy(&addr));
}
