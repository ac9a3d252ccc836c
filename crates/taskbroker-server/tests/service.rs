use bytes::Bytes;
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use taskbroker_core::{
    Error, TaskRegistry, TaskType, WorkerId,
    client::ServiceClient,
    endpoint::Endpoint,
    transport::{DEFAULT_MAX_FRAME_BYTES, InprocHub},
    worker::{HandlerError, ServiceWorker, WorkerConfig},
};
use taskbroker_server::{
    broker::tracker::ReplyOrder,
    server::{config::ServerConfig, service::BrokerService, telemetry::LogFormat},
};
use tokio::{task::JoinHandle, time::timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn upper(_: &TaskType, payload: Bytes) -> Result<Bytes, HandlerError> {
    if payload.as_ref() == b"boom" {
        return Err(HandlerError::new("refusing to shout boom"));
    }
    Ok(Bytes::from(payload.to_ascii_uppercase()))
}

struct Cluster {
    hub: InprocHub,
    config: ServerConfig,
    service: BrokerService,
}

impl Cluster {
    async fn start(name: &str, reply_order: ReplyOrder) -> Self {
        let endpoint = |channel: &str| -> Endpoint {
            format!("inproc://{name}-{channel}").parse().unwrap()
        };
        let config = ServerConfig {
            frontend_endpoint: endpoint("frontend"),
            backend_endpoint: endpoint("backend"),
            registration_endpoint: endpoint("registration"),
            ack_endpoint: endpoint("ack"),
            task_types: TaskRegistry::from_iter(["upper", "idle", "spare"]),
            channel_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reply_order,
            shutdown_timeout: Duration::from_secs(1),
            log_format: LogFormat::Compact,
        };
        let hub = InprocHub::default();
        let service = BrokerService::start(&config, &hub).await.unwrap();
        Self { hub, config, service }
    }

    fn task(&self, name: &str) -> TaskType {
        self.config.task_types.get(name).unwrap()
    }

    /// Starts a worker and returns its handle plus a count of units it served.
    fn spawn_worker(
        &self,
        identity: &str,
        task: &str,
        slots: usize,
    ) -> (JoinHandle<()>, Arc<AtomicUsize>) {
        let config = WorkerConfig::new(
            WorkerId::new(identity),
            self.task(task),
            self.config.backend_endpoint.clone(),
            self.config.registration_endpoint.clone(),
            self.config.ack_endpoint.clone(),
        )
        .with_slots(slots);
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);
        let handler = move |task: &TaskType, payload: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            upper(task, payload)
        };
        let worker = ServiceWorker::new(config, handler, self.hub.clone()).unwrap();
        (tokio::spawn(async move { worker.run().await.unwrap() }), served)
    }

    async fn client(&self, task: &str) -> ServiceClient {
        ServiceClient::connect(&self.config.frontend_endpoint, &self.hub, self.task(task))
            .await
            .unwrap()
    }
}

/// Sends requests until every worker in `served` has handled at least one,
/// which proves they are all registered.
async fn wait_for_pool(client: &mut ServiceClient, served: &[&Arc<AtomicUsize>]) {
    let all_served = || served.iter().all(|s| s.load(Ordering::SeqCst) > 0);
    timeout(TEST_TIMEOUT, async {
        while !all_served() {
            client.request(Bytes::from_static(b"ping")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn items(values: &[&'static str]) -> Vec<Bytes> {
    values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
}

#[tokio::test]
async fn scalar_request_round_trip() {
    let cluster = Cluster::start("scalar", ReplyOrder::AckArrival).await;
    let (worker, _) = cluster.spawn_worker("w1", "upper", 1);
    let mut client = cluster.client("upper").await;

    let reply = timeout(TEST_TIMEOUT, client.request(Bytes::from_static(b"hello")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"HELLO"));

    assert_eq!(cluster.service.shutdown().await.unwrap(), 1);
    timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn batch_is_spread_and_reassembled() {
    let cluster = Cluster::start("batch", ReplyOrder::Fragment).await;
    let (w1, served1) = cluster.spawn_worker("w1", "upper", 2);
    let (w2, served2) = cluster.spawn_worker("w2", "upper", 2);
    let mut client = cluster.client("upper").await;
    wait_for_pool(&mut client, &[&served1, &served2]).await;
    let before = served1.load(Ordering::SeqCst) + served2.load(Ordering::SeqCst);

    let batch = items(&["a", "b", "c", "d", "e"]);
    let reply = timeout(TEST_TIMEOUT, client.request_batch(batch))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, items(&["A", "B", "C", "D", "E"]));
    let after = served1.load(Ordering::SeqCst) + served2.load(Ordering::SeqCst);
    assert_eq!(after - before, 5);

    assert_eq!(cluster.service.shutdown().await.unwrap(), 2);
    for worker in [w1, w2] {
        timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn ack_arrival_reply_holds_every_response() {
    let cluster = Cluster::start("arrival", ReplyOrder::AckArrival).await;
    let (worker, _) = cluster.spawn_worker("w1", "upper", 4);
    let mut client = cluster.client("upper").await;

    let mut reply = timeout(TEST_TIMEOUT, client.request_batch(items(&["x", "y", "z"])))
        .await
        .unwrap()
        .unwrap();
    reply.sort();
    assert_eq!(reply, items(&["X", "Y", "Z"]));

    cluster.service.shutdown().await.unwrap();
    timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn request_waits_for_a_worker() {
    let cluster = Cluster::start("deferred", ReplyOrder::AckArrival).await;
    let mut client = cluster.client("upper").await;

    let pending = tokio::spawn(async move {
        let reply = client.request(Bytes::from_static(b"late")).await;
        (client, reply)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    let (worker, served) = cluster.spawn_worker("w1", "upper", 1);
    let (_client, reply) = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply.unwrap(), Bytes::from_static(b"LATE"));
    assert_eq!(served.load(Ordering::SeqCst), 1);

    cluster.service.shutdown().await.unwrap();
    timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_failure_fails_the_request() {
    let cluster = Cluster::start("failure", ReplyOrder::AckArrival).await;
    let (worker, _) = cluster.spawn_worker("w1", "upper", 1);
    let mut client = cluster.client("upper").await;

    let result = timeout(TEST_TIMEOUT, client.request_batch(items(&["ok", "boom"])))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::RequestFailed { .. })));

    // The connection stays usable after a failed request.
    let reply = timeout(TEST_TIMEOUT, client.request(Bytes::from_static(b"fine")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"FINE"));

    cluster.service.shutdown().await.unwrap();
    timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn clients_do_not_see_each_others_replies() {
    let cluster = Cluster::start("isolation", ReplyOrder::Fragment).await;
    let (worker, _) = cluster.spawn_worker("w1", "upper", 4);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mut client = cluster.client("upper").await;
        tasks.push(tokio::spawn(async move {
            let batch = vec![Bytes::from(format!("c{i}-a")), Bytes::from(format!("c{i}-b"))];
            let reply = client.request_batch(batch).await.unwrap();
            assert_eq!(reply, [
                Bytes::from(format!("C{i}-A")),
                Bytes::from(format!("C{i}-B")),
            ]);
        }));
    }
    for task in tasks {
        timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }

    cluster.service.shutdown().await.unwrap();
    timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_ends_each_worker_once() {
    let cluster = Cluster::start("shutdown", ReplyOrder::AckArrival).await;
    let mut workers = Vec::new();
    for (identity, task) in [("w1", "upper"), ("w2", "upper"), ("w3", "idle"), ("w4", "spare")] {
        let (worker, served) = cluster.spawn_worker(identity, task, 1);
        workers.push((worker, served, task));
    }

    for task in ["upper", "idle", "spare"] {
        let mut client = cluster.client(task).await;
        let pool: Vec<_> = workers
            .iter()
            .filter(|(_, _, t)| *t == task)
            .map(|(_, served, _)| served)
            .collect();
        wait_for_pool(&mut client, &pool).await;
    }

    assert_eq!(cluster.service.shutdown().await.unwrap(), 4);
    for (worker, _, _) in workers {
        timeout(TEST_TIMEOUT, worker).await.unwrap().unwrap();
    }
}
