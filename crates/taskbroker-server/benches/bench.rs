use bytes::Bytes;
use core::{hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::time::Instant;
use taskbroker_core::{
    ClientId, TaskRegistry, TaskType, WorkerId,
    client::ServiceClient,
    endpoint::Endpoint,
    envelope::{Envelope, Payload},
    transport::{DEFAULT_MAX_FRAME_BYTES, InprocHub},
    worker::{HandlerError, ServiceWorker, WorkerConfig},
};
use taskbroker_server::{
    broker::{Broker, Outbound, tracker::ReplyOrder},
    server::{config::ServerConfig, service::BrokerService, telemetry::LogFormat},
};
use tokio::{runtime::Builder, sync::mpsc};

#[derive(Clone, Copy, Debug)]
struct BrokerBenchParams {
    batch_size: usize,
    workers: usize,
}

/// One request through the broker's handlers without any sockets: accept,
/// dispatch every unit, ack every unit in reverse, emit the reply.
fn broker_hot_path(c: &mut Criterion) {
    let batch_cases = [1, 16, 256];
    let worker_cases = [1, 8];

    let mut cases = Vec::new();
    for &batch_size in &batch_cases {
        for &workers in &worker_cases {
            cases.push(BrokerBenchParams {
                batch_size,
                workers,
            });
        }
    }

    for params in &cases {
        let mut group = c.benchmark_group("broker/request");
        group.throughput(Throughput::Elements(params.batch_size as u64));

        for order in [ReplyOrder::AckArrival, ReplyOrder::Fragment] {
            group.bench_function(
                format!(
                    "units/{}/workers/{}/order/{order:?}",
                    params.batch_size, params.workers
                ),
                |b| {
                    let (reply_tx, mut replies) = mpsc::unbounded_channel();
                    let (dispatch_tx, mut dispatch) = mpsc::unbounded_channel();
                    let mut broker = Broker::new(
                        TaskRegistry::from_iter(["T"]),
                        order,
                        reply_tx,
                        dispatch_tx,
                    );
                    for i in 0..params.workers {
                        broker
                            .on_registration(Envelope::ready("T", &format!("w{i}")).to_bytes())
                            .unwrap();
                    }
                    let items: Vec<_> = (0..params.batch_size)
                        .map(|i| Bytes::from(i.to_string()))
                        .collect();
                    let request = Envelope::data("T", Payload::batch(items)).to_bytes();

                    b.iter(|| {
                        broker
                            .on_client_request(ClientId(1), request.clone())
                            .unwrap();

                        let mut acks = Vec::with_capacity(params.batch_size);
                        while let Ok(Outbound { frame, .. }) = dispatch.try_recv() {
                            let mut unit = Envelope::from_bytes(frame).unwrap();
                            let routing = unit.require_routing().unwrap();
                            let payload = unit.take_single().unwrap();
                            acks.push(Envelope::ack("T", routing, payload).to_bytes());
                        }
                        for ack in acks.into_iter().rev() {
                            broker.on_ack(ack).unwrap();
                        }
                        black_box(replies.try_recv().unwrap());
                    });
                },
            );
        }

        group.finish();
    }
}

fn echo(_: &TaskType, payload: Bytes) -> Result<Bytes, HandlerError> {
    Ok(payload)
}

/// Full request/reply latency over in-process transports with real worker
/// and client runtimes.
fn inproc_round_trip(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let hub = InprocHub::default();
    let endpoint = |channel: &str| -> Endpoint {
        format!("inproc://bench-{channel}").parse().unwrap()
    };
    let config = ServerConfig {
        frontend_endpoint: endpoint("frontend"),
        backend_endpoint: endpoint("backend"),
        registration_endpoint: endpoint("registration"),
        ack_endpoint: endpoint("ack"),
        task_types: TaskRegistry::from_iter(["echo"]),
        channel_capacity: 1024,
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        reply_order: ReplyOrder::AckArrival,
        shutdown_timeout: Duration::from_secs(1),
        log_format: LogFormat::Compact,
    };
    let task = config.task_types.get("echo").unwrap();

    let service = rt.block_on(BrokerService::start(&config, &hub)).unwrap();
    for i in 0..4 {
        let worker_config = WorkerConfig::new(
            WorkerId::new(format!("bench-w{i}")),
            task.clone(),
            config.backend_endpoint.clone(),
            config.registration_endpoint.clone(),
            config.ack_endpoint.clone(),
        )
        .with_slots(4);
        let worker = ServiceWorker::new(worker_config, echo, hub.clone()).unwrap();
        rt.spawn(worker.run());
    }

    let mut group = c.benchmark_group("inproc/request_batch");
    for batch_size in [1u64, 64, 1024] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_function(format!("units/{batch_size}"), |b| {
            b.to_async(&rt).iter_custom(|iters| {
                let hub = hub.clone();
                let frontend = config.frontend_endpoint.clone();
                let task = task.clone();
                async move {
                    let mut client = ServiceClient::connect(&frontend, &hub, task)
                        .await
                        .expect("Failed to connect to broker");
                    let batch: Vec<_> = (0..batch_size)
                        .map(|i| Bytes::from(i.to_le_bytes().to_vec()))
                        .collect();

                    let start = Instant::now();
                    for _ in 0..iters {
                        let reply = client.request_batch(batch.clone()).await.unwrap();
                        black_box(reply);
                    }
                    start.elapsed()
                }
            });
        });
    }
    group.finish();

    if rt.block_on(service.shutdown()).is_err() {
        eprintln!("failed to shut down broker");
    }
}

criterion_group!(broker_benches, broker_hot_path, inproc_round_trip);
criterion_main!(broker_benches);
