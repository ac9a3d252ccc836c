//! The broker reactor.
//!
//! A [`Broker`] owns all routing state: the [`WorkerRegistry`], the
//! [`RequestTracker`] and the [`Dispatcher`]. It is driven by a single task
//! ([`Broker::run`]) that multiplexes three inbound channels fed by the
//! transport routers:
//!
//! - **registration**: `Ready` envelopes that add a worker to a pool,
//! - **ack**: `Ack`/`Failure` envelopes completing one work unit,
//! - **frontend**: `Data` envelopes carrying client requests.
//!
//! Every handler runs to completion without awaiting. Outbound frames go to
//! unbounded channels drained by the routers, so a slow peer never stalls the
//! reactor.
//!
//! ## Structure
//!
//! - [`registry`] - Worker pools and round-robin selection.
//! - [`tracker`] - Correlation ids and response accumulation.
//! - [`dispatch`] - Pending units and their assignment to workers.

pub mod dispatch;
pub mod registry;
pub mod tracker;

use crate::server::telemetry::{
    decrement_requests_inflight, decrement_units_pending, increment_acks,
    increment_protocol_errors, increment_replies, increment_requests,
    increment_requests_inflight, increment_units_dispatched, increment_units_pending,
    increment_workers_registered, record_request_duration, record_units_per_request,
};
use bytes::Bytes;
use dispatch::Dispatcher;
use registry::WorkerRegistry;
use taskbroker_core::{
    ClientId, CorrelationId, Error, Result, TaskRegistry, WorkerId,
    envelope::{Envelope, MessageKind, Payload},
};
use tokio::sync::mpsc::{Receiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracker::{ReplyOrder, RequestTracker};

/// A frame received from a frontend connection.
#[derive(Debug)]
pub struct Inbound {
    pub from: ClientId,
    pub frame: Bytes,
}

/// A frame addressed to one peer.
#[derive(Debug)]
pub struct Outbound<K> {
    pub to: K,
    pub frame: Bytes,
}

/// The inbound side of the broker, one bounded channel per socket.
pub struct BrokerInbound {
    pub frontend: Receiver<Inbound>,
    pub registration: Receiver<Bytes>,
    pub acks: Receiver<Bytes>,
}

pub struct Broker {
    tasks: TaskRegistry,
    workers: WorkerRegistry,
    tracker: RequestTracker,
    dispatcher: Dispatcher,
    replies: UnboundedSender<Outbound<ClientId>>,
    dispatch: UnboundedSender<Outbound<WorkerId>>,
}

impl Broker {
    pub fn new(
        tasks: TaskRegistry,
        reply_order: ReplyOrder,
        replies: UnboundedSender<Outbound<ClientId>>,
        dispatch: UnboundedSender<Outbound<WorkerId>>,
    ) -> Self {
        Self {
            tasks,
            workers: WorkerRegistry::new(),
            tracker: RequestTracker::new(reply_order),
            dispatcher: Dispatcher::new(),
            replies,
            dispatch,
        }
    }

    /// Number of requests that have not been replied to.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Number of units waiting for a worker.
    pub fn pending_units(&self) -> usize {
        self.dispatcher.pending_units()
    }

    pub const fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Handles a worker registration and dispatches any units it unblocks.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame is not a `Ready` envelope for a
    /// known task type with a non-empty identity.
    pub fn on_registration(&mut self, frame: Bytes) -> Result<()> {
        let msg = Envelope::from_bytes(frame)?;
        msg.expect_kind(&[MessageKind::Ready])?;
        let task_type = self.tasks.get(&msg.task_type)?;
        if msg.identity.is_empty() {
            return Err(Error::MissingField {
                kind: MessageKind::Ready,
                field: "identity",
            });
        }
        let worker = WorkerId::new(&msg.identity);

        #[cfg(feature = "tracing")]
        tracing::info!("Worker {worker} registered for task type {task_type}");

        self.workers.register(task_type, worker);
        increment_workers_registered();
        self.dispatch_ready()
    }

    /// Folds a worker ack into its request. A completed request is replied
    /// to; otherwise pending units are dispatched.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed, unknown or duplicate acks.
    pub fn on_ack(&mut self, frame: Bytes) -> Result<()> {
        let mut msg = Envelope::from_bytes(frame)?;
        let kind = msg.expect_kind(&[MessageKind::Ack, MessageKind::Failure])?;
        let routing = msg.require_routing()?;
        let response = match kind {
            MessageKind::Failure => match msg.payload.take() {
                Some(Payload::Single(reason)) => reason,
                _ => Bytes::new(),
            },
            _ => msg.take_single()?,
        };

        let complete = self.tracker.record_ack(
            routing.correlation_id,
            routing.fragment,
            response,
            kind == MessageKind::Failure,
        )?;
        increment_acks();

        if complete {
            self.finish(routing.correlation_id)
        } else {
            self.dispatch_ready()
        }
    }

    /// Accepts a client request, splits it into units and dispatches them.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame is not a `Data` envelope with a
    /// payload for a known task type. The caller is expected to
    /// [`reject`](Self::reject) the request.
    pub fn on_client_request(&mut self, client: ClientId, frame: Bytes) -> Result<()> {
        let mut msg = Envelope::from_bytes(frame)?;
        msg.expect_kind(&[MessageKind::Data])?;
        let task_type = self.tasks.get(&msg.task_type)?;
        let (fragments, batch) = msg.take_payload()?.into_fragments();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Request from {client} for task type {task_type} with {} fragment(s)",
            fragments.len()
        );

        increment_requests();
        #[allow(clippy::cast_precision_loss)]
        record_units_per_request(fragments.len() as f64);

        let (id, units) = self.tracker.begin(task_type, client, fragments, batch);
        increment_requests_inflight();

        if units.is_empty() {
            return self.finish(id);
        }
        increment_units_pending(units.len() as u64);
        self.dispatcher.queue_request(id, units);
        self.dispatch_ready()
    }

    /// Sends a `Failure` reply for a request that could not be accepted.
    pub fn reject(&self, client: ClientId, err: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!("Rejected request from {client}: {err}");

        increment_protocol_errors();
        let reason = Payload::Single(Bytes::from(err.to_string()));
        let reply = Envelope::failure("", None, Some(reason));
        if self
            .replies
            .send(Outbound {
                to: client,
                frame: reply.to_bytes(),
            })
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::error!("Frontend router closed, dropping rejection for {client}");
        }
    }

    fn finish(&mut self, id: CorrelationId) -> Result<()> {
        let done = self.tracker.complete(id)?;
        decrement_requests_inflight();
        record_request_duration(done.elapsed.as_secs_f64() * 1000.0);

        let payload = if done.batch {
            Payload::batch(done.responses)
        } else {
            Payload::Single(done.responses.into_iter().next().unwrap_or_default())
        };
        let reply = if done.failed {
            Envelope::failure(done.task_type.as_str(), None, Some(payload))
        } else {
            Envelope::data(done.task_type.as_str(), payload)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Request {} for {} complete in {:?} (failed: {})",
            done.correlation_id,
            done.client,
            done.elapsed,
            done.failed
        );

        self.replies
            .send(Outbound {
                to: done.client,
                frame: reply.to_bytes(),
            })
            .map_err(|_| Error::ChannelError {
                context: "frontend router closed".to_string(),
            })?;
        increment_replies();
        Ok(())
    }

    fn dispatch_ready(&mut self) -> Result<()> {
        let sent = self
            .dispatcher
            .dispatch_ready(&mut self.workers, &mut self.tracker, &self.dispatch)?;
        if sent > 0 {
            increment_units_dispatched(sent as u64);
            decrement_units_pending(sent as u64);
        }
        Ok(())
    }

    /// Sends one `End` to every distinct registered worker and returns how
    /// many were sent. Requests still in flight are abandoned.
    pub fn shutdown(self) -> usize {
        let _abandoned = self.tracker.in_flight();
        #[cfg(feature = "tracing")]
        if _abandoned > 0 {
            tracing::warn!(
                "Abandoning {_abandoned} in-flight request(s) with {} undispatched unit(s)",
                self.dispatcher.pending_units()
            );
        }

        let end = Envelope::end("").to_bytes();
        let mut sent = 0;
        for worker in self.workers.all_workers() {
            if self
                .dispatch
                .send(Outbound {
                    to: worker.clone(),
                    frame: end.clone(),
                })
                .is_err()
            {
                #[cfg(feature = "tracing")]
                tracing::error!("Dispatch router closed before end reached {worker}");
                break;
            }
            sent += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Broker stopped, sent end to {sent} worker(s)");
        sent
    }

    /// Runs the reactor until `cancel` fires, then performs
    /// [`shutdown`](Self::shutdown).
    pub async fn run(mut self, mut inbound: BrokerInbound, cancel: CancellationToken) -> usize {
        #[cfg(feature = "tracing")]
        tracing::info!("Broker running for {} task type(s)", self.tasks.len());

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(frame) = inbound.registration.recv() => {
                    if let Err(e) = self.on_registration(frame) {
                        Self::report("registration", &e);
                    }
                }
                Some(frame) = inbound.acks.recv() => {
                    if let Err(e) = self.on_ack(frame) {
                        Self::report("ack", &e);
                    }
                }
                Some(Inbound { from, frame }) = inbound.frontend.recv() => {
                    if let Err(e) = self.on_client_request(from, frame) {
                        if e.is_protocol_violation() {
                            self.reject(from, &e);
                        } else {
                            Self::report("frontend", &e);
                        }
                    }
                }
            }
        }

        self.shutdown()
    }

    fn report(_channel: &str, err: &Error) {
        if err.is_protocol_violation() {
            increment_protocol_errors();
            #[cfg(feature = "tracing")]
            tracing::warn!("Dropped {_channel} message: {err}");
        } else {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to handle {_channel} message: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskbroker_core::envelope::Routing;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        broker: Broker,
        replies: UnboundedReceiver<Outbound<ClientId>>,
        dispatch: UnboundedReceiver<Outbound<WorkerId>>,
    }

    impl Harness {
        fn new(reply_order: ReplyOrder) -> Self {
            let (reply_tx, replies) = mpsc::unbounded_channel();
            let (dispatch_tx, dispatch) = mpsc::unbounded_channel();
            let tasks = TaskRegistry::from_iter(["T", "U"]);
            Self {
                broker: Broker::new(tasks, reply_order, reply_tx, dispatch_tx),
                replies,
                dispatch,
            }
        }

        fn register(&mut self, task: &str, worker: &str) {
            self.broker
                .on_registration(Envelope::ready(task, worker).to_bytes())
                .unwrap();
        }

        fn request(&mut self, client: u64, task: &str, payload: Payload) {
            self.broker
                .on_client_request(ClientId(client), Envelope::data(task, payload).to_bytes())
                .unwrap();
        }

        /// Drains dispatched units as `(worker, routing, payload)`.
        fn dispatched(&mut self) -> Vec<(String, Routing, Bytes)> {
            let mut out = Vec::new();
            while let Ok(Outbound { to, frame }) = self.dispatch.try_recv() {
                let mut msg = Envelope::from_bytes(frame).unwrap();
                let routing = msg.require_routing().unwrap();
                out.push((to.to_string(), routing, msg.take_single().unwrap()));
            }
            out
        }

        /// Acks a unit with its uppercased payload.
        fn ack(&mut self, routing: Routing, payload: &Bytes) {
            let response = Bytes::from(payload.to_ascii_uppercase());
            self.broker
                .on_ack(Envelope::ack("T", routing, response).to_bytes())
                .unwrap();
        }

        fn reply(&mut self) -> Option<(ClientId, Envelope)> {
            self.replies
                .try_recv()
                .ok()
                .map(|Outbound { to, frame }| (to, Envelope::from_bytes(frame).unwrap()))
        }
    }

    fn items(values: &[&'static str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
    }

    fn batch_scenario(order: ReplyOrder) -> Vec<Bytes> {
        let mut h = Harness::new(order);
        h.register("T", "w1");
        h.register("T", "w2");
        h.request(1, "T", Payload::batch(items(&["a", "b", "c"])));

        let units = h.dispatched();
        let assigned: Vec<_> = units
            .iter()
            .map(|(to, _, payload)| (to.as_str(), &payload[..]))
            .collect();
        assert_eq!(
            assigned,
            [("w1", &b"a"[..]), ("w2", &b"b"[..]), ("w1", &b"c"[..])]
        );

        for idx in [2, 0, 1] {
            assert!(h.reply().is_none());
            let (_, routing, payload) = &units[idx];
            h.ack(*routing, payload);
        }

        let (client, mut reply) = h.reply().unwrap();
        assert_eq!(client, ClientId(1));
        assert_eq!(reply.kind(), MessageKind::Data);
        assert_eq!(h.broker.in_flight(), 0);
        let (responses, batch) = reply.take_payload().unwrap().into_fragments();
        assert!(batch);
        responses
    }

    #[test]
    fn batch_reply_follows_ack_arrival() {
        assert_eq!(batch_scenario(ReplyOrder::AckArrival), items(&["C", "A", "B"]));
    }

    #[test]
    fn batch_reply_follows_fragment_order() {
        assert_eq!(batch_scenario(ReplyOrder::Fragment), items(&["A", "B", "C"]));
    }

    #[test]
    fn scalar_request_is_replied_after_one_ack() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.register("T", "w1");
        h.request(4, "T", Payload::Single(Bytes::from_static(b"x")));

        let units = h.dispatched();
        assert_eq!(units.len(), 1);
        let (_, routing, payload) = &units[0];
        h.ack(*routing, payload);

        let (client, mut reply) = h.reply().unwrap();
        assert_eq!(client, ClientId(4));
        assert_eq!(reply.take_single().unwrap(), Bytes::from_static(b"X"));
    }

    #[test]
    fn request_waits_for_first_registration() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.request(1, "T", Payload::Single(Bytes::from_static(b"x")));
        assert!(h.dispatched().is_empty());
        assert_eq!(h.broker.pending_units(), 1);

        h.register("T", "late");
        let units = h.dispatched();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].0, "late");
        assert_eq!(h.broker.pending_units(), 0);
    }

    #[test]
    fn concurrent_requests_do_not_mix() {
        let mut h = Harness::new(ReplyOrder::Fragment);
        h.register("T", "w1");
        h.request(1, "T", Payload::batch(items(&["a", "b"])));
        h.request(2, "T", Payload::batch(items(&["x", "y"])));

        let mut units = h.dispatched();
        units.reverse();
        for (_, routing, payload) in &units {
            h.ack(*routing, payload);
        }

        let mut replies = Vec::new();
        while let Some((client, mut reply)) = h.reply() {
            replies.push((client, reply.take_payload().unwrap().into_fragments().0));
        }
        replies.sort_by_key(|(client, _)| *client);
        assert_eq!(replies, [
            (ClientId(1), items(&["A", "B"])),
            (ClientId(2), items(&["X", "Y"])),
        ]);
    }

    #[test]
    fn failed_unit_yields_failure_reply() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.register("T", "w1");
        h.request(1, "T", Payload::Single(Bytes::from_static(b"x")));
        let (_, routing, _) = h.dispatched().remove(0);

        let failure = Envelope::failure(
            "T",
            Some(routing),
            Some(Payload::Single(Bytes::from_static(b"boom"))),
        );
        h.broker.on_ack(failure.to_bytes()).unwrap();

        let (_, reply) = h.reply().unwrap();
        assert_eq!(reply.kind(), MessageKind::Failure);
    }

    #[test]
    fn empty_batch_is_answered_immediately() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.request(1, "T", Payload::batch(Vec::new()));

        let (_, mut reply) = h.reply().unwrap();
        assert_eq!(reply.kind(), MessageKind::Data);
        assert_eq!(reply.take_payload().unwrap().into_fragments(), (Vec::new(), true));
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[test]
    fn duplicate_and_unknown_acks_are_rejected() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.register("T", "w1");
        h.request(1, "T", Payload::batch(items(&["a", "b"])));
        let units = h.dispatched();
        let (_, first, payload) = &units[0];
        h.ack(*first, payload);

        let again = Envelope::ack("T", *first, Bytes::new()).to_bytes();
        assert!(matches!(
            h.broker.on_ack(again),
            Err(Error::DuplicateAck { .. })
        ));

        let stray = Routing {
            client: 1,
            correlation_id: 999,
            fragment: 0,
        };
        let stray = Envelope::ack("T", stray, Bytes::new()).to_bytes();
        assert!(matches!(
            h.broker.on_ack(stray),
            Err(Error::UnknownCorrelation { id: 999 })
        ));

        assert!(h.reply().is_none());
        let (_, second, payload) = &units[1];
        h.ack(*second, payload);
        assert!(h.reply().is_some());
    }

    #[test]
    fn unknown_task_type_is_rejected_with_failure() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        let frame = Envelope::data("NOPE", Payload::Single(Bytes::new())).to_bytes();
        let err = h.broker.on_client_request(ClientId(3), frame).unwrap_err();
        assert!(err.is_protocol_violation());

        h.broker.reject(ClientId(3), &err);
        let (client, reply) = h.reply().unwrap();
        assert_eq!(client, ClientId(3));
        assert_eq!(reply.kind(), MessageKind::Failure);
    }

    #[test]
    fn registration_requires_ready_and_identity() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        assert!(h.broker.on_registration(Envelope::end("T").to_bytes()).is_err());
        assert!(h.broker.on_registration(Envelope::ready("T", "").to_bytes()).is_err());
        assert!(h.broker.on_registration(Envelope::ready("X", "w").to_bytes()).is_err());
        assert!(h.broker.workers().all_workers().is_empty());
    }

    #[test]
    fn shutdown_sends_one_end_per_identity() {
        let mut h = Harness::new(ReplyOrder::AckArrival);
        h.register("T", "w1");
        h.register("U", "w1");
        h.register("T", "w2");
        h.register("T", "w1");

        assert_eq!(h.broker.shutdown(), 2);
        let mut ended = Vec::new();
        while let Ok(Outbound { to, frame }) = h.dispatch.try_recv() {
            let msg = Envelope::from_bytes(frame).unwrap();
            assert_eq!(msg.kind(), MessageKind::End);
            assert!(msg.task_type.is_empty());
            ended.push(to.to_string());
        }
        assert_eq!(ended, ["w1", "w2"]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (reply_tx, _replies) = mpsc::unbounded_channel();
        let (dispatch_tx, mut dispatch) = mpsc::unbounded_channel();
        let (_frontend_tx, frontend) = mpsc::channel(8);
        let (registration_tx, registration) = mpsc::channel(8);
        let (_ack_tx, acks) = mpsc::channel(8);

        let broker = Broker::new(
            TaskRegistry::from_iter(["T"]),
            ReplyOrder::AckArrival,
            reply_tx,
            dispatch_tx,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(broker.run(
            BrokerInbound {
                frontend,
                registration,
                acks,
            },
            cancel.clone(),
        ));

        registration_tx
            .send(Envelope::ready("T", "w1").to_bytes())
            .await
            .unwrap();
        tokio::task::yield_now().await;
        while !registration_tx.is_closed() && registration_tx.capacity() < 8 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 1);
        let end = dispatch.recv().await.unwrap();
        assert_eq!(end.to.as_str(), "w1");
    }
}
