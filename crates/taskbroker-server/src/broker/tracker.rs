//! Per-request bookkeeping: correlation ids, fragment acks and the response
//! accumulator.

use bytes::Bytes;
use core::time::Duration;
use std::{collections::HashMap, time::Instant};
use taskbroker_core::{
    ClientId, CorrelationId, Error, Result, TaskType, envelope::Routing,
};

/// Order of the responses in a completed reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReplyOrder {
    /// Responses appear in the order their acks reached the broker. Fragment
    /// order is not preserved when workers finish out of order.
    #[default]
    AckArrival,
    /// Responses are sorted by fragment index, matching the request order.
    Fragment,
}

/// One dispatchable fragment of a request.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub correlation_id: CorrelationId,
    pub task_type: TaskType,
    pub fragment: u32,
    pub client: ClientId,
    pub payload: Bytes,
}

impl WorkUnit {
    pub const fn routing(&self) -> Routing {
        Routing {
            client: self.client.0,
            correlation_id: self.correlation_id,
            fragment: self.fragment,
        }
    }
}

#[derive(Debug)]
struct Request {
    task_type: TaskType,
    client: ClientId,
    batch: bool,
    dispatched: usize,
    acked: Vec<bool>,
    failed: bool,
    responses: Vec<(u32, Bytes)>,
    started: Instant,
}

impl Request {
    fn is_complete(&self) -> bool {
        self.responses.len() == self.acked.len()
    }
}

/// A finished request, removed from the tracker and ready to be replied to.
#[derive(Debug)]
pub struct Completed {
    pub correlation_id: CorrelationId,
    pub task_type: TaskType,
    pub client: ClientId,
    pub batch: bool,
    /// `true` if any unit was acked with `Failure`.
    pub failed: bool,
    pub responses: Vec<Bytes>,
    pub elapsed: Duration,
}

/// Tracks every request between its arrival and its reply.
#[derive(Debug)]
pub struct RequestTracker {
    next_id: CorrelationId,
    requests: HashMap<CorrelationId, Request>,
    reply_order: ReplyOrder,
}

impl RequestTracker {
    pub fn new(reply_order: ReplyOrder) -> Self {
        Self {
            next_id: 1,
            requests: HashMap::new(),
            reply_order,
        }
    }

    /// Creates a request and splits it into work units, one per fragment.
    pub fn begin(
        &mut self,
        task_type: TaskType,
        client: ClientId,
        fragments: Vec<Bytes>,
        batch: bool,
    ) -> (CorrelationId, Vec<WorkUnit>) {
        let correlation_id = self.next_id;
        self.next_id += 1;

        let units: Vec<_> = (0u32..)
            .zip(fragments)
            .map(|(fragment, payload)| WorkUnit {
                correlation_id,
                task_type: task_type.clone(),
                fragment,
                client,
                payload,
            })
            .collect();

        self.requests.insert(
            correlation_id,
            Request {
                task_type,
                client,
                batch,
                dispatched: 0,
                acked: vec![false; units.len()],
                failed: false,
                responses: Vec::with_capacity(units.len()),
                started: Instant::now(),
            },
        );
        (correlation_id, units)
    }

    /// Folds one ack into its request and reports whether every fragment has
    /// now been acked.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownCorrelation`] if the request is not tracked.
    /// - [`Error::FragmentOutOfRange`] if the request has no such fragment.
    /// - [`Error::DuplicateAck`] if the fragment was already acked.
    ///
    /// A rejected ack leaves the request untouched.
    pub fn record_ack(
        &mut self,
        id: CorrelationId,
        fragment: u32,
        response: Bytes,
        failed: bool,
    ) -> Result<bool> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::UnknownCorrelation { id })?;

        let total = request.acked.len();
        let slot = request
            .acked
            .get_mut(fragment as usize)
            .ok_or(Error::FragmentOutOfRange { id, fragment, total })?;
        if *slot {
            return Err(Error::DuplicateAck { id, fragment });
        }
        *slot = true;

        request.failed |= failed;
        request.responses.push((fragment, response));
        Ok(request.is_complete())
    }

    /// Counts one unit of `id` as sent to a worker.
    pub fn mark_dispatched(&mut self, id: CorrelationId) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.dispatched += 1;
        }
    }

    /// Number of units of `id` sent to workers so far.
    pub fn dispatched(&self, id: CorrelationId) -> Option<usize> {
        self.requests.get(&id).map(|request| request.dispatched)
    }

    /// Removes `id` and returns its responses in the configured order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCorrelation`] if the request is not tracked.
    pub fn complete(&mut self, id: CorrelationId) -> Result<Completed> {
        let mut request = self
            .requests
            .remove(&id)
            .ok_or(Error::UnknownCorrelation { id })?;

        if self.reply_order == ReplyOrder::Fragment {
            request.responses.sort_by_key(|(fragment, _)| *fragment);
        }

        Ok(Completed {
            correlation_id: id,
            task_type: request.task_type,
            client: request.client,
            batch: request.batch,
            failed: request.failed,
            responses: request.responses.into_iter().map(|(_, r)| r).collect(),
            elapsed: request.started.elapsed(),
        })
    }

    /// Number of requests that have not been replied to.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }
}
