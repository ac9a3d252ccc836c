//! Pending work units and their assignment to workers.

use super::{
    Outbound,
    registry::WorkerRegistry,
    tracker::{RequestTracker, WorkUnit},
};
use std::collections::{BTreeMap, VecDeque};
use taskbroker_core::{CorrelationId, Error, Result, WorkerId, envelope::Envelope};
use tokio::sync::mpsc::UnboundedSender;

/// Units waiting for a worker, grouped by request.
///
/// Correlation ids grow monotonically, so iterating the map visits requests
/// in arrival order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: BTreeMap<CorrelationId, VecDeque<WorkUnit>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the units of one request.
    pub fn queue_request(&mut self, id: CorrelationId, units: Vec<WorkUnit>) {
        if !units.is_empty() {
            self.pending.entry(id).or_default().extend(units);
        }
    }

    /// Number of units not yet sent to a worker.
    pub fn pending_units(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Sends every pending unit whose task type has at least one worker.
    ///
    /// Requests are served in arrival order and each request's units in
    /// fragment order. Requests whose pool is empty stay queued. Returns the
    /// number of units sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the dispatch router has stopped.
    pub fn dispatch_ready(
        &mut self,
        registry: &mut WorkerRegistry,
        tracker: &mut RequestTracker,
        sink: &UnboundedSender<Outbound<WorkerId>>,
    ) -> Result<usize> {
        let mut sent = 0;
        for (id, units) in &mut self.pending {
            let Some(first) = units.front() else {
                continue;
            };
            if !registry.has_capacity(&first.task_type) {
                continue;
            }

            // A unit leaves the queue only once the router has taken it.
            while let Some(unit) = units.front() {
                let worker = registry.next_worker(&unit.task_type)?;
                let frame = Envelope::routed(
                    unit.task_type.as_str(),
                    unit.routing(),
                    unit.payload.clone(),
                )
                .to_bytes();

                #[cfg(feature = "tracing")]
                tracing::trace!(
                    "Dispatching fragment {} of request {id} to {worker}",
                    unit.fragment
                );

                sink.send(Outbound { to: worker, frame })
                    .map_err(|_| Error::ChannelError {
                        context: "dispatch router closed".to_string(),
                    })?;
                units.pop_front();
                tracker.mark_dispatched(*id);
                sent += 1;
            }
        }
        self.pending.retain(|_, units| !units.is_empty());
        Ok(sent)
    }
}
