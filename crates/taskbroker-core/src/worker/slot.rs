use super::Handler;
use crate::{
    common::types::TaskType,
    envelope::{Envelope, Payload, Routing},
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A message sent from the worker's coordinating task to one slot.
#[derive(Debug)]
pub enum SlotRequest {
    /// Run the handler on one routed fragment and ack the result.
    Unit {
        task_type: String,
        routing: Routing,
        payload: Bytes,
    },

    /// Stop after acknowledging on `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// Slot task: runs the handler for each [`SlotRequest::Unit`] it receives and
/// pushes the ack frame to the worker's ack writer.
///
/// Runs until a [`SlotRequest::Shutdown`] arrives or its channel closes.
pub async fn slot_loop<H: Handler>(
    slot_id: usize,
    mut rx: mpsc::Receiver<SlotRequest>,
    handler: Arc<H>,
    task_type: TaskType,
    acks: mpsc::Sender<Bytes>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Slot {slot_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            SlotRequest::Unit {
                task_type: routed_type,
                routing,
                payload,
            } => {
                let ack = handle_unit(
                    slot_id,
                    &*handler,
                    &task_type,
                    &routed_type,
                    routing,
                    payload,
                );
                if let Err(_e) = acks.send(ack.to_bytes()).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Slot {slot_id} failed to send ack: {_e}");
                    break;
                }
            }
            SlotRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Slot {slot_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Slot {slot_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Slot {slot_id} stopped");
}

/// Runs the handler for one fragment and builds the ack envelope: `Ack` with
/// the response, or `Failure` with the error text.
#[allow(clippy::used_underscore_binding)]
fn handle_unit<H: Handler>(
    _slot_id: usize,
    handler: &H,
    task_type: &TaskType,
    routed_type: &str,
    routing: Routing,
    payload: Bytes,
) -> Envelope {
    if routed_type != task_type.as_str() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Slot {_slot_id} received unit for task type {routed_type}, expected {task_type}"
        );
        let reason = format!("worker serves {task_type}, not {routed_type}");
        return Envelope::failure(
            routed_type,
            Some(routing),
            Some(Payload::Single(Bytes::from(reason))),
        );
    }

    match handler.handle(task_type, payload) {
        Ok(response) => Envelope::ack(task_type.as_str(), routing, response),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Slot {_slot_id} handler failed for request {}: {e}",
                routing.correlation_id
            );
            Envelope::failure(
                task_type.as_str(),
                Some(routing),
                Some(Payload::Single(Bytes::from(e.to_string()))),
            )
        }
    }
}
