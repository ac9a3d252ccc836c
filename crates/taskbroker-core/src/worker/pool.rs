//! Slot pool inside a single worker process.
//!
//! This module defines the [`SlotPool`] struct, which manages a set of
//! asynchronous slot tasks that run the worker's [`Handler`](super::Handler).
//! Units received from the broker are distributed round-robin over bounded
//! [`mpsc`] channels, so handler work overlaps without any socket-level
//! routing inside the process.

use super::slot::SlotRequest;
use crate::common::error::{Error, Result};
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

/// A cooperative pool of slot tasks that process [`SlotRequest`]s.
pub struct SlotPool {
    slots: Vec<mpsc::Sender<SlotRequest>>,
    next_slot: AtomicUsize,
    shutdown_timeout: Duration,
}

impl SlotPool {
    /// Constructs a new [`SlotPool`] from initialized slot channels.
    pub const fn new(slots: Vec<mpsc::Sender<SlotRequest>>, shutdown_timeout: Duration) -> Self {
        Self {
            slots,
            next_slot: AtomicUsize::new(0),
            shutdown_timeout,
        }
    }

    /// Returns the index of the next slot to receive work (round-robin).
    ///
    /// Uses a relaxed atomic increment to minimize contention.
    pub fn next_slot_index(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    /// Sends a [`SlotRequest`] to the next slot, waiting while that slot's
    /// queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the slot has stopped.
    pub async fn send_to_next_slot(&self, request: SlotRequest) -> Result<()> {
        let slot_idx = self.next_slot_index();
        let slot = &self.slots[slot_idx];

        match slot.send(request).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::ChannelError {
                context: format!("Slot {slot_idx} channel closed"),
            }),
        }
    }

    /// Stops every slot once it has drained the units already queued to it.
    ///
    /// Each slot gets a [`SlotRequest::Shutdown`] and the pool waits up to
    /// the shutdown timeout per slot for the acknowledgement.
    pub async fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all slots to shut down");

        let mut shutdown_handles = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = slot.send(SlotRequest::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to slot {i}: {_e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let shutdown_timeout = self.shutdown_timeout;
        let timeout_futures = shutdown_handles.into_iter().map(|(_i, rx)| async move {
            match timeout(shutdown_timeout, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Slot {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Slot {_i} returned error: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Slot {_i} shutdown timed out");
                }
            }
        });

        futures::future::join_all(timeout_futures).await;

        #[cfg(feature = "tracing")]
        tracing::debug!("Slot pool shutdown complete");
    }
}
