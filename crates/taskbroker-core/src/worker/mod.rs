//! Worker runtime for the broker's backend channels.
//!
//! A [`ServiceWorker`] serves one task type. On [`run`](ServiceWorker::run) it:
//!
//! 1. connects to the dispatch endpoint and announces its identity,
//! 2. connects to the ack endpoint,
//! 3. registers its task type on the registration endpoint,
//! 4. feeds every routed unit to a [`SlotPool`] of concurrent slot tasks that
//!    run the [`Handler`] and ack the result,
//! 5. stops when the broker sends `End` or closes the dispatch connection.
//!
//! ## Structure
//!
//! - [`pool`] - Round-robin slot pool with a shutdown handshake.
//! - [`slot`] - Slot task loop and per-unit handling.

pub mod pool;
pub mod slot;

use crate::{
    common::{
        error::{Error, Result},
        types::{TaskType, WorkerId},
    },
    endpoint::Endpoint,
    envelope::{Envelope, MessageKind},
    transport::{self, DEFAULT_MAX_FRAME_BYTES, InprocHub},
};
use bytes::Bytes;
use core::time::Duration;
use futures::{SinkExt, StreamExt};
use pool::SlotPool;
use slot::{SlotRequest, slot_loop};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Error returned by a [`Handler`]. The message is sent back to the broker in
/// the unit's `Failure` ack.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The work a worker performs on one fragment.
///
/// Implementations must be stateless with respect to requests: any slot may
/// receive any fragment of any request.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        task_type: &TaskType,
        payload: Bytes,
    ) -> core::result::Result<Bytes, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&TaskType, Bytes) -> core::result::Result<Bytes, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        task_type: &TaskType,
        payload: Bytes,
    ) -> core::result::Result<Bytes, HandlerError> {
        self(task_type, payload)
    }
}

/// Construction parameters of a [`ServiceWorker`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub identity: WorkerId,
    pub task_type: TaskType,
    pub dispatch_endpoint: Endpoint,
    pub registration_endpoint: Endpoint,
    pub ack_endpoint: Endpoint,
    /// Number of concurrent slot tasks.
    pub slots: usize,
    /// Queue depth of each slot.
    pub slot_buffer_size: usize,
    pub max_frame_bytes: usize,
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// A single-slot configuration with default buffer sizes.
    pub fn new(
        identity: WorkerId,
        task_type: TaskType,
        dispatch_endpoint: Endpoint,
        registration_endpoint: Endpoint,
        ack_endpoint: Endpoint,
    ) -> Self {
        Self {
            identity,
            task_type,
            dispatch_endpoint,
            registration_endpoint,
            ack_endpoint,
            slots: 1,
            slot_buffer_size: 16,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub const fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }
}

/// A worker process (or task) serving one task type.
pub struct ServiceWorker<H> {
    config: WorkerConfig,
    handler: Arc<H>,
    hub: InprocHub,
}

impl<H: Handler> ServiceWorker<H> {
    /// Validates `config` and creates the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSetting`] if `slots` or `slot_buffer_size` is 0.
    pub fn new(config: WorkerConfig, handler: H, hub: InprocHub) -> Result<Self> {
        if config.slots == 0 {
            return Err(Error::InvalidSetting {
                setting: "slots",
                reason: "must be at least 1",
            });
        }
        if config.slot_buffer_size == 0 {
            return Err(Error::InvalidSetting {
                setting: "slot_buffer_size",
                reason: "must be at least 1",
            });
        }
        Ok(Self {
            config,
            handler: Arc::new(handler),
            hub,
        })
    }

    /// Connects to the broker and serves units until the broker sends `End`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if any endpoint cannot be reached.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;
        let identity = config.identity.as_str();
        let task_type = config.task_type.as_str();

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Worker {identity} connecting to dispatch endpoint {}",
            config.dispatch_endpoint
        );

        let dispatch = transport::connect(&config.dispatch_endpoint, &self.hub).await?;
        let mut dispatch = transport::framed(dispatch, config.max_frame_bytes);
        dispatch
            .send(Envelope::ready(task_type, identity).to_bytes())
            .await?;

        let ack = transport::connect(&config.ack_endpoint, &self.hub).await?;
        let mut ack_sink = transport::framed(ack, config.max_frame_bytes);
        let (ack_tx, mut ack_rx) = mpsc::channel::<Bytes>(config.slots * config.slot_buffer_size);
        let ack_writer = tokio::spawn(async move {
            while let Some(frame) = ack_rx.recv().await {
                if let Err(_e) = ack_sink.send(frame).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Ack connection failed: {_e}");
                    break;
                }
            }
        });

        let registration = transport::connect(&config.registration_endpoint, &self.hub).await?;
        let mut registration = transport::framed(registration, config.max_frame_bytes);
        registration
            .send(Envelope::ready(task_type, identity).to_bytes())
            .await?;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker {identity} registered for task type {task_type}");

        let mut slots = Vec::with_capacity(config.slots);
        for slot_id in 0..config.slots {
            let (tx, rx) = mpsc::channel(config.slot_buffer_size);
            slots.push(tx);
            tokio::spawn(slot_loop(
                slot_id,
                rx,
                Arc::clone(&self.handler),
                config.task_type.clone(),
                ack_tx.clone(),
            ));
        }
        drop(ack_tx);
        let pool = SlotPool::new(slots, config.shutdown_timeout);

        while let Some(frame) = dispatch.next().await {
            let decoded = frame
                .map_err(Error::from)
                .and_then(|f| Envelope::from_bytes(f.freeze()));
            let mut msg = match decoded {
                Ok(msg) => msg,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {identity} dropped malformed dispatch frame: {_e}");
                    continue;
                }
            };

            match msg.kind() {
                MessageKind::Routing => {
                    let unit = msg.require_routing().and_then(|routing| {
                        Ok(SlotRequest::Unit {
                            routing,
                            payload: msg.take_single()?,
                            task_type: core::mem::take(&mut msg.task_type),
                        })
                    });
                    match unit {
                        Ok(unit) => pool.send_to_next_slot(unit).await?,
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Worker {identity} dropped routed message: {_e}");
                        }
                    }
                }
                MessageKind::End => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Worker {identity} received end message");
                    break;
                }
                _other => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {identity} ignored {_other:?} message");
                }
            }
        }

        pool.shutdown().await;
        // Slots held the last ack senders; the writer drains and exits.
        drop(pool);
        if ack_writer.await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {identity} ack writer panicked");
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Worker {identity} stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::TaskRegistry;

    fn config() -> WorkerConfig {
        let endpoint = |name: &str| -> Endpoint { format!("inproc://{name}").parse().unwrap() };
        WorkerConfig::new(
            WorkerId::new("w1"),
            TaskRegistry::from_iter(["T"]).get("T").unwrap(),
            endpoint("backend"),
            endpoint("registration"),
            endpoint("ack"),
        )
    }

    fn echo(_: &TaskType, payload: Bytes) -> core::result::Result<Bytes, HandlerError> {
        Ok(payload)
    }

    #[test]
    fn zero_slots_is_an_invalid_setting() {
        let result = ServiceWorker::new(config().with_slots(0), echo, InprocHub::default());
        assert!(matches!(
            result,
            Err(Error::InvalidSetting {
                setting: "slots",
                ..
            })
        ));
    }

    #[test]
    fn zero_slot_buffer_is_an_invalid_setting() {
        let mut config = config();
        config.slot_buffer_size = 0;
        let result = ServiceWorker::new(config, echo, InprocHub::default());
        assert!(matches!(
            result,
            Err(Error::InvalidSetting {
                setting: "slot_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn default_config_is_accepted() {
        assert!(ServiceWorker::new(config(), echo, InprocHub::default()).is_ok());
    }
}
