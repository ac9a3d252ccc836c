//! Wiring of listeners, routers and the broker reactor.

use super::{
    config::ServerConfig,
    router::{serve_dispatch, serve_frontend, serve_inbound},
};
use crate::broker::{Broker, BrokerInbound};
use core::time::Duration;
use taskbroker_core::{
    Error, Result,
    transport::{InprocHub, Listener},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// A running broker with its four endpoints bound.
pub struct BrokerService {
    cancel: CancellationToken,
    broker: JoinHandle<usize>,
    routers: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl BrokerService {
    /// Binds every endpoint, then starts the routers and the broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if any endpoint cannot be bound. Nothing
    /// is spawned in that case.
    pub async fn start(config: &ServerConfig, hub: &InprocHub) -> Result<Self> {
        let frontend = Listener::bind(&config.frontend_endpoint, hub).await?;
        let backend = Listener::bind(&config.backend_endpoint, hub).await?;
        let registration = Listener::bind(&config.registration_endpoint, hub).await?;
        let ack = Listener::bind(&config.ack_endpoint, hub).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Broker listening: frontend {}, backend {}, registration {}, ack {}",
            config.frontend_endpoint.binding(),
            config.backend_endpoint.binding(),
            config.registration_endpoint.binding(),
            config.ack_endpoint.binding()
        );

        let cancel = CancellationToken::new();
        let capacity = config.channel_capacity;
        let max_frame = config.max_frame_bytes;
        let grace = config.shutdown_timeout;

        let (frontend_tx, frontend_rx) = mpsc::channel(capacity);
        let (registration_tx, registration_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let routers = vec![
            tokio::spawn(serve_frontend(
                frontend,
                max_frame,
                frontend_tx,
                reply_rx,
                cancel.clone(),
                grace,
            )),
            tokio::spawn(serve_dispatch(backend, max_frame, dispatch_rx, grace)),
            tokio::spawn(serve_inbound(
                registration,
                max_frame,
                registration_tx,
                cancel.clone(),
                "registration",
            )),
            tokio::spawn(serve_inbound(ack, max_frame, ack_tx, cancel.clone(), "ack")),
        ];

        let broker = Broker::new(
            config.task_types.clone(),
            config.reply_order,
            reply_tx,
            dispatch_tx,
        );
        let inbound = BrokerInbound {
            frontend: frontend_rx,
            registration: registration_rx,
            acks: ack_rx,
        };
        let broker = tokio::spawn(broker.run(inbound, cancel.clone()));

        Ok(Self {
            cancel,
            broker,
            routers,
            shutdown_timeout: grace,
        })
    }

    /// Stops the broker, which sends `End` to every registered worker, and
    /// waits for the routers to flush. Returns the number of `End` messages
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the broker task panicked.
    pub async fn shutdown(self) -> Result<usize> {
        #[cfg(feature = "tracing")]
        tracing::info!("Shutting down broker");

        self.cancel.cancel();
        let ended = self.broker.await.map_err(|e| Error::ChannelError {
            context: format!("broker task failed: {e}"),
        })?;

        // Routers get their own grace period on top of the per-connection one.
        let routers = futures::future::join_all(self.routers);
        if timeout(self.shutdown_timeout * 2, routers).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Routers did not stop within the shutdown timeout");
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Broker shut down");
        Ok(ended)
    }
}
