//! Client runtime for the broker's frontend channel.
//!
//! A [`ServiceClient`] holds one connection to the frontend endpoint and issues
//! one request at a time: it sends a `Data` envelope and waits for the
//! aggregated reply. Batches are split across workers by the broker; the
//! client only ever sees the final reply.

use crate::{
    common::{
        error::{Error, Result},
        types::TaskType,
    },
    endpoint::Endpoint,
    envelope::{Envelope, MessageKind, Payload},
    transport::{self, Connection, DEFAULT_MAX_FRAME_BYTES, InprocHub},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};

/// A blocking-style client of the broker.
pub struct ServiceClient {
    conn: Connection,
    task_type: TaskType,
}

impl ServiceClient {
    /// Connects to the broker's frontend endpoint. Requests default to
    /// `task_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the endpoint cannot be reached.
    pub async fn connect(
        endpoint: &Endpoint,
        hub: &InprocHub,
        task_type: TaskType,
    ) -> Result<Self> {
        #[cfg(feature = "tracing")]
        tracing::info!("Client connecting to endpoint: {endpoint}");

        let io = transport::connect(endpoint, hub).await?;
        Ok(Self {
            conn: transport::framed(io, DEFAULT_MAX_FRAME_BYTES),
            task_type,
        })
    }

    pub const fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Sends a single payload and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestFailed`] if the worker reported failure, or a
    /// transport/protocol error if the reply could not be received.
    pub async fn request(&mut self, payload: Bytes) -> Result<Bytes> {
        let task_type = self.task_type.clone();
        match self.request_as(&task_type, Payload::Single(payload)).await? {
            Payload::Single(value) => Ok(value),
            Payload::Batch(_) => Err(Error::MissingField {
                kind: MessageKind::Data,
                field: "payload.single",
            }),
        }
    }

    /// Sends a batch; each item is processed as an independent unit. The
    /// reply holds one response per item.
    ///
    /// # Errors
    ///
    /// See [`ServiceClient::request`].
    pub async fn request_batch(&mut self, payloads: Vec<Bytes>) -> Result<Vec<Bytes>> {
        let task_type = self.task_type.clone();
        let (responses, _) = self
            .request_as(&task_type, Payload::batch(payloads))
            .await?
            .into_fragments();
        Ok(responses)
    }

    /// Sends `payload` for an explicit task type and returns the reply
    /// payload.
    ///
    /// # Errors
    ///
    /// See [`ServiceClient::request`].
    pub async fn request_as(&mut self, task_type: &TaskType, payload: Payload) -> Result<Payload> {
        let msg = Envelope::data(task_type.as_str(), payload);

        #[cfg(feature = "tracing")]
        tracing::debug!("Client sending request for task {task_type}");

        self.conn.send(msg.to_bytes()).await?;

        let frame = match self.conn.next().await {
            Some(frame) => frame?,
            None => return Err(Error::ServiceShutdown),
        };
        let mut reply = Envelope::from_bytes(frame.freeze())?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Client received reply for task type {}, msgtype: {:?}",
            reply.task_type,
            reply.kind()
        );

        match reply.expect_kind(&[MessageKind::Data, MessageKind::Failure])? {
            MessageKind::Failure => Err(Error::RequestFailed {
                task_type: reply.task_type,
            }),
            _ => reply.take_payload(),
        }
    }
}
