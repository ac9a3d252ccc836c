//! Error types for the task broker and its peers.
//!
//! This module defines the central `Error` enum shared by the broker, the
//! transport layer and the client/worker runtimes. Errors fall into three
//! groups:
//!
//! ## Configuration
//! - `InvalidEndpoint`: An endpoint address failed validation.
//! - `UnknownTaskType`: A task type name was never registered.
//! - `InvalidSetting`: A runtime setting is out of range.
//!
//! ## Protocol violations
//! - `UnknownCorrelation`: An ack referenced a request the broker is not
//!   tracking.
//! - `DuplicateAck`: A fragment was acknowledged twice.
//! - `FragmentOutOfRange`: An ack referenced a fragment the request never had.
//! - `UnexpectedKind`: A message of the wrong kind arrived on a channel.
//! - `MissingField`: A required envelope field was absent.
//! - `Decode`: The bytes on the wire were not a valid envelope.
//!
//! ## Runtime
//! - `NoCapacity`: No worker is registered for a task type.
//! - `ChannelError`: An internal channel between tasks was closed.
//! - `Transport`: A socket or pipe operation failed.
//! - `RequestFailed`: A worker reported failure for part of a request.
//! - `ServiceShutdown`: The broker or worker is shutting down.

use crate::envelope::MessageKind;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the task broker.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The endpoint address is malformed or uses an unsupported scheme.
    #[error("Invalid endpoint `{address}`: {reason}")]
    InvalidEndpoint { address: String, reason: String },

    /// The task type has not been registered.
    #[error("Unknown task type: {name}")]
    UnknownTaskType { name: String },

    /// A client or worker setting has an unusable value.
    #[error("Invalid setting `{setting}`: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: &'static str,
    },

    /// An ack or completion referenced an unknown correlation id.
    #[error("Unknown correlation id: {id}")]
    UnknownCorrelation { id: u64 },

    /// A fragment of a request was acknowledged more than once.
    #[error("Duplicate ack for fragment {fragment} of request {id}")]
    DuplicateAck { id: u64, fragment: u32 },

    /// An ack referenced a fragment index past the end of the request.
    #[error("Fragment {fragment} out of range for request {id} ({total} fragments)")]
    FragmentOutOfRange { id: u64, fragment: u32, total: usize },

    /// A message of the wrong kind arrived where another was required.
    #[error("Expected {expected:?} message, got {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    /// A required envelope field was missing.
    #[error("Missing field `{field}` in {kind:?} message")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },

    /// The message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// No worker is available for the task type.
    #[error("No capacity for task type {task_type}")]
    NoCapacity { task_type: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A socket, pipe or framing operation failed.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// At least one unit of the request failed on its worker.
    #[error("Request failed for task type {task_type}")]
    RequestFailed { task_type: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Returns `true` for errors caused by a peer breaking the broker
    /// protocol, as opposed to local configuration or runtime failures.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownTaskType { .. }
                | Self::UnknownCorrelation { .. }
                | Self::DuplicateAck { .. }
                | Self::FragmentOutOfRange { .. }
                | Self::UnexpectedKind { .. }
                | Self::MissingField { .. }
                | Self::Decode(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            context: err.to_string(),
        }
    }
}
