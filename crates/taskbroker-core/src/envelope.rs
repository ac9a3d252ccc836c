//! Message envelope exchanged on every broker channel.
//!
//! An [`Envelope`] carries a task type tag, a [`MessageKind`] and an opaque
//! payload. The payload is either a single value or a batch of values; the
//! broker never looks inside either. Messages that are routed on behalf of a
//! client also carry [`Routing`] metadata so a worker's ack can be attributed
//! to the right request and fragment.
//!
//! The encoding is protobuf (via `prost`), framed on the wire by the
//! [`transport`](crate::transport) layer.
//!
//! ## Kinds per channel
//!
//! | channel      | direction        | kinds            |
//! |--------------|------------------|------------------|
//! | frontend     | client -> broker | `Data`           |
//! | frontend     | broker -> client | `Data`, `Failure`|
//! | registration | worker -> broker | `Ready`          |
//! | dispatch     | worker -> broker | `Ready` (hello)  |
//! | dispatch     | broker -> worker | `Routing`, `End` |
//! | ack          | worker -> broker | `Ack`, `Failure` |

use crate::common::error::{Error, Result};
use bytes::Bytes;
use prost::Message;

/// Kind tag of an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Unknown = 0,
    Data = 1,
    Ack = 2,
    Routing = 3,
    End = 4,
    Ready = 5,
    Empty = 6,
    Success = 7,
    Failure = 8,
    MetaData = 9,
}

/// Attribution of a work unit: which client asked, for which request, and
/// which fragment of that request this is.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Routing {
    #[prost(uint64, tag = "1")]
    pub client: u64,
    #[prost(uint64, tag = "2")]
    pub correlation_id: u64,
    #[prost(uint32, tag = "3")]
    pub fragment: u32,
}

/// A batch of opaque values.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Batch {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub items: Vec<Bytes>,
}

/// Payload of an [`Envelope`].
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(bytes = "bytes", tag = "5")]
    Single(Bytes),
    #[prost(message, tag = "6")]
    Batch(Batch),
}

impl Payload {
    /// Splits the payload into independently dispatchable fragments. The
    /// boolean is `true` when the payload was a batch.
    pub fn into_fragments(self) -> (Vec<Bytes>, bool) {
        match self {
            Self::Single(value) => (vec![value], false),
            Self::Batch(batch) => (batch.items, true),
        }
    }

    pub fn batch(items: Vec<Bytes>) -> Self {
        Self::Batch(Batch { items })
    }
}

/// The generic message wrapper.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Task type name; empty for messages that are not task-scoped.
    #[prost(string, tag = "1")]
    pub task_type: String,
    #[prost(enumeration = "MessageKind", tag = "2")]
    pub kind: i32,
    #[prost(message, optional, tag = "3")]
    pub routing: Option<Routing>,
    /// Identity of the sending worker on the registration and dispatch
    /// channels.
    #[prost(string, tag = "4")]
    pub identity: String,
    #[prost(oneof = "Payload", tags = "5, 6")]
    pub payload: Option<Payload>,
}

impl Envelope {
    fn new(task_type: &str, kind: MessageKind) -> Self {
        Self {
            task_type: task_type.to_string(),
            kind: kind as i32,
            ..Default::default()
        }
    }

    /// A client request or a reply.
    pub fn data(task_type: &str, payload: Payload) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(task_type, MessageKind::Data)
        }
    }

    /// Broker -> worker dispatch of one fragment.
    pub fn routed(task_type: &str, routing: Routing, payload: Bytes) -> Self {
        Self {
            routing: Some(routing),
            payload: Some(Payload::Single(payload)),
            ..Self::new(task_type, MessageKind::Routing)
        }
    }

    /// Worker -> broker completion of one fragment.
    pub fn ack(task_type: &str, routing: Routing, response: Bytes) -> Self {
        Self {
            routing: Some(routing),
            payload: Some(Payload::Single(response)),
            ..Self::new(task_type, MessageKind::Ack)
        }
    }

    /// A failure report. With routing it is a failed unit; without it is a
    /// rejected client request.
    pub fn failure(task_type: &str, routing: Option<Routing>, payload: Option<Payload>) -> Self {
        Self {
            routing,
            payload,
            ..Self::new(task_type, MessageKind::Failure)
        }
    }

    /// Worker availability, used for registration and the dispatch hello.
    pub fn ready(task_type: &str, identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..Self::new(task_type, MessageKind::Ready)
        }
    }

    pub fn end(task_type: &str) -> Self {
        Self::new(task_type, MessageKind::End)
    }

    pub fn empty() -> Self {
        Self::new("", MessageKind::Empty)
    }

    pub fn success() -> Self {
        Self::new("", MessageKind::Success)
    }

    pub fn meta_data(data: Bytes) -> Self {
        Self {
            payload: Some(Payload::Single(data)),
            ..Self::new("", MessageKind::MetaData)
        }
    }

    /// Serializes the envelope to its protobuf encoding.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Parses an envelope from its protobuf encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    /// Fails with [`Error::UnexpectedKind`] unless the envelope is one of
    /// `allowed`.
    pub fn expect_kind(&self, allowed: &[MessageKind]) -> Result<MessageKind> {
        let actual = self.kind();
        if allowed.contains(&actual) {
            Ok(actual)
        } else {
            Err(Error::UnexpectedKind {
                expected: allowed.first().copied().unwrap_or(MessageKind::Unknown),
                actual,
            })
        }
    }

    /// Returns the routing metadata or [`Error::MissingField`].
    pub fn require_routing(&self) -> Result<Routing> {
        self.routing.ok_or(Error::MissingField {
            kind: self.kind(),
            field: "routing",
        })
    }

    /// Takes the payload or fails with [`Error::MissingField`].
    pub fn take_payload(&mut self) -> Result<Payload> {
        let kind = self.kind();
        self.payload.take().ok_or(Error::MissingField {
            kind,
            field: "payload",
        })
    }

    /// Takes a single-valued payload. A batch payload is a protocol error
    /// here.
    pub fn take_single(&mut self) -> Result<Bytes> {
        match self.take_payload()? {
            Payload::Single(value) => Ok(value),
            Payload::Batch(_) => Err(Error::MissingField {
                kind: self.kind(),
                field: "payload.single",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TASK: &str = "TSTSK";

    fn roundtrip(envelope: &Envelope) -> Envelope {
        Envelope::from_bytes(envelope.to_bytes()).unwrap()
    }

    #[test]
    fn data_message_keeps_task_and_payload() {
        let msg = roundtrip(&Envelope::data(
            TEST_TASK,
            Payload::Single(Bytes::from_static(b"value1")),
        ));
        assert_eq!(msg.task_type, TEST_TASK);
        assert_eq!(msg.kind(), MessageKind::Data);
        assert_eq!(
            msg.payload,
            Some(Payload::Single(Bytes::from_static(b"value1")))
        );
    }

    #[test]
    fn control_messages_are_not_task_scoped() {
        for (envelope, kind) in [
            (Envelope::empty(), MessageKind::Empty),
            (Envelope::success(), MessageKind::Success),
            (Envelope::end(""), MessageKind::End),
            (Envelope::ready("", ""), MessageKind::Ready),
            (Envelope::failure("", None, None), MessageKind::Failure),
            (Envelope::meta_data(Bytes::from_static(b"{}")), MessageKind::MetaData),
        ] {
            let msg = roundtrip(&envelope);
            assert_eq!(msg.task_type, "");
            assert_eq!(msg.kind(), kind);
        }
    }

    #[test]
    fn ack_carries_routing() {
        let routing = Routing {
            client: 7,
            correlation_id: 42,
            fragment: 3,
        };
        let mut msg = roundtrip(&Envelope::ack(
            TEST_TASK,
            routing,
            Bytes::from_static(b"done"),
        ));
        assert_eq!(msg.require_routing().unwrap(), routing);
        assert_eq!(msg.take_single().unwrap(), Bytes::from_static(b"done"));
    }

    #[test]
    fn batch_splits_into_fragments() {
        let items = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let mut msg = roundtrip(&Envelope::data(TEST_TASK, Payload::batch(items.clone())));
        let (fragments, batch) = msg.take_payload().unwrap().into_fragments();
        assert!(batch);
        assert_eq!(fragments, items);
    }

    #[test]
    fn unexpected_kind_is_reported() {
        let msg = Envelope::end(TEST_TASK);
        let err = msg.expect_kind(&[MessageKind::Data]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedKind {
                expected: MessageKind::Data,
                actual: MessageKind::End
            }
        ));
    }

    #[test]
    fn missing_routing_is_reported() {
        let msg = Envelope::data(TEST_TASK, Payload::Single(Bytes::new()));
        assert!(matches!(
            msg.require_routing(),
            Err(Error::MissingField { field: "routing", .. })
        ));
    }

    #[test]
    fn garbage_does_not_decode() {
        let err = Envelope::from_bytes(Bytes::from_static(&[0xff, 0xff, 0xff])).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
