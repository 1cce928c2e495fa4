use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Application payload.
    Data,

    /// First message from a source seen by this receiver. Carries no payload.
    BeginningOfSession,

    /// The source has been deleted. Carries no payload.
    EndOfSession,
}

impl MessageKind {
    pub fn is_data(&self) -> bool {
        matches!(self, MessageKind::Data)
    }
}

/// One message handed to a delivery callback.
///
/// Everything here borrows engine-owned storage and is valid only for the duration of
/// the callback. Copy out whatever needs to outlive the call.
pub struct Message<'a> {
    kind: MessageKind,

    data: &'a [u8],

    /// In the publisher-subscriber model, a topic is an address where messages are delivered to and subscribed from.
    topic_name: &'a str,

    /// Identifier string of the source that published the message.
    source: &'a str,

    /// Per-source sequence number, strictly increasing in send order.
    sequence_number: u32,
}

impl<'a> Message<'a> {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn topic_name(&self) -> &'a str {
        self.topic_name
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("topic_name", &self.topic_name)
            .field("source", &self.source)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// Engine-side form of a message travelling from a source dispatch task to a receiver
/// queue. The payload is shared between every receiver of the fan-out.
#[derive(Clone, Debug)]
pub(crate) struct Delivery {
    pub(crate) kind: MessageKind,
    pub(crate) payload: Bytes,
    pub(crate) topic_name: Arc<str>,
    pub(crate) source: Arc<str>,
    pub(crate) sequence_number: u32,
}

impl Delivery {
    pub(crate) fn view(&self) -> Message<'_> {
        Message {
            kind: self.kind,
            data: &self.payload,
            topic_name: &self.topic_name,
            source: &self.source,
            sequence_number: self.sequence_number,
        }
    }
}
