use async_nats::HeaderMap;
use bytes::Bytes;

/// A single JetStream message, owned so it can travel through Tower layers
/// and across partition worker channels.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub subject: String,
    pub payload: Bytes,
    /// Headers carry the event type tag and trace context
    pub headers: Option<HeaderMap>,
}

impl ConsumeRequest {
    pub fn new(subject: String, payload: Bytes, headers: Option<HeaderMap>) -> Self {
        Self {
            subject,
            payload,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str())
    }
}

/// What the consumer should do with a processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeResponse {
    /// Processed (or deliberately dropped); acknowledge
    Ack,
    /// Transient failure; redeliver later
    Nak(Option<String>),
    /// The message can never be processed; dead-letter it and stop redelivery
    Term(String),
}

impl ConsumeResponse {
    pub fn ack() -> Self {
        Self::Ack
    }

    pub fn nak(reason: impl Into<String>) -> Self {
        Self::Nak(Some(reason.into()))
    }

    pub fn term(reason: impl Into<String>) -> Self {
        Self::Term(reason.into())
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    pub fn is_nak(&self) -> bool {
        matches!(self, Self::Nak(_))
    }

    pub fn is_term(&self) -> bool {
        matches!(self, Self::Term(_))
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak(_) => "nak",
            Self::Term(_) => "term",
        }
    }
}
