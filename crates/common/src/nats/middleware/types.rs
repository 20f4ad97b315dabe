use async_nats::HeaderMap;
use bytes::Bytes;

/// Request to publish a message to JetStream
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub subject: String,
    pub payload: Bytes,
    /// Trace context is injected here by the tracing layer
    pub headers: HeaderMap,
}

impl PublishRequest {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Acknowledged publish
#[derive(Debug)]
pub struct PublishResponse {
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_header() {
        let req = PublishRequest::new("notifications.owner-1", "{}")
            .with_header("Owner-Id", "owner-1");
        assert_eq!(
            req.headers.get("Owner-Id").map(|v| v.as_str()),
            Some("owner-1")
        );
        assert_eq!(req.payload, Bytes::from_static(b"{}"));
    }
}
