//! Logical request model and polling policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::protocol::DEFAULT_CHECK_DELAYS_MS;

/// Payload of a logical request. Submitting text makes the reply payload come
/// back as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    Bytes(Vec<u8>),
    Text(String),
}

impl RequestData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RequestData::Bytes(bytes) => bytes,
            RequestData::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, RequestData::Text(_))
    }
}

impl From<Vec<u8>> for RequestData {
    fn from(bytes: Vec<u8>) -> Self {
        RequestData::Bytes(bytes)
    }
}

impl From<&str> for RequestData {
    fn from(text: &str) -> Self {
        RequestData::Text(text.to_string())
    }
}

impl From<String> for RequestData {
    fn from(text: String) -> Self {
        RequestData::Text(text)
    }
}

/// Reply payload, mirroring the submission form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyData {
    Bytes(Vec<u8>),
    Text(String),
}

impl ReplyData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ReplyData::Bytes(bytes) => bytes,
            ReplyData::Text(text) => text.as_bytes(),
        }
    }
}

/// Completed reply of a logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Caller-visible result code reported by the device.
    pub result: i32,
    /// Reply payload, if the device returned one.
    pub data: Option<ReplyData>,
}

/// Schedule for CHECK polling between inconclusive replies.
pub trait PollingPolicy: Send + Sync {
    /// Delay before the CHECK with the given attempt index.
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// The default backoff table, saturating at the last entry.
#[derive(Debug, Default)]
pub struct DefaultPolling;

impl PollingPolicy for DefaultPolling {
    fn next_delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(DEFAULT_CHECK_DELAYS_MS.len() - 1);
        Duration::from_millis(DEFAULT_CHECK_DELAYS_MS[index])
    }
}

/// A constant polling delay.
#[derive(Debug)]
pub struct ConstantPolling(pub Duration);

impl PollingPolicy for ConstantPolling {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// A logical request owned by the engine while in flight.
pub(crate) struct LogicalRequest {
    /// Monotonically increasing per-device id, assigned at submission.
    pub id: u32,
    /// Logical request type code.
    pub request_type: u16,
    /// Optional payload; text submissions make the reply text.
    pub data: Option<RequestData>,
    /// Server-assigned slot handle, present once INIT succeeds.
    pub proto_id: Option<u16>,
    /// Whether the payload has been uploaded to the device.
    pub data_sent: bool,
    /// CHECK attempts so far, fed to the polling policy.
    pub check_count: u32,
    /// Absolute time at which the request fails with a timeout.
    pub deadline: Instant,
    /// Host-side poll timer; the pump re-enqueues the request onto the
    /// checking queue when it fires.
    pub next_check_at: Option<Instant>,
    /// Terminal flag. A done request may still sit in a queue; the pump
    /// skips it at dequeue time.
    pub done: bool,
    pub polling: Arc<dyn PollingPolicy>,
}

impl LogicalRequest {
    pub fn payload_len(&self) -> usize {
        self.data.as_ref().map(RequestData::len).unwrap_or(0)
    }

    pub fn wants_text_reply(&self) -> bool {
        self.data.as_ref().is_some_and(RequestData::is_text)
    }
}

/// The completion side of a logical request: outcomes parked here until the
/// caller collects them by id.
pub(crate) type Outcome = Result<Reply>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_polling_table() {
        let policy = DefaultPolling;
        assert_eq!(policy.next_delay(0), Duration::from_millis(50));
        assert_eq!(policy.next_delay(1), Duration::from_millis(50));
        assert_eq!(policy.next_delay(2), Duration::from_millis(100));
        assert_eq!(policy.next_delay(4), Duration::from_millis(250));
        assert_eq!(policy.next_delay(8), Duration::from_millis(1000));
        // Saturates at the last entry.
        assert_eq!(policy.next_delay(9), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(1000), Duration::from_millis(1000));
    }

    #[test]
    fn test_constant_polling() {
        let policy = ConstantPolling(Duration::from_millis(5));
        assert_eq!(policy.next_delay(0), Duration::from_millis(5));
        assert_eq!(policy.next_delay(100), Duration::from_millis(5));
    }

    #[test]
    fn test_text_payload_round_trips_bytes() {
        let data = RequestData::from("hello");
        assert!(data.is_text());
        assert_eq!(data.as_bytes(), b"hello");
        assert_eq!(data.len(), 5);
    }
}
