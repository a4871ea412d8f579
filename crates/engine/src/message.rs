//! Outbound message model and the priority queue feeding the sender task.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use uuid::Uuid;

/// Default priority for queued messages; smaller values are sent first.
pub const DEFAULT_PRIORITY: u32 = 10;

/// A single outbound request to the control plane, immutable once queued.
///
/// The endpoint is a path relative to the API base; the sender appends the
/// runner's id as the final path segment and adds the auth headers.
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) id: Uuid,
    pub(crate) endpoint: String,
    pub(crate) method: Method,
    pub(crate) body: Option<Value>,
    pub(crate) file: Option<PathBuf>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) priority: u32,
    pub(crate) timeout: Option<Duration>,
}

impl Message {
    /// A message carrying a JSON body (or none, for bodiless verbs).
    pub fn json(endpoint: impl Into<String>, method: Method, body: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            method,
            body,
            file: None,
            headers: Vec::new(),
            params: Vec::new(),
            priority: DEFAULT_PRIORITY,
            timeout: None,
        }
    }

    /// A message uploading the contents of a local file as its body.
    ///
    /// The file takes precedence over any JSON body; a missing file fails
    /// the send with [`crate::ProxyError::PayloadMissing`].
    pub fn file_upload(endpoint: impl Into<String>, method: Method, file: PathBuf) -> Self {
        let mut message = Self::json(endpoint, method, None);
        message.file = Some(file);
        message
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }
}

struct QueuedMessage {
    message: Message,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // Reversed so the std max-heap pops the smallest (priority, seq) pair:
    // highest urgency first, insertion order among equals.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.message.priority, other.seq).cmp(&(self.message.priority, self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueuedMessage>,
    seq: u64,
}

/// Thread-safe min-ordered multiset of outbound messages.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    /// Insert a message; stable with respect to equal priorities.
    pub fn push(&self, message: Message) {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(QueuedMessage { message, seq });
    }

    /// Remove and return the most urgent resident, without blocking.
    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().heap.pop().map(|queued| queued.message)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
