use crate::jsonrpc::RequestId;
use crate::router::ResponsePlan;
use std::collections::VecDeque;

/// A client line waiting to be written to the browser service.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
    pub id: Option<RequestId>,
    pub line: String,
    pub plan: ResponsePlan,
    /// Failed write attempts so far.
    pub attempts: u32,
}

impl QueuedRequest {
    pub fn new(id: Option<RequestId>, line: impl Into<String>, plan: ResponsePlan) -> Self {
        Self {
            id,
            line: line.into(),
            plan,
            attempts: 0,
        }
    }
}

/// FIFO of requests that arrived while the service was not ready.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<QueuedRequest>,
}

impl PendingQueue {
    pub fn enqueue(&mut self, entry: QueuedRequest) {
        self.entries.push_back(entry);
    }

    /// Puts a request whose write failed back ahead of everything queued after it.
    pub fn requeue_front(&mut self, entry: QueuedRequest) {
        self.entries.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<QueuedRequest> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id.as_ref() == Some(id))?;
        self.entries.remove(index)
    }

    /// Empties the queue, oldest first.
    pub fn take_all(&mut self) -> Vec<QueuedRequest> {
        self.entries.drain(..).collect()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.iter().any(|entry| entry.id.as_ref() == Some(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
