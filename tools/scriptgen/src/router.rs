use crate::errors::ProxyError;
use crate::health::HealthMonitor;
use crate::jsonrpc::{parse_child_line, ChildMessage, RequestId};
use crate::queue::{PendingQueue, QueuedRequest};
use crate::supervisor::Supervisor;
use std::collections::HashMap;

/// What to do with the child's response once it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePlan {
    Relay,
    /// Append the local tool to a `tools/list` result.
    MergeTools,
    /// Relay, and on success remember `url` as the current page.
    Navigate { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub id: RequestId,
    pub plan: ResponsePlan,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Queued,
    Sent,
    /// The write failed; the process was torn down and the request put back
    /// at the head of the queue. Calls already sent to that process will
    /// never be answered.
    Retrying { orphaned: Vec<PendingCall> },
    /// The write failed and the replacement process could not be spawned.
    /// The request is back at the head of the queue with nothing to serve it.
    RespawnFailed {
        error: ProxyError,
        orphaned: Vec<PendingCall>,
    },
    Abandoned {
        entry: QueuedRequest,
        error: ProxyError,
        orphaned: Vec<PendingCall>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutput {
    Probe,
    Matched {
        call: PendingCall,
        message: ChildMessage,
        raw: String,
    },
    /// Requests, notifications and responses nobody is waiting for go to the
    /// client as they are.
    Unmatched { raw: String },
    /// Answer to a call that already timed out; the caller has its error.
    Late { id: RequestId },
    Garbage { error: ProxyError },
}

/// Tracks requests written to the browser service and pairs each response
/// with the call that produced it. Removal from the table is the only way a
/// call resolves, so a call is answered at most once.
pub struct CorrelationRouter {
    pending: HashMap<RequestId, PendingCall>,
    /// Timed-out ids and the generation they were sent to.
    expired: HashMap<RequestId, u64>,
    max_write_retries: u32,
}

impl CorrelationRouter {
    pub fn new(max_write_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            expired: HashMap::new(),
            max_write_retries,
        }
    }

    pub fn dispatch(
        &mut self,
        supervisor: &mut Supervisor,
        queue: &mut PendingQueue,
        mut entry: QueuedRequest,
    ) -> DispatchOutcome {
        if !supervisor.is_ready() {
            queue.enqueue(entry);
            return DispatchOutcome::Queued;
        }

        let generation = supervisor.generation();
        match supervisor.write_line(&entry.line) {
            Ok(()) => {
                if let Some(id) = &entry.id {
                    self.pending.insert(
                        id.clone(),
                        PendingCall {
                            id: id.clone(),
                            plan: entry.plan.clone(),
                            generation,
                        },
                    );
                }
                DispatchOutcome::Sent
            }
            Err(error) => {
                supervisor.teardown();
                let orphaned = self.take_generation(generation);
                entry.attempts += 1;
                if entry.attempts > self.max_write_retries {
                    return DispatchOutcome::Abandoned {
                        entry,
                        error,
                        orphaned,
                    };
                }
                queue.requeue_front(entry);
                if let Err(error) = supervisor.start() {
                    return DispatchOutcome::RespawnFailed { error, orphaned };
                }
                DispatchOutcome::Retrying { orphaned }
            }
        }
    }

    /// Replays queued requests in order for as long as the service stays ready.
    pub fn drain(
        &mut self,
        supervisor: &mut Supervisor,
        queue: &mut PendingQueue,
    ) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while supervisor.is_ready() {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            outcomes.push(self.dispatch(supervisor, queue, entry));
        }
        outcomes
    }

    pub fn classify(&mut self, line: &str, health: &HealthMonitor) -> ChildOutput {
        let message = match parse_child_line(line) {
            Ok(message) => message,
            Err(error) => return ChildOutput::Garbage { error },
        };
        let raw = line.trim().to_string();
        if !message.is_response() {
            return ChildOutput::Unmatched { raw };
        }
        let Some(id) = message.id.clone() else {
            return ChildOutput::Unmatched { raw };
        };
        if health.is_probe_id(&id) {
            return ChildOutput::Probe;
        }
        if let Some(call) = self.pending.remove(&id) {
            return ChildOutput::Matched { call, message, raw };
        }
        if self.expired.remove(&id).is_some() {
            return ChildOutput::Late { id };
        }
        ChildOutput::Unmatched { raw }
    }

    /// Gives up on a call whose deadline passed. A response arriving later is
    /// reported as `Late` instead of being relayed.
    pub fn expire(&mut self, id: &RequestId) -> Option<PendingCall> {
        let call = self.pending.remove(id)?;
        self.expired.insert(id.clone(), call.generation);
        Some(call)
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Removes every call sent to `generation`. Expired ids of that process
    /// are forgotten too, since it can no longer answer them.
    pub fn take_generation(&mut self, generation: u64) -> Vec<PendingCall> {
        self.expired.retain(|_, sent_to| *sent_to != generation);
        let ids = self
            .pending
            .values()
            .filter(|call| call.generation == generation)
            .map(|call| call.id.clone())
            .collect::<Vec<_>>();
        ids.iter().filter_map(|id| self.pending.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
