use crate::runtime::{lock, ProxyEvent, Scheduler, Timer, TimerSchedule};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

/// Timers as spawned tasks that post `ProxyEvent::Timer` back to the control
/// loop. Rescheduling or cancelling a key aborts the task behind it; an event
/// already queued before the abort may still arrive, so handlers re-check state.
/// A one-shot timer forgets its own handle once it has fired.
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<ProxyEvent>,
    tasks: Arc<Mutex<HashMap<Timer, Armed>>>,
    next_ticket: AtomicU64,
}

struct Armed {
    ticket: u64,
    handle: JoinHandle<()>,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<ProxyEvent>) -> Self {
        Self {
            events,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Timers that have not fired or been cancelled yet.
    pub fn armed_count(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, timer: Timer, schedule: TimerSchedule) {
        let events = self.events.clone();
        let key = timer.clone();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        // The entry must be in place before a one-shot can fire.
        let mut tasks = lock(&self.tasks);
        let handle = match schedule {
            TimerSchedule::Once(delay) => {
                let registry = Arc::clone(&self.tasks);
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = events.send(ProxyEvent::Timer(key.clone()));
                    let mut armed = lock(&registry);
                    if armed.get(&key).is_some_and(|entry| entry.ticket == ticket) {
                        armed.remove(&key);
                    }
                })
            }
            TimerSchedule::Every(period) => tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    if events.send(ProxyEvent::Timer(key.clone())).is_err() {
                        break;
                    }
                }
            }),
        };
        if let Some(previous) = tasks.insert(timer, Armed { ticket, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel(&self, timer: &Timer) {
        if let Some(armed) = lock(&self.tasks).remove(timer) {
            armed.handle.abort();
        }
    }

    fn cancel_all(&self) {
        for (_, armed) in lock(&self.tasks).drain() {
            armed.handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
