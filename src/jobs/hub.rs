use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::events::{EventEnvelope, JobEvent};

struct RunLog {
    events: Vec<EventEnvelope>,
    sender: broadcast::Sender<EventEnvelope>,
    closed: bool,
}

impl RunLog {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            events: Vec::new(),
            sender,
            closed: false,
        }
    }

    fn after(&self, seq: u64) -> impl Iterator<Item = &EventEnvelope> {
        self.events.iter().filter(move |e| e.seq > seq)
    }
}

/// Replayable per-run event log with a live broadcast tail.
///
/// Every event gets a gap-free sequence number. Late subscribers replay the log from any
/// point and then follow the tail; nothing is accepted after a run's terminal event.
pub struct ProgressHub {
    capacity: usize,
    logs: Mutex<HashMap<Uuid, Arc<Mutex<RunLog>>>>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    async fn log(&self, run_id: Uuid) -> Arc<Mutex<RunLog>> {
        let mut logs = self.logs.lock().await;
        Arc::clone(
            logs.entry(run_id)
                .or_insert_with(|| Arc::new(Mutex::new(RunLog::new(self.capacity)))),
        )
    }

    /// Publishes `event` and returns its sequence number, or `None` if the run already ended.
    pub async fn emit(&self, run_id: Uuid, event: JobEvent) -> Option<u64> {
        let log = self.log(run_id).await;
        let mut log = log.lock().await;
        if log.closed {
            debug!(%run_id, event = event.name(), "dropping event after terminal event");
            return None;
        }

        let envelope = EventEnvelope {
            run_id,
            seq: log.events.len() as u64 + 1,
            at: Utc::now(),
            event,
        };
        log.closed = envelope.event.is_terminal();
        log.events.push(envelope.clone());
        // no live subscribers is fine; the log keeps the event
        let _ = log.sender.send(envelope.clone());
        Some(envelope.seq)
    }

    /// Events with `seq > after_seq`, then the live tail.
    pub async fn subscribe(&self, run_id: Uuid, after_seq: u64) -> Subscription {
        let log = self.log(run_id).await;
        let (backlog, receiver, closed) = {
            let guard = log.lock().await;
            (
                guard.after(after_seq).cloned().collect::<VecDeque<_>>(),
                guard.sender.subscribe(),
                guard.closed,
            )
        };
        Subscription {
            log,
            backlog,
            receiver,
            last_seq: after_seq,
            finished: false,
            source_closed: closed,
        }
    }

    pub async fn replay(&self, run_id: Uuid) -> Vec<EventEnvelope> {
        let log = self.log(run_id).await;
        let guard = log.lock().await;
        guard.events.clone()
    }

    pub async fn forget(&self, run_id: Uuid) {
        self.logs.lock().await.remove(&run_id);
    }
}

pub struct Subscription {
    log: Arc<Mutex<RunLog>>,
    backlog: VecDeque<EventEnvelope>,
    receiver: broadcast::Receiver<EventEnvelope>,
    last_seq: u64,
    finished: bool,
    source_closed: bool,
}

impl Subscription {
    /// Next event in sequence order. `None` once the terminal event was delivered.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(envelope) = self.backlog.pop_front() {
                if let Some(envelope) = self.accept(envelope) {
                    return Some(envelope);
                }
                continue;
            }
            if self.source_closed {
                // log already ended and backlog is drained
                self.finished = true;
                return None;
            }

            match self.receiver.recv().await {
                Ok(envelope) => {
                    if let Some(envelope) = self.accept(envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged; refilling from log");
                    self.refill().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.refill().await;
                    self.source_closed = true;
                }
            }
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn accept(&mut self, envelope: EventEnvelope) -> Option<EventEnvelope> {
        if envelope.seq <= self.last_seq {
            return None;
        }
        self.last_seq = envelope.seq;
        if envelope.event.is_terminal() {
            self.finished = true;
        }
        Some(envelope)
    }

    async fn refill(&mut self) {
        let guard = self.log.lock().await;
        self.backlog = guard.after(self.last_seq).cloned().collect();
    }
}
