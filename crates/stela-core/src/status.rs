//! In-memory record of in-flight and completed transfers, kept for the
//! operator surface. Readers take a snapshot; writers hold the lock only
//! for the transition itself.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub remote_key: String,
    pub state: TransferState,
    pub attempts: u32,
    pub bytes_transferred: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferRecord {
    fn new(remote_key: &str) -> Self {
        Self {
            remote_key: remote_key.to_string(),
            state: TransferState::Pending,
            attempts: 0,
            bytes_transferred: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

/// One state transition, retained in a bounded ring.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub remote_key: String,
    pub state: TransferState,
    pub at: DateTime<Utc>,
}

/// Registry of transfer records plus a bounded event log.
pub struct StatusRegistry {
    records: RwLock<HashMap<String, Arc<Mutex<TransferRecord>>>>,
    events: Mutex<VecDeque<TransferEvent>>,
    event_capacity: usize,
}

impl StatusRegistry {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(event_capacity)),
            event_capacity: event_capacity.max(1),
        }
    }

    /// Create (or reset) the record for a transfer about to be queued.
    pub fn enqueue(&self, remote_key: &str, now: DateTime<Utc>) -> TransferHandle {
        let record = Arc::new(Mutex::new(TransferRecord::new(remote_key)));
        self.records
            .write()
            .unwrap()
            .insert(remote_key.to_string(), Arc::clone(&record));
        self.push_event(remote_key, TransferState::Pending, now);
        TransferHandle { record }
    }

    pub fn transition(
        &self,
        handle: &TransferHandle,
        state: TransferState,
        now: DateTime<Utc>,
    ) {
        let key = {
            let mut record = handle.record.lock().unwrap();
            record.state = state;
            match state {
                TransferState::Running => {
                    record.attempts += 1;
                    if record.started_at.is_none() {
                        record.started_at = Some(now);
                    }
                }
                TransferState::Done | TransferState::Failed => {
                    record.ended_at = Some(now);
                }
                TransferState::Pending => {}
            }
            record.remote_key.clone()
        };
        self.push_event(&key, state, now);
    }

    pub fn record_failure(&self, handle: &TransferHandle, error: &str, now: DateTime<Utc>) {
        {
            let mut record = handle.record.lock().unwrap();
            record.error = Some(error.to_string());
        }
        self.transition(handle, TransferState::Failed, now);
    }

    pub fn add_bytes(&self, handle: &TransferHandle, bytes: u64) {
        handle.record.lock().unwrap().bytes_transferred += bytes;
    }

    fn push_event(&self, remote_key: &str, state: TransferState, at: DateTime<Utc>) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.event_capacity {
            events.pop_front();
        }
        events.push_back(TransferEvent {
            remote_key: remote_key.to_string(),
            state,
            at,
        });
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        let records = self.records.read().unwrap();
        let mut out: Vec<TransferRecord> = records
            .values()
            .map(|r| r.lock().unwrap().clone())
            .collect();
        out.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
        out
    }

    pub fn recent_events(&self) -> Vec<TransferEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Drop terminal records, keeping the registry bounded across rounds.
    pub fn evict_terminal(&self) {
        self.records
            .write()
            .unwrap()
            .retain(|_, record| !record.lock().unwrap().state.is_terminal());
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Worker-side handle to one record.
#[derive(Clone)]
pub struct TransferHandle {
    record: Arc<Mutex<TransferRecord>>,
}

impl TransferHandle {
    pub fn peek(&self) -> TransferRecord {
        self.record.lock().unwrap().clone()
    }
}
