//! Timestamped append-only log with live subscription.
//!
//! The supervisor pipes child stdio here and the engine records
//! connection milestones; an attached UI can replay the recent ring and
//! then follow live entries from the broadcast channel.

use std::collections::VecDeque;
use std::sync::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;

const RING_CAPACITY: usize = 1024;
const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub line: String,
}

pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

pub struct MemoryLogSink {
    ring: Mutex<VecDeque<LogEntry>>,
    live: broadcast::Sender<LogEntry>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            live,
        }
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        self.ring
            .lock()
            .expect("log ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Follow entries appended after this call. Slow receivers observe a
    /// `Lagged` gap rather than blocking writers.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, line: &str) {
        let entry = LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            line: line.to_string(),
        };
        {
            let mut ring = self.ring.lock().expect("log ring lock poisoned");
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let _ = self.live.send(entry);
    }
}
