use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub message: String,
}

/// Process-wide counters and a bounded activity log for the status API.
pub struct Dashboard {
    started_at: DateTime<Utc>,
    started: Instant,
    messages: AtomicU64,
    max_logs: usize,
    logs: Mutex<VecDeque<ActivityEntry>>,
}

impl Dashboard {
    pub fn new(max_logs: usize) -> Self {
        let max_logs = max_logs.max(1);
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            messages: AtomicU64::new(0),
            max_logs,
            logs: Mutex::new(VecDeque::with_capacity(max_logs)),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_message(&self) -> u64 {
        self.messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn info(&self, chat_id: Option<&str>, message: impl Into<String>) {
        self.push(ActivityLevel::Info, chat_id, message.into());
    }

    pub fn error(&self, chat_id: Option<&str>, message: impl Into<String>) {
        self.push(ActivityLevel::Error, chat_id, message.into());
    }

    /// Activity entries, oldest first.
    pub fn logs(&self) -> Vec<ActivityEntry> {
        self.lock_logs().iter().cloned().collect()
    }

    fn push(&self, level: ActivityLevel, chat_id: Option<&str>, message: String) {
        let mut logs = self.lock_logs();
        while logs.len() >= self.max_logs {
            logs.pop_front();
        }
        logs.push_back(ActivityEntry {
            timestamp: Utc::now(),
            level,
            chat_id: chat_id.map(str::to_string),
            message,
        });
    }

    fn lock_logs(&self) -> MutexGuard<'_, VecDeque<ActivityEntry>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
