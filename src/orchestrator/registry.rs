//! Active process registry.
//!
//! In-memory map of bot id to the live supervised process. This is a
//! cache of the current run only: it is lost on restart and never
//! persisted. The process monitor reconciles persisted bot status against
//! it on every tick.
//!
//! Only the deployer mutates entries. Everyone else reads snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::models::process::{ProcessInfo, ProcessState};

/// Bounded log ring; the oldest line is dropped on overflow.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    appended: usize,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            appended: 0,
        }
    }

    /// Append a line and return the total number of lines ever appended.
    pub fn push(&mut self, line: String) -> usize {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
        self.appended
    }

    /// The most recent `n` lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Every retained line, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no line is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when terminated by a signal or unobservable.
    pub code: Option<i32>,
}

/// One live supervised process.
#[derive(Debug)]
pub struct ProcessEntry {
    pub(crate) pid: u32,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) state: ProcessState,
    pub(crate) exit_code: Option<i32>,
    pub(crate) logs: LogBuffer,
    /// Fired by `stop` to have the exit watcher kill through its handle.
    pub(crate) kill: CancellationToken,
    /// Set once by the exit watcher after the entry is removed.
    pub(crate) exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessEntry {
    pub(crate) fn new(
        pid: u32,
        log_capacity: usize,
        kill: CancellationToken,
        exit: watch::Receiver<Option<ProcessExit>>,
    ) -> Self {
        Self {
            pid,
            start_time: Utc::now(),
            state: ProcessState::Running,
            exit_code: None,
            logs: LogBuffer::new(log_capacity),
            kill,
            exit,
        }
    }

    /// Snapshot view of this entry.
    #[must_use]
    pub fn info(&self, bot_id: &str) -> ProcessInfo {
        ProcessInfo {
            bot_id: bot_id.to_owned(),
            pid: self.pid,
            running: self.state != ProcessState::Stopped,
            start_time: self.start_time,
            uptime_seconds: (Utc::now() - self.start_time).num_seconds().max(0),
            logs: self.logs.lines(),
            status: self.state,
            exit_code: self.exit_code,
        }
    }
}

pub(crate) type ProcessTable = HashMap<String, ProcessEntry>;

/// Shared registry handle.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<ProcessTable>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ProcessTable> {
        self.inner.lock().await
    }

    /// Whether a live entry exists for `bot_id`.
    pub async fn contains(&self, bot_id: &str) -> bool {
        self.inner.lock().await.contains_key(bot_id)
    }

    /// Snapshot of one entry.
    pub async fn get(&self, bot_id: &str) -> Option<ProcessInfo> {
        self.inner
            .lock()
            .await
            .get(bot_id)
            .map(|entry| entry.info(bot_id))
    }

    /// Snapshot of every entry, ordered by bot id.
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let guard = self.inner.lock().await;
        let mut infos: Vec<ProcessInfo> = guard.iter().map(|(id, entry)| entry.info(id)).collect();
        infos.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        infos
    }

    /// Identifiers of every registered bot.
    pub async fn bot_ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Number of registered processes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no process is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
