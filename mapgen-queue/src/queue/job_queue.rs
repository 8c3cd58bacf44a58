//! In-memory job queue with pluggable ordering.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::Notify;
use tracing::debug;

use super::job::Job;

/// Dequeue-order key: lower keys leave the queue first.
pub type QueueKey = (u32, u64);

/// Ordering discipline of the queue.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum QueueOrdering {
    /// Strict arrival order.
    #[default]
    Fifo,
    /// Smaller maps first, arrival order among equal sizes.
    ///
    /// A sustained stream of small jobs can starve large ones.
    SizePriority,
}

impl QueueOrdering {
    /// Key for a job of `size` admitted as the `sequence`-th submission.
    pub fn key(&self, size: u32, sequence: u64) -> QueueKey {
        match self {
            Self::Fifo => (0, sequence),
            Self::SizePriority => (size, sequence),
        }
    }
}

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Ordering discipline.
    #[serde(default)]
    pub ordering: QueueOrdering,
    /// Warning threshold for queue depth.
    pub warning_threshold: usize,
    /// Critical threshold for queue depth.
    pub critical_threshold: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            ordering: QueueOrdering::Fifo,
            warning_threshold: 20,
            critical_threshold: 100,
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

struct WaitingJob {
    key: QueueKey,
    job: Job,
}

impl PartialEq for WaitingJob {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for WaitingJob {}

impl PartialOrd for WaitingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitingJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the lowest key must surface first.
        other.key.cmp(&self.key)
    }
}

struct QueueState {
    heap: BinaryHeap<WaitingJob>,
    next_sequence: u64,
}

/// The job queue service.
pub struct JobQueue {
    config: JobQueueConfig,
    state: Mutex<QueueState>,
    /// Notify when new jobs are added.
    notify: Notify,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new() -> Self {
        Self::with_config(JobQueueConfig::default())
    }

    /// Create a new job queue with custom configuration.
    pub fn with_config(config: JobQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.config.ordering
    }

    /// Add a job and wake one waiting worker.
    pub fn submit(&self, job: Job) {
        {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let key = self.config.ordering.key(job.size(), sequence);
            debug!(job_id = %job.id, session = %job.session, ?key, "Job enqueued");
            state.heap.push(WaitingJob { key, job });
        }
        self.notify.notify_one();
    }

    /// Take the next job without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        self.state.lock().heap.pop().map(|w| w.job)
    }

    /// Wait until a job is available and take it.
    ///
    /// Each job is handed to exactly one caller.
    pub async fn dequeue(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_dequeue() {
                return job;
            }
            notified.await;
        }
    }

    /// Number of jobs waiting.
    pub fn depth(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Get the queue depth status.
    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.depth();
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
