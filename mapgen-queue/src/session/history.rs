//! Lifecycle history entries and the bounded ring that retains them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use super::identity::SessionId;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    /// Waiting in the queue.
    Queued,
    /// Dequeued and running against the generator.
    Processing,
    /// Finished with an artifact.
    Completed,
    /// Finished without an artifact.
    Failed,
}

impl LifecycleStatus {
    /// Whether no further transitions can follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Queued => "Added to queue",
            Self::Processing => "Started processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable snapshot recorded at a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session: SessionId,
    /// Whole-degree coordinates; detailed coordinates are not retained.
    pub coordinates: (i32, i32),
    /// Upper-cased game code, e.g. "FS25".
    pub game_code: String,
    pub size: u32,
    pub status: LifecycleStatus,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Copy of this entry with a new status, stamped now.
    pub fn transition(&self, status: LifecycleStatus) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    /// Render the entry for status listings.
    pub fn summary(&self, now: DateTime<Utc>) -> TaskSummary {
        let elapsed = (now - self.timestamp).num_seconds().max(0);
        TaskSummary {
            coordinates: format!("{}, {}", self.coordinates.0, self.coordinates.1),
            game_code: self.game_code.clone(),
            size: self.size,
            status: format!("{} {}", self.status.label(), human_readable_elapsed(elapsed)),
        }
    }
}

/// Display form of a history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub coordinates: String,
    pub game_code: String,
    pub size: u32,
    pub status: String,
}

/// Format an elapsed number of seconds as "x minutes ago".
pub fn human_readable_elapsed(seconds: i64) -> String {
    match seconds {
        s if s < 60 => "just now".to_string(),
        s if s < 3600 => plural(s / 60, "minute"),
        s if s < 86_400 => plural(s / 3600, "hour"),
        s => plural(s / 86_400, "day"),
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

/// Most-recent-N ring of history entries.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, dropping the oldest once the ring is full.
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries in recording order (oldest first).
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: LifecycleStatus) -> HistoryEntry {
        HistoryEntry {
            session: SessionId::from_raw(name),
            coordinates: (45, 20),
            game_code: "FS25".to_string(),
            size: 2048,
            status,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let mut ring = HistoryRing::new(3);
        for i in 0..5 {
            ring.push(entry(&format!("s{}", i), LifecycleStatus::Completed));
        }

        let names: Vec<&str> = ring.iter().map(|e| e.session.as_str()).collect();
        assert_eq!(names, vec!["s2", "s3", "s4"]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_zero_capacity_ring_keeps_nothing() {
        let mut ring = HistoryRing::new(0);
        ring.push(entry("s", LifecycleStatus::Queued));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_transition_keeps_identity() {
        let queued = entry("s", LifecycleStatus::Queued);
        let done = queued.transition(LifecycleStatus::Failed);
        assert_eq!(done.session, queued.session);
        assert_eq!(done.status, LifecycleStatus::Failed);
        assert!(done.status.is_terminal());
        assert!(!queued.status.is_terminal());
    }

    #[test]
    fn test_summary_text() {
        let mut e = entry("s", LifecycleStatus::Completed);
        e.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let summary = e.summary(Utc::now());
        assert_eq!(summary.coordinates, "45, 20");
        assert_eq!(summary.status, "Completed 5 minutes ago");
    }

    #[test]
    fn test_human_readable_elapsed() {
        assert_eq!(human_readable_elapsed(10), "just now");
        assert_eq!(human_readable_elapsed(60), "1 minute ago");
        assert_eq!(human_readable_elapsed(7200), "2 hours ago");
        assert_eq!(human_readable_elapsed(86_400 * 3), "3 days ago");
    }
}
