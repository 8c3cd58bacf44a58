//! Process-wide registry of active sessions.
//!
//! The tracker owns the Active Session Set, the queued/processing
//! bookkeeping, the history ring and the timing statistics used for wait
//! estimation. All state lives behind one lock so that membership and
//! position answers are always mutually consistent.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::history::{HistoryEntry, HistoryRing, LifecycleStatus, TaskSummary};
use super::identity::SessionId;
use crate::error::AdmissionError;
use crate::queue::{QueueKey, QueueOrdering};

/// Default number of history entries retained.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// In-flight status of a tracked session.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedStatus {
    /// Waiting in the queue.
    Queued {
        /// 0-based position in dequeue order.
        position: usize,
        estimated_wait: Duration,
    },
    /// Currently executing.
    Processing,
}

#[derive(Debug, Clone)]
struct QueuedSession {
    entry: HistoryEntry,
    key: QueueKey,
}

#[derive(Debug)]
struct TrackerState {
    active: HashSet<SessionId>,
    queued: HashMap<SessionId, QueuedSession>,
    processing: HashMap<SessionId, HistoryEntry>,
    history: HistoryRing,
    completed: u64,
    failed: u64,
    total_processing: Duration,
    next_sequence: u64,
}

impl TrackerState {
    fn position_of(&self, session: &SessionId) -> Option<usize> {
        let own = self.queued.get(session)?.key;
        Some(self.queued.values().filter(|q| q.key < own).count())
    }

    fn average(&self) -> Duration {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return Duration::ZERO;
        }
        self.total_processing
            .checked_div(finished as u32)
            .unwrap_or(Duration::ZERO)
    }
}

/// Registry of queued and processing sessions.
pub struct SessionTracker {
    state: Mutex<TrackerState>,
    ordering: QueueOrdering,
    workers: usize,
}

impl SessionTracker {
    /// Create a tracker with the default history capacity and one worker.
    pub fn new(ordering: QueueOrdering) -> Self {
        Self::with_capacity(ordering, DEFAULT_HISTORY_CAPACITY, 1)
    }

    /// Create a tracker.
    ///
    /// `workers` is the number of jobs that may run concurrently; it only
    /// affects wait estimation.
    pub fn with_capacity(ordering: QueueOrdering, history_capacity: usize, workers: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                active: HashSet::new(),
                queued: HashMap::new(),
                processing: HashMap::new(),
                history: HistoryRing::new(history_capacity),
                completed: 0,
                failed: 0,
                total_processing: Duration::ZERO,
                next_sequence: 0,
            }),
            ordering,
            workers: workers.max(1),
        }
    }

    /// Admit a session into the Active Session Set.
    ///
    /// Fails if the identity is already active or if `max_active` sessions
    /// are already active. On success the session is queued and a `queued`
    /// history entry has been recorded.
    pub fn admit(
        &self,
        entry: HistoryEntry,
        max_active: Option<usize>,
    ) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();

        if state.active.contains(&entry.session) {
            return Err(AdmissionError::AlreadyInProgress(entry.session));
        }
        if let Some(limit) = max_active
            && state.active.len() >= limit
        {
            return Err(AdmissionError::CapacityExceeded {
                active: state.active.len(),
                limit,
            });
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let key = self.ordering.key(entry.size, sequence);
        let entry = entry.transition(LifecycleStatus::Queued);

        state.active.insert(entry.session.clone());
        state.history.push(entry.clone());
        state
            .queued
            .insert(entry.session.clone(), QueuedSession { entry, key });
        Ok(())
    }

    /// Move a dequeued session to processing.
    ///
    /// The session stays in the Active Session Set. Returns the recorded
    /// `processing` entry.
    pub fn mark_processing(&self, session: &SessionId) -> Option<HistoryEntry> {
        let mut state = self.state.lock();
        let Some(queued) = state.queued.remove(session) else {
            warn!(session = %session, "Dequeued session was not tracked as queued");
            return None;
        };

        let entry = queued.entry.transition(LifecycleStatus::Processing);
        state.processing.insert(session.clone(), entry.clone());
        state.history.push(entry.clone());
        Some(entry)
    }

    /// Drop a session that was still queued when the service stopped.
    ///
    /// Records a `failed` history entry without touching the completion
    /// counters or the processing average. Returns `false` if the session
    /// was not queued.
    pub fn abandon(&self, session: &SessionId) -> bool {
        let mut state = self.state.lock();
        let Some(queued) = state.queued.remove(session) else {
            return false;
        };
        state.active.remove(session);
        state
            .history
            .push(queued.entry.transition(LifecycleStatus::Failed));
        debug!(session = %session, "Queued session abandoned");
        true
    }

    /// Record the terminal transition of a session.
    ///
    /// Removes the identity from every active structure unconditionally and
    /// appends exactly one terminal history entry.
    pub fn finish(&self, entry: &HistoryEntry, success: bool, elapsed: Duration) {
        let status = if success {
            LifecycleStatus::Completed
        } else {
            LifecycleStatus::Failed
        };

        let mut state = self.state.lock();
        state.active.remove(&entry.session);
        state.queued.remove(&entry.session);
        state.processing.remove(&entry.session);
        state.history.push(entry.transition(status));
        if success {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        state.total_processing += elapsed;

        debug!(
            session = %entry.session,
            status = %status,
            elapsed_secs = elapsed.as_secs_f64(),
            "Session finished"
        );
    }

    /// Whether the session is waiting in the queue (and not yet processing).
    pub fn is_queued(&self, session: &SessionId) -> bool {
        let state = self.state.lock();
        state.queued.contains_key(session) && !state.processing.contains_key(session)
    }

    pub fn is_processing(&self, session: &SessionId) -> bool {
        self.state.lock().processing.contains_key(session)
    }

    /// Whether the session is queued or processing.
    pub fn is_active(&self, session: &SessionId) -> bool {
        self.state.lock().active.contains(session)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn processing_count(&self) -> usize {
        self.state.lock().processing.len()
    }

    /// 0-based position of a queued session in dequeue order.
    pub fn queue_position(&self, session: &SessionId) -> Option<usize> {
        self.state.lock().position_of(session)
    }

    /// Estimated time until a queued session starts processing.
    ///
    /// Zero for sessions that are not queued or before any job finished.
    pub fn estimated_wait(&self, session: &SessionId) -> Duration {
        let state = self.state.lock();
        match state.position_of(session) {
            Some(position) => self.wait_for(position, &state),
            None => Duration::ZERO,
        }
    }

    fn wait_for(&self, position: usize, state: &TrackerState) -> Duration {
        let ahead = position + state.processing.len();
        let rounds = ahead.div_ceil(self.workers);
        state.average() * rounds as u32
    }

    /// In-flight status, checking processing before queue membership.
    pub fn status(&self, session: &SessionId) -> Option<TrackedStatus> {
        let state = self.state.lock();
        if state.processing.contains_key(session) {
            return Some(TrackedStatus::Processing);
        }
        let position = state.position_of(session)?;
        Some(TrackedStatus::Queued {
            position,
            estimated_wait: self.wait_for(position, &state),
        })
    }

    /// Mean wall-clock time of finished jobs.
    pub fn average_processing_time(&self) -> Duration {
        self.state.lock().average()
    }

    /// Number of (completed, failed) jobs.
    pub fn task_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.completed, state.failed)
    }

    /// Entries of the sessions currently executing.
    pub fn processing_now(&self) -> Vec<HistoryEntry> {
        self.state.lock().processing.values().cloned().collect()
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Listing of finished, processing and queued sessions, in that order.
    pub fn task_overview(&self) -> Vec<TaskSummary> {
        let now = Utc::now();
        let state = self.state.lock();

        let mut queued: Vec<&QueuedSession> = state.queued.values().collect();
        queued.sort_by_key(|q| q.key);

        state
            .history
            .iter()
            .filter(|e| e.status.is_terminal())
            .chain(state.processing.values())
            .chain(queued.into_iter().map(|q| &q.entry))
            .map(|e| e.summary(now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u32) -> HistoryEntry {
        HistoryEntry {
            session: SessionId::from_raw(name),
            coordinates: (45, 20),
            game_code: "FS25".to_string(),
            size,
            status: LifecycleStatus::Queued,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_admit_marks_session_active_and_queued() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        let e = entry("a", 512);
        tracker.admit(e.clone(), None).unwrap();

        assert!(tracker.is_active(&e.session));
        assert!(tracker.is_queued(&e.session));
        assert!(!tracker.is_processing(&e.session));
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_duplicate_admission_is_rejected() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        tracker.admit(entry("a", 512), None).unwrap();

        let err = tracker.admit(entry("a", 512), None).unwrap_err();
        assert_eq!(err, AdmissionError::AlreadyInProgress(SessionId::from_raw("a")));
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        tracker.admit(entry("a", 512), Some(1)).unwrap();

        let err = tracker.admit(entry("b", 512), Some(1)).unwrap_err();
        assert!(matches!(err, AdmissionError::CapacityExceeded { active: 1, limit: 1 }));
    }

    #[test]
    fn test_processing_implies_active() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        let e = entry("a", 512);
        tracker.admit(e.clone(), None).unwrap();
        tracker.mark_processing(&e.session).unwrap();

        assert!(tracker.is_processing(&e.session));
        assert!(tracker.is_active(&e.session));
        assert!(!tracker.is_queued(&e.session));
        assert_eq!(tracker.status(&e.session), Some(TrackedStatus::Processing));
    }

    #[test]
    fn test_finish_clears_membership() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        let e = entry("a", 512);
        tracker.admit(e.clone(), None).unwrap();
        let processing = tracker.mark_processing(&e.session).unwrap();
        tracker.finish(&processing, false, Duration::from_secs(4));

        assert!(!tracker.is_active(&e.session));
        assert!(!tracker.is_processing(&e.session));
        assert_eq!(tracker.status(&e.session), None);
        assert_eq!(tracker.task_counts(), (0, 1));

        let statuses: Vec<LifecycleStatus> = tracker.history().iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                LifecycleStatus::Queued,
                LifecycleStatus::Processing,
                LifecycleStatus::Failed
            ]
        );
    }

    #[test]
    fn test_abandon_releases_queued_session() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        let e = entry("a", 512);
        tracker.admit(e.clone(), None).unwrap();

        assert!(tracker.abandon(&e.session));
        assert!(!tracker.is_active(&e.session));
        assert!(!tracker.is_queued(&e.session));
        assert_eq!(tracker.task_counts(), (0, 0));
        assert_eq!(tracker.history().last().unwrap().status, LifecycleStatus::Failed);
        assert!(!tracker.abandon(&e.session));
    }

    #[test]
    fn test_queue_position_fifo() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        for (name, size) in [("a", 1024), ("b", 256), ("c", 512)] {
            tracker.admit(entry(name, size), None).unwrap();
        }
        assert_eq!(tracker.queue_position(&SessionId::from_raw("a")), Some(0));
        assert_eq!(tracker.queue_position(&SessionId::from_raw("b")), Some(1));
        assert_eq!(tracker.queue_position(&SessionId::from_raw("c")), Some(2));
        assert_eq!(tracker.queue_position(&SessionId::from_raw("zzz")), None);
    }

    #[test]
    fn test_queue_position_by_size() {
        let tracker = SessionTracker::new(QueueOrdering::SizePriority);
        for (name, size) in [("a", 1024), ("b", 256), ("c", 512)] {
            tracker.admit(entry(name, size), None).unwrap();
        }
        assert_eq!(tracker.queue_position(&SessionId::from_raw("b")), Some(0));
        assert_eq!(tracker.queue_position(&SessionId::from_raw("c")), Some(1));
        assert_eq!(tracker.queue_position(&SessionId::from_raw("a")), Some(2));
    }

    #[test]
    fn test_estimated_wait_uses_average() {
        let tracker = SessionTracker::with_capacity(QueueOrdering::Fifo, 20, 1);

        let first = entry("first", 512);
        tracker.admit(first.clone(), None).unwrap();
        let processing = tracker.mark_processing(&first.session).unwrap();
        tracker.finish(&processing, true, Duration::from_secs(60));
        assert_eq!(tracker.average_processing_time(), Duration::from_secs(60));

        let running = entry("running", 512);
        tracker.admit(running.clone(), None).unwrap();
        tracker.mark_processing(&running.session).unwrap();

        tracker.admit(entry("x", 512), None).unwrap();
        tracker.admit(entry("y", 512), None).unwrap();

        // One job running plus its own queue position ahead of it.
        assert_eq!(
            tracker.estimated_wait(&SessionId::from_raw("x")),
            Duration::from_secs(60)
        );
        assert_eq!(
            tracker.estimated_wait(&SessionId::from_raw("y")),
            Duration::from_secs(120)
        );
        assert_eq!(
            tracker.estimated_wait(&SessionId::from_raw("running")),
            Duration::ZERO
        );
    }

    #[test]
    fn test_task_overview_order() {
        let tracker = SessionTracker::new(QueueOrdering::Fifo);
        let done = entry("done", 512);
        tracker.admit(done.clone(), None).unwrap();
        let p = tracker.mark_processing(&done.session).unwrap();
        tracker.finish(&p, true, Duration::from_secs(1));

        let running = entry("running", 1024);
        tracker.admit(running.clone(), None).unwrap();
        tracker.mark_processing(&running.session).unwrap();
        tracker.admit(entry("waiting", 2048), None).unwrap();

        let overview = tracker.task_overview();
        assert_eq!(overview.len(), 3);
        assert!(overview[0].status.starts_with("Completed"));
        assert!(overview[1].status.starts_with("Started processing"));
        assert!(overview[2].status.starts_with("Added to queue"));
        assert_eq!(overview[2].size, 2048);
    }
}
