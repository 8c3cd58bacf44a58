//! Service facade wiring the queue, tracker, cache and workers together.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{AdmissionError, Error, Result};
use crate::generator::{GenerationContext, MapGenerator};
use crate::queue::{GenerationKind, GenerationPayload, Job, JobQueue, JobSpec, QueueDepthStatus};
use crate::session::{
    HistoryEntry, LifecycleStatus, SessionId, SessionTracker, TaskSummary, TrackedStatus,
};
use crate::storage::{CacheStats, ResultCache, StorageEntry};
use crate::worker::{JobRuntime, WorkerPool};

/// Where a session stands, as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Finished with an artifact ready for retrieval.
    Completed(StorageEntry),
    /// Finished without an artifact.
    Failed { description: String },
    Processing,
    Queued {
        position: usize,
        estimated_wait: Duration,
    },
    /// Never submitted, already retrieved, or expired.
    Unknown,
}

impl SessionStatus {
    /// Human readable summary.
    pub fn description(&self) -> String {
        match self {
            Self::Completed(entry) => entry.description.clone(),
            Self::Failed { description } => description.clone(),
            Self::Processing => "Task is being processed.".to_string(),
            Self::Queued {
                position,
                estimated_wait,
            } => format!(
                "Task is in the queue at position {}, estimated wait {:.1} minutes.",
                position + 1,
                estimated_wait.as_secs_f64() / 60.0
            ),
            Self::Unknown => "Task ID not found or has expired.".to_string(),
        }
    }
}

/// Result of a retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// The artifact exists on disk.
    Ready(StorageEntry),
    Failed { description: String },
    /// The entry exists but its artifact is gone.
    FileMissing,
    NotFound,
}

/// Description stored for jobs still queued when the service stops.
pub const STOPPED_DESCRIPTION: &str =
    "Task failed with error: service stopped before the task started.";

/// Owner of every queue component.
///
/// The service runs once: [`start`](Self::start) may succeed a single time
/// and [`stop`](Self::stop) is final.
pub struct MapQueueService {
    config: ServiceConfig,
    queue: Arc<JobQueue>,
    tracker: Arc<SessionTracker>,
    cache: Arc<ResultCache>,
    generator: Arc<dyn MapGenerator>,
    pool: WorkerPool,
    /// Serializes tracker admission with queue submission.
    admission: Mutex<()>,
    started: AtomicBool,
    cancellation_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MapQueueService {
    /// Create a new service. Nothing runs until [`start`](Self::start).
    pub fn new(config: ServiceConfig, generator: Arc<dyn MapGenerator>) -> Self {
        let queue = Arc::new(JobQueue::with_config(config.queue.clone()));
        let tracker = Arc::new(SessionTracker::with_capacity(
            config.queue.ordering,
            config.history_capacity,
            config.workers.max_workers,
        ));
        let cache = Arc::new(ResultCache::new(config.storage.clone()));
        let pool = WorkerPool::with_config(config.workers.clone());

        Self {
            config,
            queue,
            tracker,
            cache,
            generator,
            pool,
            admission: Mutex::new(()),
            started: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create the data directories and start the workers and cache sweeper.
    ///
    /// Fails with [`Error::AlreadyStarted`] on every call after the first.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let paths = &self.config.paths;
        for dir in [&paths.data_root, &paths.custom_osm_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::io_path("creating data directory", dir, e))?;
        }

        let sweeper = self
            .cache
            .start_background_sweeper(self.cancellation_token.child_token());
        *self.sweeper.lock() = Some(sweeper);

        let started = self.pool.start(JobRuntime {
            queue: self.queue.clone(),
            tracker: self.tracker.clone(),
            cache: self.cache.clone(),
            generator: self.generator.clone(),
            context: GenerationContext {
                paths: paths.clone(),
                public_mode: self.config.public_mode,
                public_max_map_size: self.config.public_max_map_size,
            },
        });
        if !started {
            return Err(Error::AlreadyStarted);
        }

        info!(
            workers = self.pool.max_workers(),
            ordering = %self.config.queue.ordering,
            public_mode = self.config.public_mode,
            "Map queue service started"
        );
        Ok(())
    }

    /// Stop dispatching.
    ///
    /// Jobs already running finish and record their result. Jobs still
    /// queued are not run: each gets a failed result and leaves the active
    /// set, so its identity can be submitted to another instance.
    pub async fn stop(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.cancellation_token.cancel();
        self.pool.stop().await;

        let abandoned = {
            let _admission = self.admission.lock();
            self.abandon_queued()
        };
        if abandoned > 0 {
            warn!(abandoned, "Queued jobs dropped at shutdown");
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper
            && let Err(e) = handle.await
        {
            warn!("Cache sweeper task failed: {}", e);
        }
        self.cache.wait_for_purges().await;
        info!("Map queue service stopped");
    }

    fn abandon_queued(&self) -> usize {
        let mut abandoned = 0;
        while let Some(job) = self.queue.try_dequeue() {
            if self.tracker.abandon(&job.session) {
                self.cache
                    .put(job.session.clone(), StorageEntry::failed(STOPPED_DESCRIPTION, None));
            }
            abandoned += 1;
        }
        abandoned
    }

    /// Admit a request.
    ///
    /// On success the session is queued and its identity returned. A stale
    /// cached result of the same identity is discarded.
    pub fn submit(
        &self,
        payload: GenerationPayload,
        spec: JobSpec,
    ) -> std::result::Result<SessionId, AdmissionError> {
        let job = Job::new(payload, spec);
        let session = job.session.clone();

        let _admission = self.admission.lock();

        if self.cancellation_token.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }

        if self.config.public_mode {
            let depth = self.queue.depth();
            if depth >= self.config.public_queue_limit {
                warn!(depth, limit = self.config.public_queue_limit, "Rejecting request, queue is full");
                return Err(AdmissionError::QueueFull { depth });
            }
        }

        let entry = HistoryEntry {
            session: session.clone(),
            coordinates: job.payload.coordinates.rounded(),
            game_code: job.payload.game.label(),
            size: job.payload.size,
            status: LifecycleStatus::Queued,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.tracker.admit(entry, self.config.max_active_sessions) {
            debug!(session = %session, error = %e, "Admission rejected");
            return Err(e);
        }

        if self.cache.remove(&session) {
            debug!(session = %session, "Discarded previous result");
        }

        self.queue.submit(job);
        info!(
            session = %session,
            depth = self.queue.depth(),
            "Added to queue"
        );
        Ok(session)
    }

    /// Admit a preset request, applying its settings overrides.
    pub fn submit_kind(
        &self,
        mut payload: GenerationPayload,
        kind: &GenerationKind,
    ) -> std::result::Result<SessionId, AdmissionError> {
        kind.apply(&mut payload);
        self.submit(payload, kind.job_spec())
    }

    /// Resolve a session's status: cached result first, then in-flight state.
    pub fn status(&self, session: &SessionId) -> SessionStatus {
        if let Some(entry) = self.cache.get(session) {
            return if entry.success {
                SessionStatus::Completed(entry)
            } else {
                SessionStatus::Failed {
                    description: entry.description,
                }
            };
        }

        match self.tracker.status(session) {
            Some(TrackedStatus::Processing) => SessionStatus::Processing,
            Some(TrackedStatus::Queued {
                position,
                estimated_wait,
            }) => SessionStatus::Queued {
                position,
                estimated_wait,
            },
            None => SessionStatus::Unknown,
        }
    }

    /// Look up the artifact of a finished session without consuming it.
    pub fn retrieve(&self, session: &SessionId) -> Retrieval {
        let Some(entry) = self.cache.get(session) else {
            return Retrieval::NotFound;
        };
        if !entry.success {
            return Retrieval::Failed {
                description: entry.description,
            };
        }
        match &entry.file_path {
            Some(path) if path.is_file() => Retrieval::Ready(entry),
            _ => Retrieval::FileMissing,
        }
    }

    /// Path of the `index`-th preview of a successful session.
    pub fn preview(&self, session: &SessionId, index: usize) -> Option<PathBuf> {
        let entry = self.cache.get(session).filter(|e| e.success)?;
        entry.previews.get(index).filter(|p| p.is_file()).cloned()
    }

    /// Drop a delivered result and wait until its files are deleted.
    pub async fn consume(&self, session: &SessionId) -> bool {
        let removed = self.cache.remove(session);
        self.cache.wait_for_purges().await;
        removed
    }

    /// Finished, processing and queued sessions.
    pub fn task_overview(&self) -> Vec<TaskSummary> {
        self.tracker.task_overview()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn queue_status(&self) -> QueueDepthStatus {
        self.queue.depth_status()
    }

    /// Mean processing time in minutes.
    pub fn average_processing_minutes(&self) -> f64 {
        self.tracker.average_processing_time().as_secs_f64() / 60.0
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}
