//! Worker pool executing generation jobs.
//!
//! Each worker loops on the queue, marks the job as processing, runs it on
//! the blocking thread pool and records the outcome through a
//! [`JobFinalizer`], which fires even if the job panics or its future is
//! dropped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GenerationError;
use crate::generator::task::existing_working_dir;
use crate::generator::{GenerationContext, GenerationOutput, MapGenerator, run_generation};
use crate::queue::{Job, JobQueue};
use crate::session::{HistoryEntry, LifecycleStatus, SessionTracker};
use crate::storage::{ResultCache, StorageEntry};

/// Description stored for successful jobs.
pub const SUCCESS_DESCRIPTION: &str = "Task completed successfully.";

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct JobRuntime {
    pub queue: Arc<JobQueue>,
    pub tracker: Arc<SessionTracker>,
    pub cache: Arc<ResultCache>,
    pub generator: Arc<dyn MapGenerator>,
    pub context: GenerationContext,
}

/// A worker pool for processing jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Jobs currently executing.
    busy: Arc<AtomicUsize>,
    /// Set by the first `start`; a pool runs at most once.
    started: AtomicBool,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    /// Create a new worker pool with custom configuration.
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            busy: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker pool.
    ///
    /// A pool starts once. Later calls, including after [`stop`](Self::stop),
    /// return `false` and spawn nothing.
    pub fn start(&self, runtime: JobRuntime) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool was already started");
            return false;
        }

        let workers = self.config.max_workers.max(1);
        info!("Starting worker pool with {} workers", workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            error!("Worker pool was already stopped");
            return false;
        };

        for i in 0..workers {
            let runtime = runtime.clone();
            let cancellation_token = self.cancellation_token.clone();
            let busy = self.busy.clone();

            join_set.spawn(async move {
                debug!("Worker {} started", i);

                loop {
                    let job = tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => {
                            debug!("Worker {} shutting down", i);
                            break;
                        }
                        job = runtime.queue.dequeue() => job,
                    };

                    busy.fetch_add(1, Ordering::SeqCst);
                    execute(job, &runtime).await;
                    busy.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
        true
    }

    /// Stop dispatching and wait for in-flight jobs to finish.
    ///
    /// Jobs still waiting in the queue are not run.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.started.store(true, Ordering::SeqCst);
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!("Worker task failed: {}", e);
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Number of jobs currently executing.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers.max(1)
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancellation_token.is_cancelled()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one dequeued job to completion.
pub async fn execute(job: Job, runtime: &JobRuntime) {
    let entry = match runtime.tracker.mark_processing(&job.session) {
        Some(entry) => entry,
        None => HistoryEntry {
            session: job.session.clone(),
            coordinates: job.payload.coordinates.rounded(),
            game_code: job.payload.game.label(),
            size: job.payload.size,
            status: LifecycleStatus::Processing,
            timestamp: chrono::Utc::now(),
        },
    };

    info!(session = %job.session, job_id = %job.id, size = job.size(), "Started processing");
    let finalizer = JobFinalizer::new(entry, runtime.clone())
        .with_attachments(owned_files(&job, &runtime.context));

    // A stale result of this identity may still be deleting the working
    // directory the job is about to write.
    runtime.cache.wait_for_purges().await;

    let generator = runtime.generator.clone();
    let context = runtime.context.clone();
    let outcome = tokio::task::spawn_blocking(move || run_generation(generator.as_ref(), &job, &context))
        .await
        .unwrap_or_else(|e| Err(join_error(e)));

    finalizer.complete(outcome);
}

/// Files a job writes outside its working directory.
fn owned_files(job: &Job, context: &GenerationContext) -> Vec<PathBuf> {
    job.payload
        .overlays
        .osm_xml
        .as_ref()
        .map(|_| context.paths.custom_osm_file(&job.session))
        .into_iter()
        .collect()
}

fn join_error(err: JoinError) -> GenerationError {
    if err.is_cancelled() {
        return GenerationError::Panicked("task was cancelled".to_string());
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    GenerationError::Panicked(message)
}

/// Records the outcome of a job exactly once.
///
/// Dropping the finalizer without [`complete`](Self::complete) records the
/// job as failed.
pub struct JobFinalizer {
    entry: HistoryEntry,
    runtime: JobRuntime,
    started: Instant,
    attachments: Vec<PathBuf>,
    outcome: Option<Result<GenerationOutput, GenerationError>>,
}

impl JobFinalizer {
    pub fn new(entry: HistoryEntry, runtime: JobRuntime) -> Self {
        Self {
            entry,
            runtime,
            started: Instant::now(),
            attachments: Vec::new(),
            outcome: None,
        }
    }

    /// Extra files deleted together with the job's result.
    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Record the outcome and finish the session.
    pub fn complete(mut self, outcome: Result<GenerationOutput, GenerationError>) {
        self.outcome = Some(outcome);
    }
}

impl Drop for JobFinalizer {
    fn drop(&mut self) {
        let session = &self.entry.session;
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(GenerationError::generator("job was interrupted before completion"))
        });

        let storage_entry = match outcome {
            Ok(output) => StorageEntry::completed(
                SUCCESS_DESCRIPTION,
                Some(output.directory),
                output.file_path,
                output.previews,
            ),
            Err(e) => {
                error!(session = %session, error = %e, "Task failed");
                StorageEntry::failed(
                    format!("Task failed with error: {}", e),
                    existing_working_dir(&self.runtime.context.paths, session),
                )
            }
        }
        .with_attachments(std::mem::take(&mut self.attachments));

        let success = storage_entry.success;
        self.runtime.cache.put(session.clone(), storage_entry);

        let elapsed = self.started.elapsed();
        self.runtime.tracker.finish(&self.entry, success, elapsed);

        info!(
            session = %session,
            success,
            elapsed_secs = elapsed.as_secs_f64(),
            "Finished processing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataPaths;
    use crate::generator::{GeneratedMap, MapRequest, ProviderInfo};
    use crate::queue::{CustomOverlays, GenerationPayload, JobQueueConfig, JobSpec};
    use crate::session::{Coordinates, GameCode};
    use crate::storage::StorageConfig;
    use serde_json::Value;
    use tempfile::TempDir;

    struct PanickingGenerator;

    impl MapGenerator for PanickingGenerator {
        fn provider(&self, code: &str) -> Option<ProviderInfo> {
            Some(ProviderInfo::new(code, false))
        }

        fn validate_provider_settings(&self, _: &ProviderInfo, _: &Value) -> Result<(), String> {
            Ok(())
        }

        fn create_map(&self, _: MapRequest) -> Result<Box<dyn GeneratedMap>, GenerationError> {
            panic!("generator exploded");
        }
    }

    fn runtime(tmp: &TempDir) -> JobRuntime {
        let queue = JobQueueConfig::default();
        JobRuntime {
            tracker: Arc::new(SessionTracker::new(queue.ordering)),
            queue: Arc::new(JobQueue::with_config(queue)),
            cache: Arc::new(ResultCache::new(StorageConfig::default())),
            generator: Arc::new(PanickingGenerator),
            context: GenerationContext {
                paths: DataPaths::under(tmp.path()),
                public_mode: false,
                public_max_map_size: 4096,
            },
        }
    }

    fn admit(runtime: &JobRuntime) -> Job {
        let payload =
            GenerationPayload::new(GameCode::Fs25, "srtm30", Coordinates::new(45.0, 20.0), 512);
        let job = Job::new(payload, JobSpec::full_map());
        let entry = HistoryEntry {
            session: job.session.clone(),
            coordinates: (45, 20),
            game_code: "FS25".to_string(),
            size: 512,
            status: LifecycleStatus::Queued,
            timestamp: chrono::Utc::now(),
        };
        runtime.tracker.admit(entry, None).unwrap();
        job
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_entry() {
        let tmp = TempDir::new().unwrap();
        let runtime = runtime(&tmp);
        let job = admit(&runtime);
        let session = job.session.clone();

        execute(job, &runtime).await;

        let entry = runtime.cache.get(&session).unwrap();
        assert!(!entry.success);
        assert!(entry.description.starts_with("Task failed with error:"));
        assert!(entry.description.contains("generator exploded"));
        assert!(!runtime.tracker.is_active(&session));
        assert_eq!(runtime.tracker.task_counts(), (0, 1));
    }

    #[tokio::test]
    async fn test_dropped_finalizer_records_failure() {
        let tmp = TempDir::new().unwrap();
        let runtime = runtime(&tmp);
        let job = admit(&runtime);
        let entry = runtime.tracker.mark_processing(&job.session).unwrap();

        drop(JobFinalizer::new(entry, runtime.clone()));

        let stored = runtime.cache.get(&job.session).unwrap();
        assert!(!stored.success);
        assert!(stored.description.contains("interrupted"));
        assert!(!runtime.tracker.is_active(&job.session));
        assert_eq!(runtime.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_start_stop() {
        let tmp = TempDir::new().unwrap();
        let runtime = runtime(&tmp);
        let pool = WorkerPool::with_config(WorkerPoolConfig { max_workers: 2 });

        assert!(!pool.is_running());
        assert!(pool.start(runtime.clone()));
        assert!(pool.is_running());
        assert!(!pool.start(runtime.clone()));

        let job = admit(&runtime);
        let session = job.session.clone();
        runtime.queue.submit(job);

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while runtime.cache.get(&session).is_none() && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(runtime.cache.get(&session).is_some());

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.busy_count(), 0);
        assert!(!pool.start(runtime));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_inline_osm_is_deleted_with_result() {
        let tmp = TempDir::new().unwrap();
        let runtime = runtime(&tmp);
        let payload = GenerationPayload::new(GameCode::Fs25, "srtm30", Coordinates::new(46.0, 21.0), 512)
            .with_overlays(CustomOverlays {
                osm_xml: Some("<osm/>".to_string()),
                ..Default::default()
            });
        let job = Job::new(payload, JobSpec::full_map());
        let session = job.session.clone();
        let osm = runtime.context.paths.custom_osm_file(&session);

        execute(job, &runtime).await;

        let entry = runtime.cache.get(&session).unwrap();
        assert_eq!(entry.attachments, vec![osm.clone()]);
        assert!(osm.is_file());

        assert!(runtime.cache.remove(&session));
        runtime.cache.wait_for_purges().await;
        assert!(!osm.exists());
    }
}
