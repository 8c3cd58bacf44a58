//! Job model and the queue jobs wait in until a worker takes them.

pub mod job;
pub mod job_queue;

pub use job::{
    CustomOverlays, GenerationKind, GenerationPayload, Job, JobSpec, SettingsBlock,
    SettingsBundle,
};
pub use job_queue::{JobQueue, JobQueueConfig, QueueDepthStatus, QueueKey, QueueOrdering};
