//! mapgen-queue library crate.
//!
//! Task queue and session lifecycle engine placed in front of a map
//! generation library: admission, deduplication by session identity,
//! ordered execution on a worker pool and a TTL-bound result cache.

pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod queue;
pub mod service;
pub mod session;
pub mod storage;
pub mod worker;

pub use config::{DataPaths, ServiceConfig};
pub use error::{AdmissionError, Error, GenerationError, Result, ValidationError};
pub use generator::{GeneratedMap, MapGenerator, MapRequest, ProviderInfo};
pub use queue::{GenerationKind, GenerationPayload, JobSpec, QueueOrdering};
pub use service::{MapQueueService, Retrieval, SessionStatus};
pub use session::{Coordinates, GameCode, SessionId, derive};
pub use storage::StorageEntry;
