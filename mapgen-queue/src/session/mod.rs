//! Session identity, lifecycle history and the active-session tracker.

pub mod history;
pub mod identity;
pub mod tracker;

pub use history::{HistoryEntry, HistoryRing, LifecycleStatus, TaskSummary, human_readable_elapsed};
pub use identity::{Coordinates, GameCode, SessionId, derive};
pub use tracker::{DEFAULT_HISTORY_CAPACITY, SessionTracker, TrackedStatus};
