// Call Relay Worker
//
// The monitor process: one polling loop tracking feed rows, and a bounded
// pool retrieving and relaying each completed call's recording.
//
// Key design decisions:
// - The polling loop is the only owner of the Event map
// - Row ids are claimed before a worker is spawned; one worker per row id
// - Workers download with cookies snapshotted at hand-off and only touch the
//   browser for in-session capture, one short lock at a time
// - Retrieval is bounded by both an attempt ceiling and a wall-clock budget

pub mod monitor;
pub mod pool;
pub mod refresh;
pub mod reliability;
pub mod retriever;
pub mod tracker;

pub use monitor::{Monitor, StopReason};
pub use pool::{Coordinator, HandOff, RetrievalContext, SubmitError, WorkerOutcome, WorkerPoolError};
pub use refresh::RefreshScheduler;
pub use reliability::{BudgetExceeded, RetryBudget, RetryPolicy};
pub use retriever::{
    Acquired, AcquisitionStrategy, ArtifactRetriever, DirectFetch, InSessionCapture,
    RetrievalRequest,
};
pub use tracker::{LifecycleTracker, Observation};
