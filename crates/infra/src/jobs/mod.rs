//! Durable job queue and the pipeline that drains it.
//!
//! ## Design
//!
//! - Jobs live in a [`JobStore`]; claiming is a single atomic operation, so
//!   any number of workers may poll the same store
//! - Every status change is guarded on the job being `running`
//! - Failures are classified once, at the stage boundary, and resolved into
//!   either a re-queue or a terminal error
//! - A crash is not a failure: the recovery sweep re-queues orphans without
//!   consuming an attempt
//!
//! ## Components
//!
//! - `types`: `Job`, `JobKind`, `JobStatus`, `RetryPolicy`
//! - `store` / `postgres`: in-memory and Postgres job stores
//! - `stages`: one executor per job type
//! - `retry`, `heartbeat`, `recovery`, `batch`: the control plane around a stage
//! - `worker`: the polling loop tying them together

pub mod batch;
pub mod heartbeat;
pub mod postgres;
pub mod recovery;
pub mod retry;
pub mod stages;
pub mod store;
pub mod types;
pub mod worker;

pub use batch::{BatchAggregator, BatchOutcome, BatchSummary};
pub use heartbeat::run_with_heartbeat;
pub use postgres::PgJobStore;
pub use recovery::{RECOVERY_MESSAGE, RecoveryReport, RecoverySweep};
pub use retry::{FailureResolution, RetryController};
pub use stages::{Capabilities, StageContext, StageError, StageExecutor, StageOutcome, StageRegistry};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DEFAULT_MAX_ATTEMPTS, Job, JobKind, JobStatus, JobType, MAX_ATTEMPTS_LIMIT, NewJob,
    RetryPolicy,
};
pub use worker::{JobWorker, ProcessedJob, WorkerHandle, WorkerStats, WorkerTrigger};
