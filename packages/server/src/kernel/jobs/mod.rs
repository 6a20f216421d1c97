//! Job infrastructure for durable background execution.
//!
//! This module provides the kernel-level job runtime:
//! - [`Job`] - the durable run row with status, progress and lease state
//! - [`JobStore`] / [`PostgresJobStore`] / [`InMemoryJobStore`] - storage
//! - [`JobRegistry`] - job type → handler mapping
//! - [`JobContext`] - per-run facade handed to handlers
//! - [`JobWorker`] / [`Reaper`] - the dispatcher loop and lease reclaim
//! - [`JobApi`] - enqueue/cancel/resume/restart/read contract
//! - [`DagCoordinator`] - parent-gated children and cascade cancel
//!
//! # Architecture
//!
//! ```text
//! JobApi.enqueue(request)
//!     └─► jobs row (queued) ── job.queued ─► bus ─► hubs
//!
//! JobWorker
//!     ├─► JobStore.claim_one (skip-locked)
//!     ├─► Handler.run(JobContext)
//!     │       └─► Progress / Pause / Succeed / Fail ─► bus ─► hubs
//!     └─► settle: implicit success, retry with backoff, terminal fail
//! ```
//!
//! Business logic stays in domain handlers; this module only provides the
//! infrastructure.

pub mod api;
pub mod backoff;
pub mod context;
pub mod dag;
pub mod error;
pub mod events;
mod job;
pub mod lifecycle;
mod memory;
pub mod notifier;
mod record;
pub mod registry;
mod store;
mod worker;

pub use api::{EnqueueRequest, EnqueueResult, JobApi, JobApiError};
pub use backoff::backoff;
pub use context::JobContext;
pub use dag::DagCoordinator;
pub use error::{classify_error, JobError};
pub use events::JobEvent;
pub use job::{ErrorKind, Job, JobStatus};
pub use lifecycle::JobLifecycle;
pub use memory::InMemoryJobStore;
pub use notifier::JobNotifier;
pub use record::Record;
pub use registry::{JobHandler, JobRegistry, SharedJobRegistry};
pub use store::{JobFilter, JobPatch, JobStore, PostgresJobStore, StoreError};
pub use worker::{JobWorker, Reaper, RunningJobs};
