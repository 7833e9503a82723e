// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable priority job queue and scheduler for the orchestration core.
//!
//! [`scheduler::Scheduler`] owns the in-memory job table and the snapshot
//! file; it is the sole mutator of job state. Callers register
//! [`definition::JobDefinition`]s up front, then drive jobs through
//! `enqueue`/`cancel`/`wait_for_terminal` and friends.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod definition;
pub mod error;
pub mod hooks;
pub mod job;
pub mod persist;
pub mod scheduler;

pub use definition::{
    CancelConfig, CancelStrategy, Classification, DedupeConfig, DedupeMode, JobDefinition,
    JobDefinitionRegistry, JobRunner, LifecycleHooks, Progress, RetryConfig, RunContext, RunSignal,
};
pub use error::{QueueError, QueueResult};
pub use hooks::{Hooks, NullHooks, OrchestratorEvent, OrchestratorEventType};
pub use job::{Job, JobState, Priority, RunningContext};
pub use persist::QueueSnapshot;
pub use scheduler::{
    CancelOutcome, CancelStatus, EnqueueOutcome, EnqueueRequest, EnqueueStatus, QueueStats,
    Scheduler, SchedulerConfig,
};
