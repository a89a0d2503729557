//! # Orchestration engine
//!
//! Drives software-delivery workflows through their stage pipeline over a
//! durable message bus.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowService                          │
//! │  (create/cancel, task dispatch, result ingestion, sweeper)  │
//! └─────────────────────────────────────────────────────────────┘
//!          │ STAGE_COMPLETE / WORKFLOW_CREATED (in-process)
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   StateMachineService                        │
//! │  (sole writer of current_stage/status, decision gates)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │ dispatch next stage
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              MessageBus / KvStore / WorkflowStore            │
//! │  (pub/sub + streams, locks + dedup markers, Postgres rows)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is written against the ports in `conductor-bus` and
//! `conductor-storage`; tests run it over the in-memory adapters.

pub mod config;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod lock;
pub mod retry;
pub mod service;
pub mod state_machine;
pub mod sweeper;

pub use config::{ConfigError, LogFormat, OrchestratorConfig};
pub use error::ServiceError;
pub use events::{EventBus, OrchestratorEvent};
pub use idempotency::DedupGuard;
pub use lock::{LockError, LockGuard, LockManager};
pub use retry::RetryPolicy;
pub use service::{CreateWorkflowRequest, WorkflowService, RESULTS_GROUP, RESULTS_TOPIC};
pub use state_machine::{plan_transition, StateMachineService, Transition};
pub use sweeper::TaskSweeper;
