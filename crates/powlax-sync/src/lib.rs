//! Sync pipeline: pull a GamiPress delta from the CMS, reconcile it into the
//! app's gamification tables, and record every step in the audit log.

use powlax_cms::FetchError;
use thiserror::Error;
use uuid::Uuid;

mod audit;
mod config;
mod engine;
mod guard;
mod orchestrator;
mod scheduler;

pub use audit::{AuditLog, BOOTSTRAP_LOOKBACK_HOURS};
pub use config::{SyncConfig, SyncConfigFile, CONFIG_PATH_ENV, DEFAULT_SYNC_CRON};
pub use engine::ReconciliationEngine;
pub use guard::{CancelFlag, RunPhase, SyncGuard, SyncPermit};
pub use orchestrator::{SyncOrchestrator, SyncRequest};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "powlax-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching changes from the cms failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("a sync is already running (sync_id {sync_id})")]
    AlreadyRunning { sync_id: Uuid },
    #[error("invalid sync configuration: {0}")]
    Config(String),
}
