//! Run orchestration for TillSync.
//!
//! One process hosts everything: the scheduler poll loop, dispatcher entry
//! points, a monitor task per running subprocess, the reconciler, artifact
//! ingestion, and log tailing. All coordination between those tasks goes
//! through the store; the only in-process shared state is the settings
//! cache.

pub mod command;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod health;
pub mod ingest;
pub mod logtail;
pub mod monitor;
pub mod process;
pub mod reconciler;
pub mod runlock;
pub mod scheduler;
pub mod tenants;

use std::sync::Arc;

use tillsync_store::Store;

pub use config::OrchestratorConfig;
pub use dispatcher::{dispatch_next_queued_job, DispatchOutcome};
pub use scheduler::{process_schedule_cycle, run_worker, scheduler_status, CycleStats};

/// Shared handles passed between orchestrator tasks. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    pub store: Arc<Store>,
    pub config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, config: Arc<OrchestratorConfig>) -> Self {
        Self { store, config }
    }
}
