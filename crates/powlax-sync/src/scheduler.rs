use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{SyncConfig, SyncError, SyncOrchestrator, SyncRequest};

/// Cron-driven sync runs, when enabled. The caller starts the returned
/// scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: SyncOrchestrator,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_sync(SyncRequest::new()).await {
                Ok(stats) => info!(
                    users_processed = stats.users_processed,
                    errors = stats.errors,
                    "scheduled sync finished"
                ),
                Err(SyncError::AlreadyRunning { sync_id }) => {
                    warn!(%sync_id, "scheduled sync skipped; another run is in flight")
                }
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled sync registered");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use powlax_cms::FixtureChangeSource;
    use powlax_store::MemoryStore;

    use crate::SyncConfigFile;

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig::resolve(SyncConfigFile::default(), |_| None);
        let store = Arc::new(MemoryStore::new());
        let orch = SyncOrchestrator::new(
            Arc::new(FixtureChangeSource::new(Default::default())),
            store.clone(),
            store,
        );
        assert!(maybe_build_scheduler(&config, orch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_the_default_cron() {
        let mut config = SyncConfig::resolve(SyncConfigFile::default(), |_| None);
        config.scheduler_enabled = true;
        assert_eq!(config.sync_cron, crate::DEFAULT_SYNC_CRON);
        let store = Arc::new(MemoryStore::new());
        let orch = SyncOrchestrator::new(
            Arc::new(FixtureChangeSource::new(Default::default())),
            store.clone(),
            store,
        );
        assert!(maybe_build_scheduler(&config, orch).await.unwrap().is_some());
    }
}
