use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use powlax_cms::{ChangeSource, GamiPressClient};
use powlax_core::{EntityType, NewSyncLogEntry, SyncAction, SyncStats};
use powlax_store::{GamificationStore, PgStore, SyncLogStore};
use serde_json::json;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::{AuditLog, ReconciliationEngine, SyncConfig, SyncError, SyncGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub sync_id: Uuid,
    pub user_ids: Option<Vec<i64>>,
    /// Ignore the last completed sync and ask for everything.
    pub force_full_sync: bool,
}

impl SyncRequest {
    pub fn new() -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            user_ids: None,
            force_full_sync: false,
        }
    }

    pub fn with_user_ids(mut self, user_ids: Option<Vec<i64>>) -> Self {
        self.user_ids = user_ids.filter(|ids| !ids.is_empty());
        self
    }

    pub fn full(mut self, force_full_sync: bool) -> Self {
        self.force_full_sync = force_full_sync;
        self
    }
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one sync end to end: window, fetch, reconcile, audit.
#[derive(Clone)]
pub struct SyncOrchestrator {
    source: Arc<dyn ChangeSource>,
    engine: ReconciliationEngine,
    audit: AuditLog,
    guard: SyncGuard,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        store: Arc<dyn GamificationStore>,
        log: Arc<dyn SyncLogStore>,
    ) -> Self {
        let audit = AuditLog::new(log);
        Self {
            source,
            engine: ReconciliationEngine::new(store, audit.clone()),
            audit,
            guard: SyncGuard::new(),
        }
    }

    /// Postgres-backed orchestrator. `source` replaces the live CMS client
    /// when given.
    pub async fn connect(
        config: &SyncConfig,
        source: Option<Arc<dyn ChangeSource>>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?,
        );
        let source: Arc<dyn ChangeSource> = match source {
            Some(source) => source,
            None => Arc::new(
                GamiPressClient::new(config.cms.clone()).context("building cms client")?,
            ),
        };
        Ok(Self::new(source, store.clone(), store))
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    pub fn source_name(&self) -> &str {
        self.source.source_name()
    }

    pub async fn run_sync(&self, request: SyncRequest) -> Result<SyncStats, SyncError> {
        let permit = self.guard.try_begin(request.sync_id)?;
        let span = info_span!("sync_run", sync_id = %request.sync_id, source = self.source.source_name());

        async {
            let mut stats = SyncStats::new(Utc::now());
            let since = if request.force_full_sync {
                DateTime::<Utc>::UNIX_EPOCH
            } else {
                self.audit.last_sync_time().await
            };
            info!(
                since = %since,
                users = ?request.user_ids,
                full = request.force_full_sync,
                "sync started"
            );

            let payload = match self
                .source
                .fetch_changes_since(since, request.user_ids.as_deref())
                .await
            {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "sync aborted: cms fetch failed");
                    self.audit
                        .append(
                            NewSyncLogEntry::new(
                                EntityType::SyncSession,
                                0,
                                request.sync_id.to_string(),
                                SyncAction::Failed,
                                json!({ "error": err.to_string(), "stats": stats }),
                            )
                            .with_error(err.to_string()),
                        )
                        .await;
                    return Err(SyncError::Fetch(err));
                }
            };
            info!(users = payload.users.len(), "cms payload fetched");

            self.engine
                .reconcile(&payload, &mut stats, permit.cancel_flag())
                .await;

            permit.completing();
            stats.finish(Utc::now());
            let duration_ms = stats.duration_ms().unwrap_or_default();
            // Only a finished run may advance the next sync window.
            let action = if stats.cancelled {
                SyncAction::Failed
            } else {
                SyncAction::SyncCompleted
            };
            let mut entry = NewSyncLogEntry::new(
                EntityType::SyncSession,
                0,
                request.sync_id.to_string(),
                action,
                json!({
                    "stats": stats,
                    "since": since,
                    "user_ids": request.user_ids,
                    "force_full_sync": request.force_full_sync,
                    "cancelled": stats.cancelled,
                    "duration_ms": duration_ms,
                    "duration_readable": format!("{}s", (duration_ms as f64 / 1000.0).round()),
                }),
            );
            if stats.cancelled {
                entry = entry.with_error("sync cancelled before all users were processed");
            }
            self.audit.append(entry).await;
            info!(
                users_processed = stats.users_processed,
                points_synced = stats.points_synced,
                badges_synced = stats.badges_synced,
                ranks_synced = stats.ranks_synced,
                errors = stats.errors,
                cancelled = stats.cancelled,
                duration_ms,
                "sync finished"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    /// Flag the in-flight run for cancellation if `sync_id` names it.
    pub fn request_cancel(&self, sync_id: &str) -> bool {
        self.guard.request_cancel(sync_id)
    }
}
