use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use powlax_core::NewSyncLogEntry;
use powlax_store::SyncLogStore;
use tracing::{error, warn};

/// Window used when no sync has ever completed.
pub const BOOTSTRAP_LOOKBACK_HOURS: i64 = 24;

/// Write side of the audit trail. Appends never fail the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn SyncLogStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn SyncLogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SyncLogStore> {
        &self.store
    }

    /// Start of the next sync window: the newest `sync_completed` entry, or
    /// 24 hours ago when there is none or it cannot be read.
    pub async fn last_sync_time(&self) -> DateTime<Utc> {
        let fallback = || Utc::now() - Duration::hours(BOOTSTRAP_LOOKBACK_HOURS);
        match self.store.latest_completed_at().await {
            Ok(Some(at)) => at,
            Ok(None) => fallback(),
            Err(err) => {
                warn!(error = %err, "reading last sync time failed; using bootstrap window");
                fallback()
            }
        }
    }

    pub async fn append(&self, entry: NewSyncLogEntry) {
        if let Err(err) = self.store.append(&entry).await {
            error!(
                error = %err,
                entity_type = %entry.entity_type,
                action = %entry.action,
                "audit log write failed"
            );
        }
    }
}
