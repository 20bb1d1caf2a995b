//! Row-store seams for the sync: the gamification tables it writes into and
//! the append-only audit log it owns.
//!
//! `PgStore` talks to the hosted Postgres database; `MemoryStore` keeps the
//! same tables in process for dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powlax_core::{
    EntityType, LedgerEntry, LocalRank, LocalUserId, NewSyncLogEntry, PointCurrency,
    RankProgressUpsert, SyncLogEntry, UserBadgeUpsert, WalletUpsert,
};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::{MemoryStore, MemoryTables, WalletRow};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "powlax-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("write rejected: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Collaborator tables the reconciliation writes into. Users and catalogs
/// are owned elsewhere and only read, apart from linking a local rank to
/// its CMS id.
#[async_trait]
pub trait GamificationStore: Send + Sync {
    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<LocalUserId>>;

    async fn find_currency_by_slug(&self, slug: &str) -> StoreResult<Option<PointCurrency>>;

    /// Overwrite the balance for `(user_id, currency)`, returning the balance
    /// it replaced, if any.
    async fn upsert_wallet(&self, wallet: &WalletUpsert) -> StoreResult<Option<i64>>;

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn find_badge_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>>;

    async fn upsert_user_badge(&self, badge: &UserBadgeUpsert) -> StoreResult<()>;

    async fn find_rank_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>>;

    /// Local ranks whose title contains `title`, case-insensitively.
    async fn find_ranks_by_title(&self, title: &str) -> StoreResult<Vec<LocalRank>>;

    /// Record `external_id` on a local rank that has none yet. Returns
    /// whether a row changed.
    async fn link_rank_external_id(&self, rank_id: i64, external_id: i64) -> StoreResult<bool>;

    async fn upsert_rank_progress(&self, progress: &RankProgressUpsert) -> StoreResult<()>;

    /// Flip `current_rank` off on every row for the user except `keep_rank_id`.
    async fn clear_other_current_ranks(
        &self,
        user_id: &str,
        keep_rank_id: i64,
    ) -> StoreResult<u64>;
}

/// Append-only audit trail (`gamipress_sync_log`). Reads return newest first.
#[async_trait]
pub trait SyncLogStore: Send + Sync {
    async fn append(&self, entry: &NewSyncLogEntry) -> StoreResult<()>;

    /// `synced_at` of the newest `sync_completed` row.
    async fn latest_completed_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn entries_for_local_id(&self, local_id: &str) -> StoreResult<Vec<SyncLogEntry>>;

    async fn recent_entries(
        &self,
        entity_types: &[EntityType],
        limit: i64,
    ) -> StoreResult<Vec<SyncLogEntry>>;

    async fn recent_all(&self, limit: i64) -> StoreResult<Vec<SyncLogEntry>>;
}
