use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powlax_core::{
    EntityType, LedgerEntry, LocalRank, LocalUserId, NewSyncLogEntry, PointCurrency,
    RankProgressUpsert, SyncAction, SyncLogEntry, UserBadgeUpsert, WalletUpsert,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{GamificationStore, StoreResult, SyncLogStore};

/// Postgres-backed store over the app's gamification tables.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

/// Escape `%`, `_` and `\` so a title is matched literally inside `ILIKE`.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn log_entry_from_row(row: &PgRow) -> Result<SyncLogEntry, sqlx::Error> {
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        external_id: row.try_get("wordpress_id")?,
        local_id: row.try_get("supabase_id")?,
        action: row.try_get("action_type")?,
        payload: row.try_get("sync_data")?,
        error_message: row.try_get("error_message")?,
        synced_at: row.try_get("synced_at")?,
    })
}

const LOG_COLUMNS: &str = "id, entity_type, wordpress_id, supabase_id, action_type, \
                           COALESCE(sync_data, '{}'::jsonb) AS sync_data, error_message, synced_at";

#[async_trait]
impl GamificationStore for PgStore {
    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<LocalUserId>> {
        let row = sqlx::query("SELECT id::text AS id FROM users WHERE wordpress_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn find_currency_by_slug(&self, slug: &str) -> StoreResult<Option<PointCurrency>> {
        let row = sqlx::query(
            r#"
            SELECT currency, slug
              FROM powlax_points_currencies
             WHERE slug = $1
             LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(PointCurrency {
            currency: row.try_get("currency")?,
            slug: row.try_get("slug")?,
        }))
    }

    async fn upsert_wallet(&self, wallet: &WalletUpsert) -> StoreResult<Option<i64>> {
        // The CTE reads the pre-statement snapshot, so it sees the old balance.
        let row = sqlx::query(
            r#"
            WITH previous AS (
                SELECT balance
                  FROM user_points_wallets
                 WHERE user_id = $1::uuid
                   AND currency = $2
            )
            INSERT INTO user_points_wallets (user_id, currency, balance, updated_at)
            VALUES ($1::uuid, $2, $3, $4)
            ON CONFLICT (user_id, currency)
            DO UPDATE SET balance = EXCLUDED.balance,
                          updated_at = EXCLUDED.updated_at
            RETURNING (SELECT balance FROM previous) AS previous_balance
            "#,
        )
        .bind(&wallet.user_id)
        .bind(&wallet.currency)
        .bind(wallet.balance)
        .bind(wallet.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("previous_balance")?)
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_points_ledger
                (user_id, currency, amount, transaction_type, description, metadata)
            VALUES ($1::uuid, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.user_id)
        .bind(&entry.currency)
        .bind(entry.amount)
        .bind(&entry.transaction_type)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_badge_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>> {
        let row = sqlx::query("SELECT id FROM badges WHERE wordpress_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn upsert_user_badge(&self, badge: &UserBadgeUpsert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_badges (user_id, badge_id, earned_at, progress, metadata)
            VALUES ($1::uuid, $2, COALESCE($3::timestamptz, NOW()), $4, $5)
            ON CONFLICT (user_id, badge_id)
            DO UPDATE SET earned_at = COALESCE($3::timestamptz, user_badges.earned_at),
                          progress = EXCLUDED.progress,
                          metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&badge.user_id)
        .bind(badge.badge_id)
        .bind(badge.earned_at)
        .bind(badge.progress)
        .bind(&badge.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_rank_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>> {
        let row = sqlx::query("SELECT id FROM player_ranks WHERE wordpress_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn find_ranks_by_title(&self, title: &str) -> StoreResult<Vec<LocalRank>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, wordpress_id
              FROM player_ranks
             WHERE title ILIKE $1 ESCAPE '\'
             ORDER BY id
            "#,
        )
        .bind(format!("%{}%", escape_like(title)))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LocalRank {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                external_id: row.try_get("wordpress_id")?,
            });
        }
        Ok(out)
    }

    async fn link_rank_external_id(&self, rank_id: i64, external_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE player_ranks
               SET wordpress_id = $2
             WHERE id = $1
               AND wordpress_id IS NULL
            "#,
        )
        .bind(rank_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_rank_progress(&self, progress: &RankProgressUpsert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_rank_progress (user_id, rank_id, achieved_at, current_rank, metadata)
            VALUES ($1::uuid, $2, COALESCE($3::timestamptz, NOW()), $4, $5)
            ON CONFLICT (user_id, rank_id)
            DO UPDATE SET achieved_at = COALESCE($3::timestamptz, user_rank_progress.achieved_at),
                          current_rank = EXCLUDED.current_rank,
                          metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&progress.user_id)
        .bind(progress.rank_id)
        .bind(progress.achieved_at)
        .bind(progress.current_rank)
        .bind(&progress.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_other_current_ranks(
        &self,
        user_id: &str,
        keep_rank_id: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_rank_progress
               SET current_rank = false
             WHERE user_id = $1::uuid
               AND rank_id <> $2
               AND current_rank
            "#,
        )
        .bind(user_id)
        .bind(keep_rank_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SyncLogStore for PgStore {
    async fn append(&self, entry: &NewSyncLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gamipress_sync_log
                (entity_type, wordpress_id, supabase_id, action_type, sync_data, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.entity_type.as_str())
        .bind(entry.external_id)
        .bind(&entry.local_id)
        .bind(entry.action.as_str())
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_completed_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT synced_at
              FROM gamipress_sync_log
             WHERE action_type = $1
             ORDER BY synced_at DESC
             LIMIT 1
            "#,
        )
        .bind(SyncAction::SyncCompleted.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("synced_at")).transpose()?)
    }

    async fn entries_for_local_id(&self, local_id: &str) -> StoreResult<Vec<SyncLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM gamipress_sync_log \
             WHERE supabase_id = $1 ORDER BY synced_at DESC, id DESC"
        ))
        .bind(local_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(log_entry_from_row).collect::<Result<_, _>>()?)
    }

    async fn recent_entries(
        &self,
        entity_types: &[EntityType],
        limit: i64,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        let types = entity_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect::<Vec<_>>();
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM gamipress_sync_log \
             WHERE entity_type = ANY($1) ORDER BY synced_at DESC, id DESC LIMIT $2"
        ))
        .bind(types)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(log_entry_from_row).collect::<Result<_, _>>()?)
    }

    async fn recent_all(&self, limit: i64) -> StoreResult<Vec<SyncLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM gamipress_sync_log \
             ORDER BY synced_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(log_entry_from_row).collect::<Result<_, _>>()?)
    }
}
