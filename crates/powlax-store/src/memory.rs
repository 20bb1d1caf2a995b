use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powlax_core::{
    EntityType, LedgerEntry, LocalRank, LocalUserId, NewSyncLogEntry, PointCurrency,
    RankProgressUpsert, SyncAction, SyncLogEntry, UserBadgeUpsert, WalletUpsert,
};
use tokio::sync::Mutex;

use crate::{GamificationStore, StoreError, StoreResult, SyncLogStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRow {
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of every table the in-memory store keeps.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    /// CMS user id -> local user id.
    pub users: BTreeMap<i64, LocalUserId>,
    pub currencies: Vec<PointCurrency>,
    /// CMS badge id -> local badge id.
    pub badges: BTreeMap<i64, i64>,
    pub ranks: Vec<LocalRank>,
    pub wallets: BTreeMap<(LocalUserId, String), WalletRow>,
    pub ledger: Vec<LedgerEntry>,
    pub user_badges: BTreeMap<(LocalUserId, i64), UserBadgeUpsert>,
    pub rank_progress: BTreeMap<(LocalUserId, i64), RankProgressUpsert>,
    pub sync_log: Vec<SyncLogEntry>,
    rejected_users: BTreeSet<LocalUserId>,
    reject_audit_writes: bool,
}

impl MemoryTables {
    pub fn current_ranks_for(&self, user_id: &str) -> Vec<i64> {
        self.rank_progress
            .values()
            .filter(|row| row.user_id == user_id && row.current_rank)
            .map(|row| row.rank_id)
            .collect()
    }

    fn check_writable(&self, user_id: &str) -> StoreResult<()> {
        if self.rejected_users.contains(user_id) {
            return Err(StoreError::Rejected(format!("writes for user {user_id}")));
        }
        Ok(())
    }
}

/// In-process stand-in for the Postgres tables, seeded through the
/// `with_*` builders.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, external_id: i64, local_id: impl Into<String>) -> Self {
        self.tables.get_mut().users.insert(external_id, local_id.into());
        self
    }

    pub fn with_currency(mut self, slug: impl Into<String>, currency: impl Into<String>) -> Self {
        self.tables.get_mut().currencies.push(PointCurrency {
            currency: currency.into(),
            slug: slug.into(),
        });
        self
    }

    pub fn with_badge(mut self, external_id: i64, local_id: i64) -> Self {
        self.tables.get_mut().badges.insert(external_id, local_id);
        self
    }

    pub fn with_rank(mut self, id: i64, title: impl Into<String>, external_id: Option<i64>) -> Self {
        self.tables.get_mut().ranks.push(LocalRank {
            id,
            title: title.into(),
            external_id,
        });
        self
    }

    /// Every wallet/ledger/badge/rank write for this user fails.
    pub fn rejecting_writes_for(mut self, user_id: impl Into<String>) -> Self {
        self.tables.get_mut().rejected_users.insert(user_id.into());
        self
    }

    pub async fn set_reject_audit_writes(&self, reject: bool) {
        self.tables.lock().await.reject_audit_writes = reject;
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl GamificationStore for MemoryStore {
    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<LocalUserId>> {
        Ok(self.tables.lock().await.users.get(&external_id).cloned())
    }

    async fn find_currency_by_slug(&self, slug: &str) -> StoreResult<Option<PointCurrency>> {
        let tables = self.tables.lock().await;
        Ok(tables.currencies.iter().find(|c| c.slug == slug).cloned())
    }

    async fn upsert_wallet(&self, wallet: &WalletUpsert) -> StoreResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        tables.check_writable(&wallet.user_id)?;
        let previous = tables.wallets.insert(
            (wallet.user_id.clone(), wallet.currency.clone()),
            WalletRow {
                balance: wallet.balance,
                updated_at: wallet.updated_at,
            },
        );
        Ok(previous.map(|row| row.balance))
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.check_writable(&entry.user_id)?;
        tables.ledger.push(entry.clone());
        Ok(())
    }

    async fn find_badge_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>> {
        Ok(self.tables.lock().await.badges.get(&external_id).copied())
    }

    async fn upsert_user_badge(&self, badge: &UserBadgeUpsert) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.check_writable(&badge.user_id)?;
        let key = (badge.user_id.clone(), badge.badge_id);
        let earned_at = badge
            .earned_at
            .or_else(|| tables.user_badges.get(&key).and_then(|row| row.earned_at))
            .unwrap_or_else(Utc::now);
        tables.user_badges.insert(
            key,
            UserBadgeUpsert {
                earned_at: Some(earned_at),
                ..badge.clone()
            },
        );
        Ok(())
    }

    async fn find_rank_by_external_id(&self, external_id: i64) -> StoreResult<Option<i64>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ranks
            .iter()
            .find(|r| r.external_id == Some(external_id))
            .map(|r| r.id))
    }

    async fn find_ranks_by_title(&self, title: &str) -> StoreResult<Vec<LocalRank>> {
        let needle = title.to_lowercase();
        let tables = self.tables.lock().await;
        let mut matches = tables
            .ranks
            .iter()
            .filter(|r| r.title.to_lowercase().contains(&needle))
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by_key(|r| r.id);
        Ok(matches)
    }

    async fn link_rank_external_id(&self, rank_id: i64, external_id: i64) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables
            .ranks
            .iter_mut()
            .find(|r| r.id == rank_id && r.external_id.is_none())
        {
            Some(rank) => {
                rank.external_id = Some(external_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_rank_progress(&self, progress: &RankProgressUpsert) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.check_writable(&progress.user_id)?;
        let key = (progress.user_id.clone(), progress.rank_id);
        let achieved_at = progress
            .achieved_at
            .or_else(|| tables.rank_progress.get(&key).and_then(|row| row.achieved_at))
            .unwrap_or_else(Utc::now);
        tables.rank_progress.insert(
            key,
            RankProgressUpsert {
                achieved_at: Some(achieved_at),
                ..progress.clone()
            },
        );
        Ok(())
    }

    async fn clear_other_current_ranks(
        &self,
        user_id: &str,
        keep_rank_id: i64,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        tables.check_writable(user_id)?;
        let mut cleared = 0;
        for row in tables.rank_progress.values_mut() {
            if row.user_id == user_id && row.rank_id != keep_rank_id && row.current_rank {
                row.current_rank = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn append(&self, entry: &NewSyncLogEntry) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.reject_audit_writes {
            return Err(StoreError::Rejected("audit log writes".into()));
        }
        let id = tables.sync_log.len() as i64 + 1;
        tables.sync_log.push(SyncLogEntry {
            id,
            entity_type: entry.entity_type.to_string(),
            external_id: entry.external_id,
            local_id: entry.local_id.clone(),
            action: entry.action.to_string(),
            payload: entry.payload.clone(),
            error_message: entry.error_message.clone(),
            synced_at: Utc::now(),
        });
        Ok(())
    }

    async fn latest_completed_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().await;
        Ok(newest_first(&tables.sync_log)
            .into_iter()
            .find(|e| e.action == SyncAction::SyncCompleted.as_str())
            .map(|e| e.synced_at))
    }

    async fn entries_for_local_id(&self, local_id: &str) -> StoreResult<Vec<SyncLogEntry>> {
        let tables = self.tables.lock().await;
        Ok(newest_first(&tables.sync_log)
            .into_iter()
            .filter(|e| e.local_id == local_id)
            .collect())
    }

    async fn recent_entries(
        &self,
        entity_types: &[EntityType],
        limit: i64,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        let tables = self.tables.lock().await;
        Ok(newest_first(&tables.sync_log)
            .into_iter()
            .filter(|e| entity_types.iter().any(|t| t.as_str() == e.entity_type))
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn recent_all(&self, limit: i64) -> StoreResult<Vec<SyncLogEntry>> {
        let tables = self.tables.lock().await;
        Ok(newest_first(&tables.sync_log)
            .into_iter()
            .take(limit.max(0) as usize)
            .collect())
    }
}

fn newest_first(log: &[SyncLogEntry]) -> Vec<SyncLogEntry> {
    let mut rows = log.to_vec();
    rows.sort_by(|a, b| b.synced_at.cmp(&a.synced_at).then(b.id.cmp(&a.id)));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wallet(balance: i64) -> WalletUpsert {
        WalletUpsert {
            user_id: "u-1".into(),
            currency: "lax_credits".into(),
            balance,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn wallet_upsert_overwrites_and_reports_previous_balance() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert_wallet(&wallet(50)).await.unwrap(), None);
        assert_eq!(store.upsert_wallet(&wallet(80)).await.unwrap(), Some(50));

        let tables = store.snapshot().await;
        assert_eq!(tables.wallets.len(), 1);
        assert_eq!(tables.wallets[&("u-1".to_string(), "lax_credits".to_string())].balance, 80);
    }

    #[tokio::test]
    async fn undated_badge_upsert_keeps_the_stored_date() {
        let store = MemoryStore::new();
        let earned = Utc::now() - chrono::Duration::days(30);
        let badge = |earned_at| UserBadgeUpsert {
            user_id: "u-1".into(),
            badge_id: 700,
            earned_at,
            progress: 100,
            metadata: json!({}),
        };

        store.upsert_user_badge(&badge(Some(earned))).await.unwrap();
        store.upsert_user_badge(&badge(None)).await.unwrap();
        let tables = store.snapshot().await;
        assert_eq!(tables.user_badges[&("u-1".to_string(), 700)].earned_at, Some(earned));

        let fresh = MemoryStore::new();
        fresh.upsert_user_badge(&badge(None)).await.unwrap();
        assert!(fresh.snapshot().await.user_badges[&("u-1".to_string(), 700)]
            .earned_at
            .is_some());
    }

    #[tokio::test]
    async fn title_lookup_is_case_insensitive_substring() {
        let store = MemoryStore::new()
            .with_rank(1, "Lacrosse Bot", None)
            .with_rank(2, "Lax Leader", None)
            .with_rank(3, "Lax Leader Elite", None);

        let hits = store.find_ranks_by_title("lax leader").await.unwrap();
        assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.find_ranks_by_title("goalie").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn linking_only_fills_unlinked_ranks() {
        let store = MemoryStore::new()
            .with_rank(1, "Lax Leader", None)
            .with_rank(2, "Flow Bro", Some(77));

        assert!(store.link_rank_external_id(1, 90).await.unwrap());
        assert!(!store.link_rank_external_id(2, 91).await.unwrap());
        assert_eq!(store.find_rank_by_external_id(90).await.unwrap(), Some(1));
        assert_eq!(store.find_rank_by_external_id(77).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn rejected_user_writes_fail() {
        let store = MemoryStore::new().rejecting_writes_for("u-1");
        let err = store.upsert_wallet(&wallet(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn audit_reads_are_newest_first_and_filtered() {
        let store = MemoryStore::new();
        for (entity, action) in [
            (EntityType::SyncSession, SyncAction::SyncCompleted),
            (EntityType::UserPoints, SyncAction::Updated),
            (EntityType::SyncApiRequest, SyncAction::Created),
        ] {
            store
                .append(&NewSyncLogEntry::new(entity, 0, "run-1", action, json!({})))
                .await
                .unwrap();
        }

        let recent = store
            .recent_entries(&[EntityType::SyncSession, EntityType::SyncApiRequest], 10)
            .await
            .unwrap();
        assert_eq!(
            recent.iter().map(|e| e.entity_type.as_str()).collect::<Vec<_>>(),
            vec!["sync_api_request", "sync_session"]
        );
        assert_eq!(store.recent_all(2).await.unwrap().len(), 2);
        assert!(store.latest_completed_at().await.unwrap().is_some());
        assert_eq!(store.entries_for_local_id("run-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn audit_writes_can_be_rejected() {
        let store = MemoryStore::new();
        store.set_reject_audit_writes(true).await;
        let entry = NewSyncLogEntry::new(
            EntityType::SyncSession,
            0,
            "system",
            SyncAction::Failed,
            json!({}),
        );
        assert!(store.append(&entry).await.is_err());
        assert!(store.snapshot().await.sync_log.is_empty());
    }
}
