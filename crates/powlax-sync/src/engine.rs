use std::sync::Arc;

use chrono::{DateTime, Utc};
use powlax_core::{
    parse_cms_timestamp, EarnedBadge, EarnedRank, EntityType, ExternalRank, ExternalSyncPayload,
    ExternalUser, ItemFailure, LedgerEntry, LocalRank, LocalUserId, NewSyncLogEntry,
    RankProgressUpsert, SyncAction, SyncCategory, SyncStats, UserBadgeUpsert, WalletUpsert,
    SYNC_UPDATE_TRANSACTION,
};
use powlax_store::{GamificationStore, StoreError};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{AuditLog, CancelFlag};

#[derive(Debug, Error)]
enum ItemError {
    #[error("no local currency for point type {0:?}")]
    UnknownCurrency(String),
    #[error("no local badge for cms badge {0}")]
    UnknownBadge(i64),
    #[error("rank {title:?} matched {matches} local ranks")]
    UnresolvedRank { title: String, matches: usize },
    #[error("rank {title:?} matched local rank {local_rank}, already linked to cms rank {linked_to}")]
    RankLinkedElsewhere {
        title: String,
        local_rank: i64,
        linked_to: i64,
    },
    #[error("unparseable earned_date {0:?}")]
    BadTimestamp(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ItemError {
    fn is_unmapped(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

struct ResolvedUser<'p> {
    user: &'p ExternalUser,
    local_id: LocalUserId,
}

/// Projects one CMS payload onto the local gamification tables.
///
/// Every write is keyed so that replaying the same payload converges on the
/// same rows. Failures are isolated to the item they happen on.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn GamificationStore>,
    audit: AuditLog,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn GamificationStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Catalog linking, then the points, badges and ranks passes, in order.
    pub async fn reconcile(
        &self,
        payload: &ExternalSyncPayload,
        stats: &mut SyncStats,
        cancel: &CancelFlag,
    ) {
        self.link_rank_catalog(&payload.ranks, stats).await;

        let users = self.resolve_users(&payload.users, stats, cancel).await;
        if stats.cancelled {
            return;
        }
        debug!(resolved = users.len(), total = payload.users.len(), "users resolved");

        self.sync_points(&users, stats, cancel).await;
        if stats.cancelled {
            return;
        }
        self.sync_badges(&users, stats, cancel).await;
        if stats.cancelled {
            return;
        }
        self.sync_ranks(&users, stats, cancel).await;
    }

    /// Record the CMS id on every local rank that matches a catalog rank
    /// unambiguously.
    pub async fn link_rank_catalog(&self, ranks: &[ExternalRank], stats: &mut SyncStats) {
        for rank in ranks {
            match self.link_catalog_rank(rank).await {
                Ok(Some(local)) => {
                    stats.ranks_linked += 1;
                    info!(cms_rank = rank.id, local_rank = local.id, title = %local.title, "rank linked");
                    self.audit
                        .append(NewSyncLogEntry::new(
                            EntityType::RankCatalog,
                            rank.id,
                            local.id.to_string(),
                            SyncAction::Updated,
                            json!({
                                "cms_title": rank.title,
                                "cms_slug": rank.slug,
                                "local_title": local.title,
                            }),
                        ))
                        .await;
                }
                Ok(None) => {}
                Err(err) if err.is_unmapped() => {
                    warn!(cms_rank = rank.id, error = %err, "rank left unlinked");
                }
                Err(err) => {
                    error!(cms_rank = rank.id, error = %err, "rank linking failed");
                    stats.errors += 1;
                }
            }
        }
    }

    async fn link_catalog_rank(&self, rank: &ExternalRank) -> Result<Option<LocalRank>, ItemError> {
        if self.store.find_rank_by_external_id(rank.id).await?.is_some() {
            return Ok(None);
        }
        let local = self.match_rank_title(rank.id, &rank.title).await?;
        if self.store.link_rank_external_id(local.id, rank.id).await? {
            Ok(Some(local))
        } else {
            Ok(None)
        }
    }

    /// Title fallback for a CMS rank with no linked local rank. Linked ranks
    /// stay in the candidate set so they can block a looser match; a winner
    /// linked to another CMS rank is not used.
    async fn match_rank_title(&self, cms_rank_id: i64, title: &str) -> Result<LocalRank, ItemError> {
        let title = title.trim();
        let candidates = if title.is_empty() {
            Vec::new()
        } else {
            self.store.find_ranks_by_title(title).await?
        };
        let local = single_rank_match(title, &candidates).ok_or_else(|| ItemError::UnresolvedRank {
            title: title.to_string(),
            matches: candidates.len(),
        })?;
        match local.external_id {
            Some(linked_to) if linked_to != cms_rank_id => Err(ItemError::RankLinkedElsewhere {
                title: title.to_string(),
                local_rank: local.id,
                linked_to,
            }),
            _ => Ok(local.clone()),
        }
    }

    async fn resolve_users<'p>(
        &self,
        users: &'p [ExternalUser],
        stats: &mut SyncStats,
        cancel: &CancelFlag,
    ) -> Vec<ResolvedUser<'p>> {
        let mut resolved = Vec::with_capacity(users.len());
        for user in users {
            if stop_requested(cancel, stats) {
                break;
            }
            match self.store.find_user_by_external_id(user.id).await {
                Ok(Some(local_id)) => resolved.push(ResolvedUser { user, local_id }),
                Ok(None) => {
                    warn!(cms_user = user.id, "no local user for cms user");
                    stats.skipped_users += 1;
                }
                Err(err) => {
                    error!(cms_user = user.id, error = %err, "resolving local user failed");
                    stats.errors += 1;
                }
            }
        }
        resolved
    }

    async fn sync_points(&self, users: &[ResolvedUser<'_>], stats: &mut SyncStats, cancel: &CancelFlag) {
        for ResolvedUser { user, local_id } in users {
            if stop_requested(cancel, stats) {
                return;
            }
            for (slug, &balance) in &user.points {
                if balance <= 0 {
                    continue;
                }
                match self.sync_balance(local_id, user.id, slug, balance).await {
                    Ok(()) => stats.points_synced += 1,
                    Err(err) => item_failed(stats, SyncCategory::Points, user.id, slug.clone(), err),
                }
            }

            self.audit
                .append(NewSyncLogEntry::new(
                    EntityType::UserPoints,
                    user.id,
                    local_id.clone(),
                    SyncAction::Updated,
                    json!({
                        "point_types": user.points.len(),
                        "total_points": user.points.values().fold(0i64, |sum, &p| sum.saturating_add(p)),
                    }),
                ))
                .await;
            stats.users_processed += 1;
        }
    }

    async fn sync_balance(
        &self,
        user_id: &str,
        cms_user_id: i64,
        slug: &str,
        balance: i64,
    ) -> Result<(), ItemError> {
        let currency = self
            .store
            .find_currency_by_slug(slug)
            .await?
            .ok_or_else(|| ItemError::UnknownCurrency(slug.to_string()))?;

        let now = Utc::now();
        let previous = self
            .store
            .upsert_wallet(&WalletUpsert {
                user_id: user_id.to_string(),
                currency: currency.currency.clone(),
                balance,
                updated_at: now,
            })
            .await?;

        self.store
            .insert_ledger_entry(&LedgerEntry {
                user_id: user_id.to_string(),
                currency: currency.currency,
                amount: balance,
                transaction_type: SYNC_UPDATE_TRANSACTION.to_string(),
                description: format!("WordPress sync - {slug}"),
                metadata: json!({
                    "wordpress_sync": true,
                    "wordpress_user_id": cms_user_id,
                    "point_type": slug,
                    "sync_timestamp": now.to_rfc3339(),
                    "previous_balance": previous,
                    "delta": balance.saturating_sub(previous.unwrap_or(0)),
                }),
            })
            .await?;
        Ok(())
    }

    async fn sync_badges(&self, users: &[ResolvedUser<'_>], stats: &mut SyncStats, cancel: &CancelFlag) {
        for ResolvedUser { user, local_id } in users {
            if stop_requested(cancel, stats) {
                return;
            }
            if user.badges.is_empty() {
                continue;
            }
            for badge in &user.badges {
                match self.sync_badge(local_id, badge).await {
                    Ok(()) => stats.badges_synced += 1,
                    Err(err) => {
                        item_failed(stats, SyncCategory::Badges, user.id, badge.id.to_string(), err)
                    }
                }
            }
            self.audit
                .append(NewSyncLogEntry::new(
                    EntityType::UserBadges,
                    user.id,
                    local_id.clone(),
                    SyncAction::Updated,
                    json!({ "badges_count": user.badges.len() }),
                ))
                .await;
        }
    }

    async fn sync_badge(&self, user_id: &str, badge: &EarnedBadge) -> Result<(), ItemError> {
        let badge_id = self
            .store
            .find_badge_by_external_id(badge.id)
            .await?
            .ok_or(ItemError::UnknownBadge(badge.id))?;
        let now = Utc::now();
        let earned_at = reported_date(badge.earned_date.as_deref())?;

        self.store
            .upsert_user_badge(&UserBadgeUpsert {
                user_id: user_id.to_string(),
                badge_id,
                earned_at,
                progress: 100,
                metadata: json!({
                    "wordpress_sync": true,
                    "wordpress_badge_id": badge.id,
                    "badge_type": badge.badge_type,
                    "sync_timestamp": now.to_rfc3339(),
                }),
            })
            .await?;
        Ok(())
    }

    async fn sync_ranks(&self, users: &[ResolvedUser<'_>], stats: &mut SyncStats, cancel: &CancelFlag) {
        for ResolvedUser { user, local_id } in users {
            if stop_requested(cancel, stats) {
                return;
            }
            if user.ranks.is_empty() {
                continue;
            }
            for rank in &user.ranks {
                match self.sync_rank(local_id, rank).await {
                    Ok(()) => stats.ranks_synced += 1,
                    Err(err) => item_failed(stats, SyncCategory::Ranks, user.id, rank.rank.clone(), err),
                }
            }
            self.audit
                .append(NewSyncLogEntry::new(
                    EntityType::UserRanks,
                    user.id,
                    local_id.clone(),
                    SyncAction::Updated,
                    json!({ "ranks_count": user.ranks.len() }),
                ))
                .await;
        }
    }

    async fn sync_rank(&self, user_id: &str, rank: &EarnedRank) -> Result<(), ItemError> {
        let rank_id = self.resolve_rank(rank).await?;
        let now = Utc::now();
        let achieved_at = reported_date(rank.earned_date.as_deref())?;

        self.store
            .upsert_rank_progress(&RankProgressUpsert {
                user_id: user_id.to_string(),
                rank_id,
                achieved_at,
                current_rank: true,
                metadata: json!({
                    "wordpress_sync": true,
                    "wordpress_rank_id": rank.id,
                    "sync_timestamp": now.to_rfc3339(),
                }),
            })
            .await?;
        // Separate statement: readers can briefly see zero or two current ranks.
        self.store.clear_other_current_ranks(user_id, rank_id).await?;
        Ok(())
    }

    /// Linked id first, then a unique title match.
    async fn resolve_rank(&self, rank: &EarnedRank) -> Result<i64, ItemError> {
        if let Some(id) = self.store.find_rank_by_external_id(rank.id).await? {
            return Ok(id);
        }
        Ok(self.match_rank_title(rank.id, &rank.rank).await?.id)
    }
}

/// An exact case-insensitive title wins; otherwise only a lone candidate.
fn single_rank_match<'r>(title: &str, candidates: &'r [LocalRank]) -> Option<&'r LocalRank> {
    let title = title.trim();
    let mut exact = candidates.iter().filter(|r| r.title.eq_ignore_ascii_case(title));
    match (exact.next(), exact.next()) {
        (Some(only), None) => Some(only),
        (Some(_), Some(_)) => None,
        (None, _) => match candidates {
            [only] => Some(only),
            _ => None,
        },
    }
}

/// `None` when the CMS did not record a date; the store then decides.
fn reported_date(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ItemError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => parse_cms_timestamp(s)
            .map(Some)
            .ok_or_else(|| ItemError::BadTimestamp(s.to_string())),
    }
}

fn item_failed(
    stats: &mut SyncStats,
    category: SyncCategory,
    cms_user_id: i64,
    item: String,
    err: ItemError,
) {
    if err.is_unmapped() {
        warn!(cms_user = cms_user_id, ?category, item = %item, error = %err, "item skipped");
    } else {
        error!(cms_user = cms_user_id, ?category, item = %item, error = %err, "item failed");
    }
    stats.record_failure(ItemFailure {
        category,
        external_user_id: cms_user_id,
        item,
        message: err.to_string(),
    });
}

fn stop_requested(cancel: &CancelFlag, stats: &mut SyncStats) -> bool {
    if cancel.is_cancelled() {
        if !stats.cancelled {
            warn!("cancellation requested; stopping before the next user");
            stats.cancelled = true;
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use powlax_store::MemoryStore;

    fn payload(value: serde_json::Value) -> ExternalSyncPayload {
        serde_json::from_value(value).unwrap()
    }

    fn engine_over(store: Arc<MemoryStore>) -> ReconciliationEngine {
        ReconciliationEngine::new(store.clone(), AuditLog::new(store))
    }

    async fn run(engine: &ReconciliationEngine, payload: &ExternalSyncPayload) -> SyncStats {
        let mut stats = SyncStats::new(Utc::now());
        engine.reconcile(payload, &mut stats, &CancelFlag::default()).await;
        stats
    }

    fn three_currencies() -> MemoryStore {
        MemoryStore::new()
            .with_currency("lax_credits", "credits")
            .with_currency("attack_tokens", "attack")
            .with_currency("defense_dollars", "defense")
    }

    #[tokio::test]
    async fn three_point_types_write_three_ledger_rows_and_overwrite_wallets() {
        let store = Arc::new(three_currencies().with_user(42, "u-1"));
        let engine = engine_over(store.clone());
        let first = payload(json!({"users": [{"id": 42, "points": {
            "lax_credits": 50, "attack_tokens": 12, "defense_dollars": 3
        }}]}));

        let stats = run(&engine, &first).await;
        assert_eq!(stats.points_synced, 3);
        let tables = store.snapshot().await;
        assert_eq!(tables.ledger.len(), 3);
        assert_eq!(tables.wallets.len(), 3);
        assert!(tables
            .ledger
            .iter()
            .all(|e| e.transaction_type == SYNC_UPDATE_TRANSACTION));

        let second = payload(json!({"users": [{"id": 42, "points": {"lax_credits": 70}}]}));
        run(&engine, &second).await;
        let tables = store.snapshot().await;
        let wallet = &tables.wallets[&("u-1".to_string(), "credits".to_string())];
        assert_eq!(wallet.balance, 70);
        assert_eq!(tables.wallets.len(), 3);

        let last = tables.ledger.last().unwrap();
        assert_eq!(last.amount, 70);
        assert_eq!(last.description, "WordPress sync - lax_credits");
        assert_eq!(last.metadata["previous_balance"], 50);
        assert_eq!(last.metadata["delta"], 20);
    }

    #[tokio::test]
    async fn zero_balances_are_not_written() {
        let store = Arc::new(three_currencies().with_user(42, "u-1"));
        let stats = run(
            &engine_over(store.clone()),
            &payload(json!({"users": [{"id": 42, "points": {"lax_credits": 0, "attack_tokens": -4}}]})),
        )
        .await;
        assert_eq!(stats.points_synced, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.users_processed, 1);
        assert!(store.snapshot().await.wallets.is_empty());
    }

    #[tokio::test]
    async fn unknown_currency_only_fails_that_item() {
        let store = Arc::new(
            three_currencies()
                .with_user(42, "u-1")
                .with_user(43, "u-2"),
        );
        let data = payload(json!({"users": [
            {"id": 42, "points": {"lax_credits": 5, "mystery_points": 9, "attack_tokens": 2}},
            {"id": 43, "points": {"lax_credits": 8, "defense_dollars": 1}}
        ]}));

        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.points_synced, 4);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].category, SyncCategory::Points);
        assert_eq!(stats.failures[0].external_user_id, 42);
        assert_eq!(stats.failures[0].item, "mystery_points");
        assert_eq!(store.snapshot().await.wallets.len(), 4);
    }

    #[tokio::test]
    async fn rejected_writes_for_one_user_do_not_stop_the_batch() {
        let store = Arc::new(
            three_currencies()
                .with_user(42, "u-1")
                .with_user(43, "u-2")
                .with_badge(7, 700)
                .rejecting_writes_for("u-1"),
        );
        let data = payload(json!({"users": [
            {"id": 42, "points": {"lax_credits": 5}, "badges": [{"id": 7, "earned_date": false}]},
            {"id": 43, "points": {"lax_credits": 8}, "badges": [{"id": 7, "earned_date": "2025-02-01 10:00:00"}]}
        ]}));

        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.points_synced, 1);
        assert_eq!(stats.badges_synced, 1);
        assert_eq!(stats.users_processed, 2);
        let tables = store.snapshot().await;
        assert!(tables.user_badges.contains_key(&("u-2".to_string(), 700)));
    }

    #[tokio::test]
    async fn unknown_users_are_skipped_not_failed() {
        let store = Arc::new(three_currencies().with_user(42, "u-1"));
        let data = payload(json!({"users": [
            {"id": 42, "points": {"lax_credits": 5}},
            {"id": 999, "points": {"lax_credits": 5}, "badges": [{"id": 7}]}
        ]}));
        let stats = run(&engine_over(store), &data).await;
        assert_eq!(stats.skipped_users, 1);
        assert_eq!(stats.users_processed, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn badge_timestamps_and_unknown_badges() {
        let store = Arc::new(MemoryStore::new().with_user(42, "u-1").with_badge(7, 700).with_badge(8, 800));
        let data = payload(json!({"users": [{"id": 42, "points": [], "badges": [
            {"id": 7, "earned_date": "2025-01-01T00:00:00Z"},
            {"id": 8, "earned_date": "last tuesday"},
            {"id": 9, "earned_date": "2025-01-01 00:00:00"}
        ]}]}));

        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.badges_synced, 1);
        assert_eq!(stats.errors, 2);
        let items = stats.failures.iter().map(|f| f.item.as_str()).collect::<Vec<_>>();
        assert_eq!(items, vec!["8", "9"]);

        let tables = store.snapshot().await;
        let row = &tables.user_badges[&("u-1".to_string(), 700)];
        assert_eq!(row.progress, 100);
        assert_eq!(row.earned_at, parse_cms_timestamp("2025-01-01T00:00:00Z"));
        let audited = tables
            .sync_log
            .iter()
            .filter(|e| e.entity_type == "user_badges")
            .collect::<Vec<_>>();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].payload["badges_count"], 3);
    }

    #[tokio::test]
    async fn newer_rank_becomes_the_only_current_one() {
        let store = Arc::new(
            MemoryStore::new()
                .with_user(42, "u-1")
                .with_rank(1, "Lacrosse Bot", None)
                .with_rank(2, "Lax Leader", None),
        );
        let engine = engine_over(store.clone());
        let catalog = json!([
            {"id": 89, "title": "Lacrosse Bot"},
            {"id": 90, "title": "Lax Leader"}
        ]);

        let first = payload(json!({"ranks": catalog, "users": [{"id": 42, "ranks": [
            {"id": 89, "rank": "Lacrosse Bot", "earned_date": "2025-01-01 00:00:00"}
        ]}]}));
        let stats = run(&engine, &first).await;
        assert_eq!(stats.ranks_linked, 2);
        assert_eq!(stats.ranks_synced, 1);
        assert_eq!(store.snapshot().await.current_ranks_for("u-1"), vec![1]);

        let second = payload(json!({"ranks": catalog, "users": [{"id": 42, "ranks": [
            {"id": 90, "rank": "Lax Leader", "earned_date": "2025-03-01 00:00:00"}
        ]}]}));
        let stats = run(&engine, &second).await;
        assert_eq!(stats.ranks_linked, 0);
        assert_eq!(stats.ranks_synced, 1);
        let tables = store.snapshot().await;
        assert_eq!(tables.current_ranks_for("u-1"), vec![2]);
        assert_eq!(tables.rank_progress.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_rank_titles_are_not_guessed() {
        let store = Arc::new(
            MemoryStore::new()
                .with_user(42, "u-1")
                .with_rank(1, "Leader I", None)
                .with_rank(2, "Leader II", None)
                .with_rank(3, "Lax Leader", None),
        );
        let data = payload(json!({
            "ranks": [{"id": 91, "title": "Leader"}],
            "users": [{"id": 42, "ranks": [
                {"id": 91, "rank": "Leader"},
                {"id": 90, "rank": "lax leader"}
            ]}]
        }));

        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.ranks_linked, 0);
        assert_eq!(stats.ranks_synced, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.failures[0].item, "Leader");
        assert_eq!(store.snapshot().await.current_ranks_for("u-1"), vec![3]);
    }

    #[test]
    fn exact_title_beats_substring_matches() {
        let ranks = vec![
            LocalRank { id: 1, title: "Lax Leader".into(), external_id: None },
            LocalRank { id: 2, title: "Lax Leader Elite".into(), external_id: None },
        ];
        assert_eq!(single_rank_match("lax leader", &ranks).map(|r| r.id), Some(1));
        assert_eq!(single_rank_match("Elite", &ranks[1..]).map(|r| r.id), Some(2));
        assert_eq!(single_rank_match("Lax", &ranks), None);
        assert_eq!(single_rank_match("Lax", &[]), None);
    }

    #[tokio::test]
    async fn undated_badges_and_ranks_keep_their_first_timestamp() {
        let store = Arc::new(
            MemoryStore::new()
                .with_user(42, "u-1")
                .with_badge(7, 700)
                .with_rank(1, "Lax Leader", Some(90)),
        );
        let engine = engine_over(store.clone());
        let data = payload(json!({"users": [{"id": 42,
            "badges": [{"id": 7, "earned_date": false}],
            "ranks": [{"id": 90, "rank": "Lax Leader", "earned_date": false}]
        }]}));

        run(&engine, &data).await;
        let first = store.snapshot().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stats = run(&engine, &data).await;
        let second = store.snapshot().await;

        assert_eq!((stats.badges_synced, stats.ranks_synced, stats.errors), (1, 1, 0));
        let key = ("u-1".to_string(), 700);
        assert!(first.user_badges[&key].earned_at.is_some());
        assert_eq!(second.user_badges[&key].earned_at, first.user_badges[&key].earned_at);
        let key = ("u-1".to_string(), 1);
        assert!(first.rank_progress[&key].achieved_at.is_some());
        assert_eq!(second.rank_progress[&key].achieved_at, first.rank_progress[&key].achieved_at);

        let dated = payload(json!({"users": [{"id": 42,
            "badges": [{"id": 7, "earned_date": "2025-02-01 10:00:00"}]
        }]}));
        run(&engine, &dated).await;
        assert_eq!(
            store.snapshot().await.user_badges[&("u-1".to_string(), 700)].earned_at,
            parse_cms_timestamp("2025-02-01 10:00:00")
        );
    }

    #[tokio::test]
    async fn linked_exact_title_blocks_a_looser_match() {
        let store = Arc::new(
            MemoryStore::new()
                .with_user(42, "u-1")
                .with_rank(1, "Lax Leader", Some(90))
                .with_rank(2, "Lax Leader Elite", None),
        );
        let data = payload(json!({
            "ranks": [{"id": 95, "title": "Lax Leader"}],
            "users": [{"id": 42, "ranks": [{"id": 95, "rank": "Lax Leader"}]}]
        }));

        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.ranks_linked, 0);
        assert_eq!(stats.ranks_synced, 0);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.failures[0].item, "Lax Leader");
        let tables = store.snapshot().await;
        assert!(tables.current_ranks_for("u-1").is_empty());
        assert_eq!(tables.ranks.iter().find(|r| r.id == 2).unwrap().external_id, None);
    }

    #[tokio::test]
    async fn huge_balances_do_not_overflow_the_audit_total() {
        let store = Arc::new(three_currencies().with_user(42, "u-1"));
        let data = payload(json!({"users": [{"id": 42, "points": {
            "lax_credits": i64::MAX, "attack_tokens": i64::MAX
        }}]}));
        let stats = run(&engine_over(store.clone()), &data).await;
        assert_eq!(stats.points_synced, 2);
        let tables = store.snapshot().await;
        let audited = tables
            .sync_log
            .iter()
            .find(|e| e.entity_type == "user_points")
            .unwrap();
        assert_eq!(audited.payload["total_points"], i64::MAX);
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_touching_users() {
        let store = Arc::new(three_currencies().with_user(42, "u-1"));
        let cancel = CancelFlag::default();
        cancel.cancel();
        let mut stats = SyncStats::new(Utc::now());
        engine_over(store.clone())
            .reconcile(
                &payload(json!({"users": [{"id": 42, "points": {"lax_credits": 5}}]})),
                &mut stats,
                &cancel,
            )
            .await;
        assert!(stats.cancelled);
        assert_eq!(stats.users_processed, 0);
        assert!(store.snapshot().await.wallets.is_empty());
    }
}
