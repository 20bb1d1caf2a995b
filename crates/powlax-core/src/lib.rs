//! Core domain model for the POWLAX GamiPress sync.
//!
//! Three families of types live here: the export payload the CMS returns,
//! the row shapes the sync writes into the local store, and the audit/stats
//! records a sync run produces.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "powlax-core";

/// Ledger `transaction_type` for balances written by the sync.
pub const SYNC_UPDATE_TRANSACTION: &str = "sync_update";

/// Local identifier of a provisioned app user (uuid text in Postgres).
pub type LocalUserId = String;

/// One snapshot of gamification data changed since a given instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalSyncPayload {
    #[serde(default)]
    pub users: Vec<ExternalUser>,
    #[serde(default)]
    pub point_types: Vec<ExternalPointType>,
    #[serde(default)]
    pub badges: Vec<ExternalBadge>,
    #[serde(default)]
    pub ranks: Vec<ExternalRank>,
    #[serde(default)]
    pub exported_at: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalUser {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// Point-type slug to balance. The CMS encodes an empty map as `[]`.
    #[serde(default, deserialize_with = "point_balances")]
    pub points: BTreeMap<String, i64>,
    #[serde(default)]
    pub badges: Vec<EarnedBadge>,
    #[serde(default)]
    pub ranks: Vec<EarnedRank>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarnedBadge {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub earned_date: Option<String>,
    #[serde(default)]
    pub badge_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarnedRank {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    /// Display title of the rank as the CMS renders it.
    pub rank: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub earned_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPointType {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plural_name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBadge {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requirements: JsonValue,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRank {
    #[serde(deserialize_with = "int_or_numeric_string")]
    pub id: i64,
    #[serde(default)]
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub requirements: JsonValue,
    #[serde(default)]
    pub rank_type: Option<String>,
}

/// Parse a CMS timestamp. Accepts RFC 3339 and the CMS's native
/// `YYYY-MM-DD HH:MM:SS` form, which is treated as UTC.
pub fn parse_cms_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn int_or_numeric_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected integer id, got {s:?}"))),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    // The CMS sends `false` where a date is unknown.
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

fn point_balances<'de, D>(deserializer: D) -> Result<BTreeMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Balance {
        Int(i64),
        Float(f64),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Map(BTreeMap<String, Balance>),
        List(Vec<JsonValue>),
        Null,
    }

    let raw = Raw::deserialize(deserializer)?;
    let map = match raw {
        Raw::Map(map) => map,
        Raw::List(items) if items.is_empty() => return Ok(BTreeMap::new()),
        Raw::List(_) => {
            return Err(serde::de::Error::custom(
                "points must be an object keyed by point-type slug",
            ))
        }
        Raw::Null => return Ok(BTreeMap::new()),
    };

    map.into_iter()
        .map(|(slug, balance)| {
            let value = match balance {
                Balance::Int(v) => v,
                Balance::Float(v) => v.round() as i64,
                Balance::Text(s) => s.trim().parse().map_err(|_| {
                    serde::de::Error::custom(format!("non-numeric balance {s:?} for {slug}"))
                })?,
            };
            Ok((slug, value))
        })
        .collect()
}

/// Local catalog entry an external point-type slug maps onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointCurrency {
    pub currency: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRank {
    pub id: i64,
    pub title: String,
    pub external_id: Option<i64>,
}

/// Wallet write keyed on `(user_id, currency)`; overwrites the balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletUpsert {
    pub user_id: LocalUserId,
    pub currency: String,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub user_id: LocalUserId,
    pub currency: String,
    pub amount: i64,
    pub transaction_type: String,
    pub description: String,
    pub metadata: JsonValue,
}

/// Junction write keyed on `(user_id, badge_id)`.
///
/// `earned_at: None` means the CMS reported no date: a new row is stamped
/// with the write time and an existing row keeps its stored date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserBadgeUpsert {
    pub user_id: LocalUserId,
    pub badge_id: i64,
    pub earned_at: Option<DateTime<Utc>>,
    pub progress: i32,
    pub metadata: JsonValue,
}

/// Junction write keyed on `(user_id, rank_id)`. A missing `achieved_at`
/// follows the same rule as [`UserBadgeUpsert::earned_at`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankProgressUpsert {
    pub user_id: LocalUserId,
    pub rank_id: i64,
    pub achieved_at: Option<DateTime<Utc>>,
    pub current_rank: bool,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    Failed,
    SyncCompleted,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::SyncCompleted => "sync_completed",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    UserPoints,
    UserBadges,
    UserRanks,
    RankCatalog,
    SyncSession,
    SyncApiRequest,
    SyncApiResponse,
    SyncApiError,
    SyncCancellation,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPoints => "user_points",
            Self::UserBadges => "user_badges",
            Self::UserRanks => "user_ranks",
            Self::RankCatalog => "rank_catalog",
            Self::SyncSession => "sync_session",
            Self::SyncApiRequest => "sync_api_request",
            Self::SyncApiResponse => "sync_api_response",
            Self::SyncApiError => "sync_api_error",
            Self::SyncCancellation => "sync_cancellation",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row to append; the store assigns `id` and `synced_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSyncLogEntry {
    pub entity_type: EntityType,
    pub external_id: i64,
    pub local_id: String,
    pub action: SyncAction,
    pub payload: JsonValue,
    pub error_message: Option<String>,
}

impl NewSyncLogEntry {
    pub fn new(
        entity_type: EntityType,
        external_id: i64,
        local_id: impl Into<String>,
        action: SyncAction,
        payload: JsonValue,
    ) -> Self {
        Self {
            entity_type,
            external_id,
            local_id: local_id.into(),
            action,
            payload,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Persisted audit row. Serialized with the column names of the
/// `gamipress_sync_log` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub entity_type: String,
    #[serde(rename = "wordpress_id")]
    pub external_id: i64,
    #[serde(rename = "supabase_id")]
    pub local_id: String,
    #[serde(rename = "action_type")]
    pub action: String,
    #[serde(rename = "sync_data")]
    pub payload: JsonValue,
    pub error_message: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCategory {
    Points,
    Badges,
    Ranks,
}

/// Why one point/badge/rank item for one user did not land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub category: SyncCategory,
    pub external_user_id: i64,
    pub item: String,
    pub message: String,
}

/// Running totals for one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub users_processed: u64,
    pub points_synced: u64,
    pub badges_synced: u64,
    pub ranks_synced: u64,
    pub ranks_linked: u64,
    pub skipped_users: u64,
    pub errors: u64,
    pub cancelled: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

impl SyncStats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            users_processed: 0,
            points_synced: 0,
            badges_synced: 0,
            ranks_synced: 0,
            ranks_linked: 0,
            skipped_users: 0,
            errors: 0,
            cancelled: false,
            start_time,
            end_time: None,
            failures: Vec::new(),
        }
    }

    /// All-zero stats that start and end at `at`.
    pub fn empty_at(at: DateTime<Utc>) -> Self {
        let mut stats = Self::new(at);
        stats.end_time = Some(at);
        stats
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.errors += 1;
        self.failures.push(failure);
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}
