//! Where a sync run gets its CMS snapshot from: the live GamiPress export
//! endpoint, or a saved export replayed from disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powlax_core::ExternalSyncPayload;
use thiserror::Error;

mod client;
mod fixture;

pub use client::{CmsConfig, GamiPressClient, DEFAULT_CMS_BASE_URL, EXPORT_PATH};
pub use fixture::{load_payload_file, FixtureChangeSource};

pub const CRATE_NAME: &str = "powlax-cms";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cms returned http {status}: {body}")]
    RemoteStatus { status: u16, body: String },
    #[error("cms request to {url} timed out")]
    Timeout { url: String },
    #[error("cms request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cms payload does not match the export shape: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("reading payload file {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// HTTP status for `RemoteStatus`, if the CMS answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Provider of gamification changes since an instant.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch_changes_since(
        &self,
        since: DateTime<Utc>,
        user_ids: Option<&[i64]>,
    ) -> Result<ExternalSyncPayload, FetchError>;
}
