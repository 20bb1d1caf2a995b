use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powlax_core::ExternalSyncPayload;

use crate::{ChangeSource, FetchError};

/// Read a saved export payload from disk.
pub fn load_payload_file(path: impl AsRef<Path>) -> Result<ExternalSyncPayload, FetchError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| FetchError::Fixture {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&data)?)
}

/// Replays one fixed payload, ignoring the sync window. A user-id filter is
/// applied the way the CMS applies it.
#[derive(Debug, Clone)]
pub struct FixtureChangeSource {
    label: String,
    payload: ExternalSyncPayload,
}

impl FixtureChangeSource {
    pub fn new(payload: ExternalSyncPayload) -> Self {
        Self {
            label: "fixture".to_string(),
            payload,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref();
        let payload = load_payload_file(path)?;
        Ok(Self {
            label: format!("fixture:{}", path.display()),
            payload,
        })
    }
}

#[async_trait]
impl ChangeSource for FixtureChangeSource {
    fn source_name(&self) -> &str {
        &self.label
    }

    async fn fetch_changes_since(
        &self,
        _since: DateTime<Utc>,
        user_ids: Option<&[i64]>,
    ) -> Result<ExternalSyncPayload, FetchError> {
        let mut payload = self.payload.clone();
        if let Some(ids) = user_ids.filter(|ids| !ids.is_empty()) {
            payload.users.retain(|u| ids.contains(&u.id));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn fixture_source_filters_users() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"users": [{{"id": 1, "points": {{}}}}, {{"id": 2, "points": {{}}}}]}}"#
        )
        .unwrap();

        let source = FixtureChangeSource::from_path(file.path()).unwrap();
        let all = source.fetch_changes_since(Utc::now(), None).await.unwrap();
        assert_eq!(all.users.len(), 2);

        let one = source
            .fetch_changes_since(Utc::now(), Some(&[2]))
            .await
            .unwrap();
        assert_eq!(one.users.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn missing_file_is_a_fixture_error() {
        let err = load_payload_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, FetchError::Fixture { .. }));
    }
}
