use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use powlax_core::ExternalSyncPayload;
use reqwest::header::ACCEPT;
use tracing::{debug, info_span, warn, Instrument};

use crate::{ChangeSource, FetchError};

pub const DEFAULT_CMS_BASE_URL: &str = "https://powlax.com/wp-json";
pub const EXPORT_PATH: &str = "powlax/v1/gamipress-export";

#[derive(Debug, Clone)]
pub struct CmsConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CMS_BASE_URL.to_string(),
            bearer_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the CMS plugin's GamiPress export endpoint.
///
/// One GET per call, no retries and no pagination: the endpoint returns the
/// whole delta in a single response.
#[derive(Debug, Clone)]
pub struct GamiPressClient {
    client: reqwest::Client,
    config: CmsConfig,
}

impl GamiPressClient {
    pub fn new(config: CmsConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout)
            .user_agent(concat!("powlax-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn export_url(&self) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), EXPORT_PATH)
    }

    pub async fn fetch_export(
        &self,
        since: DateTime<Utc>,
        user_ids: Option<&[i64]>,
    ) -> Result<ExternalSyncPayload, FetchError> {
        let url = self.export_url();
        let since_param = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let span = info_span!("cms_fetch", url = %url, since = %since_param);

        async {
            let mut query = vec![("since", since_param.clone())];
            if let Some(ids) = user_ids.filter(|ids| !ids.is_empty()) {
                let csv = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
                query.push(("user_ids", csv));
            }

            let mut request = self
                .client
                .get(&url)
                .query(&query)
                .header(ACCEPT, "application/json");
            if let Some(token) = &self.config.bearer_token {
                // The plugin's permission check reads X-API-Key.
                request = request.bearer_auth(token).header("X-API-Key", token);
            }

            let resp = request.send().await.map_err(|err| timeout_or(err, &url))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "cms export request failed");
                return Err(FetchError::RemoteStatus {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = resp.bytes().await.map_err(|err| timeout_or(err, &url))?;
            let payload: ExternalSyncPayload = serde_json::from_slice(&bytes)?;
            debug!(
                users = payload.users.len(),
                bytes = bytes.len(),
                "cms export received"
            );
            Ok(payload)
        }
        .instrument(span)
        .await
    }
}

fn timeout_or(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

#[async_trait]
impl ChangeSource for GamiPressClient {
    fn source_name(&self) -> &str {
        "gamipress-export"
    }

    async fn fetch_changes_since(
        &self,
        since: DateTime<Utc>,
        user_ids: Option<&[i64]>,
    ) -> Result<ExternalSyncPayload, FetchError> {
        self.fetch_export(since, user_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap()
    }

    fn client_for(server: &MockServer, token: Option<&str>, timeout: Duration) -> GamiPressClient {
        GamiPressClient::new(CmsConfig {
            base_url: format!("{}/wp-json/", server.uri()),
            bearer_token: token.map(str::to_string),
            request_timeout: timeout,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_sends_window_filter_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wp-json/powlax/v1/gamipress-export"))
            .and(query_param("since", "2025-01-01T00:00:00Z"))
            .and(query_param("user_ids", "42,43"))
            .and(header("authorization", "Bearer secret-key"))
            .and(header("x-api-key", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": [{"id": 42, "username": "coach", "email": "c@example.com",
                           "points": {"lax_credits": 50}, "badges": [], "ranks": []}],
                "point_types": [], "badges": [], "ranks": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret-key"), Duration::from_secs(5));
        let payload = client
            .fetch_changes_since(since(), Some(&[42, 43]))
            .await
            .unwrap();
        assert_eq!(payload.users.len(), 1);
        assert_eq!(payload.users[0].points["lax_credits"], 50);
    }

    #[tokio::test]
    async fn fetch_without_filter_or_token_omits_them() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wp-json/powlax/v1/gamipress-export"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"users": []})))
            .mount(&server)
            .await;

        let client = client_for(&server, None, Duration::from_secs(5));
        client.fetch_changes_since(since(), Some(&[])).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let keys = requests[0]
            .url
            .query_pairs()
            .map(|(k, _)| k.into_owned())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["since".to_string()]);
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn non_success_status_carries_code_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance mode"))
            .mount(&server)
            .await;

        let client = client_for(&server, None, Duration::from_secs(5));
        let err = client.fetch_changes_since(since(), None).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        match err {
            FetchError::RemoteStatus { body, .. } => assert_eq!(body, "maintenance mode"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_a_deserialization_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, None, Duration::from_secs(5));
        let err = client.fetch_changes_since(since(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Deserialization(_)));
    }

    #[tokio::test]
    async fn slow_cms_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"users": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None, Duration::from_millis(50));
        let err = client.fetch_changes_since(since(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err}");
    }
}
