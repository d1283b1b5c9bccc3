use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::errors::{Result, UpdaterError};
use crate::models::{
    AppInfo, ContentSummary, DiffSummary, KeySecretResponse, RemoteResource, ResourceUrl,
    VersionId,
};
use crate::services::remote_meta::RemoteMetaData;

const ERROR_BODY_LIMIT: usize = 300;

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String, timeout: Duration, connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base_url }
    }

    pub fn with_defaults(base_url: String) -> Self {
        Self::new(base_url, Duration::from_secs(20), Duration::from_secs(6))
    }

    /// Get the underlying reqwest client for custom requests
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.url(path);
        let response = self.client.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            tracing::debug!("request failed path={} status={}", path, status.as_u16());
            return Err(UpdaterError::HttpStatus {
                status: status.as_u16(),
                message: snippet.trim().to_string(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[derive(Deserialize)]
struct VersionIdResponse {
    id: VersionId,
}

#[derive(Deserialize)]
struct TorrentUrlResponse {
    url: String,
}

/// [`RemoteMetaData`] backed by the PatchKit-style HTTP API and keys service.
#[derive(Clone)]
pub struct HttpRemoteMetaData {
    api: ApiClient,
    keys: ApiClient,
    app_secret: String,
}

impl HttpRemoteMetaData {
    pub fn new(api: ApiClient, keys: ApiClient, app_secret: String) -> Self {
        Self {
            api,
            keys,
            app_secret,
        }
    }

    fn app_path(&self, suffix: &str) -> String {
        let app = urlencoding::encode(&self.app_secret);
        if suffix.is_empty() {
            format!("1/apps/{}", app)
        } else {
            format!("1/apps/{}/{}", app, suffix)
        }
    }

    fn version_path(&self, version_id: VersionId, suffix: &str) -> String {
        self.app_path(&format!("versions/{}/{}", version_id, suffix))
    }

    async fn resource(
        &self,
        version_id: VersionId,
        kind: &str,
        key_secret: Option<&str>,
        size: u64,
        hash_code: String,
        chunk_map: Option<crate::models::ChunkMap>,
    ) -> Result<RemoteResource> {
        let query: Vec<(&str, &str)> = key_secret
            .map(|secret| vec![("key_secret", secret)])
            .unwrap_or_default();

        let urls: Vec<ResourceUrl> = self
            .api
            .get(&self.version_path(version_id, &format!("{}_urls", kind)), &query)
            .await?;

        // Torrents are optional; the HTTP tiers work without them.
        let torrent_urls = match self
            .api
            .get::<TorrentUrlResponse>(
                &self.version_path(version_id, &format!("{}_torrent_url", kind)),
                &query,
            )
            .await
        {
            Ok(response) if !response.url.is_empty() => vec![response.url],
            Ok(_) => Vec::new(),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(
                    "no torrent for version={} kind={}: {}",
                    version_id,
                    kind,
                    err
                );
                Vec::new()
            }
        };

        Ok(RemoteResource {
            urls: urls.into_iter().map(|entry| entry.url).collect(),
            torrent_urls,
            size,
            hash_code,
            chunk_map,
        })
    }
}

#[async_trait]
impl RemoteMetaData for HttpRemoteMetaData {
    async fn latest_version_id(&self) -> Result<VersionId> {
        let response: VersionIdResponse = self
            .api
            .get(&self.app_path("versions/latest/id"), &[])
            .await?;
        Ok(response.id)
    }

    async fn app_info(&self) -> Result<AppInfo> {
        self.api.get(&self.app_path(""), &[]).await
    }

    async fn content_summary(&self, version_id: VersionId) -> Result<ContentSummary> {
        self.api
            .get(&self.version_path(version_id, "content_summary"), &[])
            .await
    }

    async fn diff_summary(&self, version_id: VersionId) -> Result<DiffSummary> {
        self.api
            .get(&self.version_path(version_id, "diff_summary"), &[])
            .await
    }

    async fn key_secret(&self, key: &str, cached_secret: Option<&str>) -> Result<String> {
        let path = format!("v2/keys/{}", urlencoding::encode(key));
        let mut query = vec![("app_secret", self.app_secret.as_str())];
        if let Some(secret) = cached_secret {
            query.push(("key_secret", secret));
        }
        let response: KeySecretResponse = self.keys.get(&path, &query).await?;
        Ok(response.key_secret)
    }

    async fn content_resource(
        &self,
        version_id: VersionId,
        key_secret: Option<&str>,
    ) -> Result<RemoteResource> {
        let summary = self.content_summary(version_id).await?;
        self.resource(
            version_id,
            "content",
            key_secret,
            summary.size,
            summary.hash_code,
            summary.chunks,
        )
        .await
    }

    async fn diff_resource(
        &self,
        version_id: VersionId,
        key_secret: Option<&str>,
    ) -> Result<RemoteResource> {
        let summary = self.diff_summary(version_id).await?;
        self.resource(
            version_id,
            "diff",
            key_secret,
            summary.size,
            summary.hash_code,
            summary.chunks,
        )
        .await
    }
}

/// True for statuses worth retrying against the same endpoint.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}
