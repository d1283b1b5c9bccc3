use async_trait::async_trait;

use crate::errors::Result;
use crate::models::{AppInfo, ContentSummary, DiffSummary, RemoteResource, VersionId};

/// Read-only view of the remote application catalogue.
///
/// HTTP failures surface as [`crate::errors::UpdaterError::HttpStatus`] so
/// callers can branch on the status code.
#[async_trait]
pub trait RemoteMetaData: Send + Sync {
    async fn latest_version_id(&self) -> Result<VersionId>;

    async fn app_info(&self) -> Result<AppInfo>;

    async fn content_summary(&self, version_id: VersionId) -> Result<ContentSummary>;

    async fn diff_summary(&self, version_id: VersionId) -> Result<DiffSummary>;

    /// Exchanges a product key for its key secret. `cached_secret` is the
    /// secret obtained on an earlier run, when there is one.
    async fn key_secret(&self, key: &str, cached_secret: Option<&str>) -> Result<String>;

    async fn content_resource(
        &self,
        version_id: VersionId,
        key_secret: Option<&str>,
    ) -> Result<RemoteResource>;

    async fn diff_resource(
        &self,
        version_id: VersionId,
        key_secret: Option<&str>,
    ) -> Result<RemoteResource>;
}
