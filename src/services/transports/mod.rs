//! Download tiers used by the resource acquirer.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::models::RemoteResource;
use crate::progress::DownloadReporter;

pub mod chunked;
pub mod http;
pub mod peer;

pub use chunked::ChunkedHttpTransport;
pub use http::PlainHttpTransport;
pub use peer::TorrentTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportTier {
    Peer,
    Chunked,
    Http,
}

impl TransportTier {
    pub fn label(&self) -> &'static str {
        match self {
            TransportTier::Peer => "peer",
            TransportTier::Chunked => "chunked",
            TransportTier::Http => "http",
        }
    }
}

/// One way of bringing a [`RemoteResource`] to `dest`. Implementations
/// report through `reporter` and return [`UpdaterError::Cancelled`] once
/// `token` is observed cancelled.
#[async_trait]
pub trait Transport: Send + Sync {
    fn tier(&self) -> TransportTier;

    async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()>;
}

/// HTTP client for bulk transfers: connect timeout only, per-request
/// timeouts are set by the caller.
pub fn download_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Sleeps for `duration` unless the token is cancelled first.
pub async fn wait_or_cancel(duration: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = sleep(duration) => Ok(()),
        _ = token.cancelled() => Err(UpdaterError::Cancelled),
    }
}

pub(crate) fn trim_text_snippet(value: &str) -> String {
    value.chars().take(300).collect::<String>().trim().to_string()
}
