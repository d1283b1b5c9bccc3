use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::UpdaterConfig;
use crate::errors::{Result, UpdaterError};
use crate::models::RemoteResource;
use crate::progress::DownloadReporter;
use crate::services::transports::{
    download_client, ChunkedHttpTransport, PlainHttpTransport, TorrentTransport, Transport,
    TransportTier,
};

const CHUNK_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The three download tiers, shared by every acquirer of a run.
#[derive(Clone)]
pub struct Transports {
    pub peer: Option<Arc<dyn Transport>>,
    pub chunked: Arc<dyn Transport>,
    pub http: Arc<dyn Transport>,
}

impl Transports {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        let client = download_client(Duration::from_secs(config.connect_timeout_secs));
        let peer = config.torrent_client_path.as_ref().map(|program| {
            Arc::new(TorrentTransport::new(
                program.clone(),
                client.clone(),
                config.torrent_stall_timeout(),
            )) as Arc<dyn Transport>
        });
        Self {
            peer,
            chunked: Arc::new(ChunkedHttpTransport::new(
                client.clone(),
                config.chunk_retry_attempts,
                config.retry_backoff(),
                CHUNK_REQUEST_TIMEOUT,
            )),
            http: Arc::new(PlainHttpTransport::new(
                client,
                config.chunk_retry_attempts,
                config.retry_backoff(),
                STREAM_IDLE_TIMEOUT,
            )),
        }
    }
}

/// Brings one remote resource to disk, trying peer, then chunked or plain
/// HTTP. Tiers run strictly one after another.
pub struct ResourceAcquirer {
    transports: Transports,
    started: AtomicBool,
    attempted: Mutex<Vec<TransportTier>>,
}

impl ResourceAcquirer {
    pub fn new(transports: Transports) -> Self {
        Self {
            transports,
            started: AtomicBool::new(false),
            attempted: Mutex::new(Vec::new()),
        }
    }

    /// Tiers tried so far, in order.
    pub fn attempted_tiers(&self) -> Vec<TransportTier> {
        match self.attempted.lock() {
            Ok(locked) => locked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, tier: TransportTier) {
        match self.attempted.lock() {
            Ok(mut locked) => locked.push(tier),
            Err(poisoned) => poisoned.into_inner().push(tier),
        }
    }

    pub async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        allow_torrent: bool,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(UpdaterError::Programming(
                "resource acquirer can only download once".to_string(),
            ));
        }
        resource.validate()?;
        token.throw_if_cancelled()?;

        reporter.start();
        let result = self
            .download_tiers(dest, resource, allow_torrent, reporter, token)
            .await;
        let result = match result {
            Err(err) if token.is_cancelled() && !err.is_cancelled() => {
                tracing::debug!("download error after cancellation: {}", err);
                Err(UpdaterError::Cancelled)
            }
            other => other,
        };
        if result.is_ok() {
            reporter.finish();
        }
        result
    }

    async fn download_tiers(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        allow_torrent: bool,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        if allow_torrent && !resource.torrent_urls.is_empty() {
            if let Some(peer) = self.transports.peer.as_ref() {
                self.record(TransportTier::Peer);
                match peer.download(dest, resource, reporter, token).await {
                    Ok(()) => match verify_size(dest, resource.size).await {
                        Ok(()) => {
                            tracing::info!("resource acquired tier=peer dest={}", dest.display());
                            return Ok(());
                        }
                        Err(err) => tracing::warn!("peer result rejected: {}", err),
                    },
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        tracing::warn!("peer tier failed, falling back to http: {}", err);
                    }
                }
                token.throw_if_cancelled()?;
                reporter.start();
            }
        }

        if resource.urls.is_empty() {
            return Err(UpdaterError::Transport(
                "peer tier unavailable and resource has no http urls".to_string(),
            ));
        }

        let transport = if resource.chunk_map.is_some() {
            &self.transports.chunked
        } else {
            &self.transports.http
        };
        let tier = transport.tier();
        self.record(tier);
        transport.download(dest, resource, reporter, token).await?;
        verify_size(dest, resource.size).await?;
        tracing::info!(
            "resource acquired tier={} dest={}",
            tier.label(),
            dest.display()
        );
        Ok(())
    }
}

async fn verify_size(dest: &Path, expected: u64) -> Result<()> {
    let actual = tokio::fs::metadata(dest).await?.len();
    if actual != expected {
        return Err(UpdaterError::Transport(format!(
            "downloaded {} bytes, expected {}",
            actual, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMap;
    use crate::progress::ProgressAggregator;
    use async_trait::async_trait;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct FakeTransport {
        tier: TransportTier,
        outcome: std::result::Result<Vec<u8>, String>,
        calls: Arc<Mutex<Vec<TransportTier>>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn tier(&self) -> TransportTier {
            self.tier
        }

        async fn download(
            &self,
            dest: &Path,
            _resource: &RemoteResource,
            _reporter: &DownloadReporter,
            _token: &CancellationToken,
        ) -> Result<()> {
            self.calls.lock().expect("calls lock").push(self.tier);
            match &self.outcome {
                Ok(bytes) => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(dest, bytes)?;
                    Ok(())
                }
                Err(message) => Err(UpdaterError::Transport(message.clone())),
            }
        }
    }

    fn fake(
        tier: TransportTier,
        outcome: std::result::Result<Vec<u8>, String>,
        calls: &Arc<Mutex<Vec<TransportTier>>>,
    ) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            tier,
            outcome,
            calls: calls.clone(),
        })
    }

    fn chunked_resource() -> RemoteResource {
        RemoteResource {
            urls: vec!["http://mirror/pkg.zip".to_string()],
            torrent_urls: vec!["http://mirror/pkg.torrent".to_string()],
            size: 4,
            hash_code: String::new(),
            chunk_map: Some(ChunkMap {
                chunk_size: 4,
                chunk_hashes: vec!["00".to_string()],
            }),
        }
    }

    fn temp_dest() -> PathBuf {
        std::env::temp_dir()
            .join(format!("updater-acquire-{}", Uuid::new_v4()))
            .join("pkg.zip")
    }

    #[tokio::test]
    async fn peer_failure_falls_to_chunked_never_plain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquirer = ResourceAcquirer::new(Transports {
            peer: Some(fake(TransportTier::Peer, Err("tracker down".into()), &calls)),
            chunked: fake(TransportTier::Chunked, Ok(b"data".to_vec()), &calls),
            http: fake(TransportTier::Http, Ok(b"data".to_vec()), &calls),
        });
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();

        acquirer
            .download(
                &dest,
                &chunked_resource(),
                true,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");

        assert_eq!(
            *calls.lock().expect("calls lock"),
            vec![TransportTier::Peer, TransportTier::Chunked]
        );
        assert_eq!(
            acquirer.attempted_tiers(),
            vec![TransportTier::Peer, TransportTier::Chunked]
        );
        assert_eq!(aggregator.overall().progress, 1.0);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn torrent_disallowed_skips_peer_and_plain_used_without_chunks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquirer = ResourceAcquirer::new(Transports {
            peer: Some(fake(TransportTier::Peer, Ok(b"data".to_vec()), &calls)),
            chunked: fake(TransportTier::Chunked, Ok(b"data".to_vec()), &calls),
            http: fake(TransportTier::Http, Ok(b"data".to_vec()), &calls),
        });
        let mut resource = chunked_resource();
        resource.chunk_map = None;
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();

        acquirer
            .download(
                &dest,
                &resource,
                false,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(*calls.lock().expect("calls lock"), vec![TransportTier::Http]);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn second_download_is_programming_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquirer = ResourceAcquirer::new(Transports {
            peer: None,
            chunked: fake(TransportTier::Chunked, Ok(b"data".to_vec()), &calls),
            http: fake(TransportTier::Http, Ok(b"data".to_vec()), &calls),
        });
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();
        let reporter = aggregator.add_download_progress(1.0);
        let token = CancellationToken::none();

        acquirer
            .download(&dest, &chunked_resource(), true, &reporter, &token)
            .await
            .expect("first download");
        let err = acquirer
            .download(&dest, &chunked_resource(), true, &reporter, &token)
            .await
            .expect_err("second download");
        assert!(matches!(err, UpdaterError::Programming(_)));
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn invalid_resource_rejected_before_io() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquirer = ResourceAcquirer::new(Transports {
            peer: None,
            chunked: fake(TransportTier::Chunked, Ok(Vec::new()), &calls),
            http: fake(TransportTier::Http, Ok(Vec::new()), &calls),
        });
        let aggregator = ProgressAggregator::new();
        let err = acquirer
            .download(
                &temp_dest(),
                &RemoteResource::default(),
                true,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect_err("invalid");
        assert!(matches!(err, UpdaterError::InvalidResource(_)));
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn wrong_size_from_tier_is_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquirer = ResourceAcquirer::new(Transports {
            peer: None,
            chunked: fake(TransportTier::Chunked, Ok(b"toolong".to_vec()), &calls),
            http: fake(TransportTier::Http, Ok(Vec::new()), &calls),
        });
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();
        let err = acquirer
            .download(
                &dest,
                &chunked_resource(),
                true,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect_err("size mismatch");
        assert_eq!(err.kind(), crate::errors::FailureKind::TransportFailure);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }
}
