use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{trim_text_snippet, wait_or_cancel, Transport, TransportTier};
use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::models::{ChunkMap, RemoteResource};
use crate::progress::DownloadReporter;
use crate::services::api_client::is_retryable_status;
use crate::utils::file::{compute_sha256_hex, hashes_match};

enum ChunkFailure {
    /// Drop this URL from rotation.
    Gone(String),
    Retry(String),
}

/// Ranged GET per chunk, each chunk hash-checked before it is written.
#[derive(Clone)]
pub struct ChunkedHttpTransport {
    client: reqwest::Client,
    max_attempts: usize,
    retry_backoff: Duration,
    request_timeout: Duration,
}

impl ChunkedHttpTransport {
    pub fn new(
        client: reqwest::Client,
        max_attempts: usize,
        retry_backoff: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
            retry_backoff,
            request_timeout,
        }
    }

    async fn fetch_chunk(
        &self,
        url: &str,
        start: u64,
        end: u64,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<u8>, ChunkFailure> {
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .timeout(self.request_timeout)
            .send();
        let response = tokio::select! {
            sent = request => sent.map_err(|err| ChunkFailure::Retry(format!("{} -> {}", url, err)))?,
            _ = token.cancelled() => return Err(ChunkFailure::Retry("cancelled".to_string())),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ChunkFailure::Gone(format!("{} -> HTTP 404", url)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{} -> HTTP {} ({})", url, status, trim_text_snippet(&body));
            return Err(if is_retryable_status(status) {
                ChunkFailure::Retry(message)
            } else {
                ChunkFailure::Gone(message)
            });
        }

        // A 200 carries the whole resource; keep only the chunk window.
        let mut position = if status == StatusCode::PARTIAL_CONTENT {
            start
        } else {
            0
        };
        let mut data = Vec::with_capacity((end - start).min(16 * 1024 * 1024) as usize);
        let mut stream = response.bytes_stream();
        while position < end {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = token.cancelled() => return Err(ChunkFailure::Retry("cancelled".to_string())),
            };
            let Some(next) = next else { break };
            let bytes = next.map_err(|err| ChunkFailure::Retry(format!("{} -> {}", url, err)))?;
            let piece_start = position;
            let piece_end = position + bytes.len() as u64;
            position = piece_end;
            if piece_end <= start {
                continue;
            }
            let from = start.saturating_sub(piece_start) as usize;
            let to = (end.min(piece_end) - piece_start) as usize;
            data.extend_from_slice(&bytes[from..to]);
        }

        if data.len() as u64 != end - start {
            return Err(ChunkFailure::Retry(format!(
                "{} -> short chunk {} of {} bytes",
                url,
                data.len(),
                end - start
            )));
        }
        Ok(data)
    }
}

/// Length of the leading run of chunks already on disk with matching hashes.
fn verified_prefix(dest: &Path, map: &ChunkMap, total: u64) -> Result<u64> {
    let mut file = match std::fs::File::open(dest) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let existing = file.metadata()?.len();
    let mut verified = 0u64;
    let mut buffer = Vec::new();
    for index in 0..map.chunk_count(total) {
        let Some((start, end)) = map.chunk_range(index, total) else {
            break;
        };
        if end > existing {
            break;
        }
        buffer.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buffer)?;
        if !hashes_match(&compute_sha256_hex(&buffer), &map.chunk_hashes[index]) {
            break;
        }
        verified = end;
    }
    Ok(verified)
}

#[async_trait]
impl Transport for ChunkedHttpTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::Chunked
    }

    async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        let map = resource.chunk_map.as_ref().ok_or_else(|| {
            UpdaterError::InvalidResource("chunked transfer needs a chunk map".to_string())
        })?;
        map.validate(resource.size)?;
        if resource.urls.is_empty() {
            return Err(UpdaterError::Transport("no http urls for chunked transfer".to_string()));
        }

        let total = resource.size;
        let resume_from = {
            let dest = dest.to_path_buf();
            let map = map.clone();
            tokio::task::spawn_blocking(move || verified_prefix(&dest, &map, total))
                .await
                .map_err(|err| UpdaterError::Programming(format!("resume scan join error: {err}")))??
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dest)
            .await?;
        file.set_len(resume_from).await?;

        let first_chunk = if map.chunk_size == 0 {
            0
        } else {
            (resume_from / map.chunk_size) as usize
        };
        tracing::info!(
            "chunked download start dest={} size={} chunks={} resume_chunk={}",
            dest.display(),
            total,
            map.chunk_count(total),
            first_chunk
        );
        reporter.update(resume_from, total);

        let mut urls = resource.urls.clone();
        let mut rotation = 0usize;

        for index in first_chunk..map.chunk_count(total) {
            let Some((start, end)) = map.chunk_range(index, total) else {
                break;
            };
            let expected = &map.chunk_hashes[index];
            let mut failures: Vec<String> = Vec::new();
            let mut attempt = 0usize;

            let data = loop {
                token.throw_if_cancelled()?;
                if urls.is_empty() {
                    return Err(UpdaterError::Transport(format!(
                        "chunk {} failed, no urls left: {}",
                        index,
                        failures.join(" | ")
                    )));
                }
                if attempt >= self.max_attempts {
                    return Err(UpdaterError::Transport(format!(
                        "chunk {} failed after {} attempts: {}",
                        index,
                        attempt,
                        failures.join(" | ")
                    )));
                }
                attempt += 1;

                let slot = rotation % urls.len();
                let url = urls[slot].clone();
                match self.fetch_chunk(&url, start, end, token).await {
                    Ok(data) if hashes_match(&compute_sha256_hex(&data), expected) => break data,
                    Ok(_) => {
                        token.throw_if_cancelled()?;
                        failures.push(format!("{} -> hash mismatch [attempt {}]", url, attempt));
                        rotation += 1;
                    }
                    Err(ChunkFailure::Gone(message)) => {
                        token.throw_if_cancelled()?;
                        tracing::warn!("removing url from rotation chunk={} {}", index, message);
                        failures.push(message);
                        urls.remove(slot);
                        continue;
                    }
                    Err(ChunkFailure::Retry(message)) => {
                        token.throw_if_cancelled()?;
                        failures.push(format!("{} [attempt {}]", message, attempt));
                        rotation += 1;
                    }
                }
                tracing::warn!(
                    "chunk retry index={} attempt={}/{}",
                    index,
                    attempt,
                    self.max_attempts
                );
                wait_or_cancel(self.retry_backoff * attempt as u32, token).await?;
            };

            file.seek(std::io::SeekFrom::Start(start)).await?;
            file.write_all(&data).await?;
            reporter.update(end, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        let written = file.metadata().await?.len();
        if written != total {
            return Err(UpdaterError::Transport(format!(
                "chunked download wrote {} of {} bytes",
                written, total
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::progress::ProgressAggregator;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> Vec<u8> {
        (0..10u8).collect()
    }

    fn resource(urls: Vec<String>) -> RemoteResource {
        let data = payload();
        RemoteResource {
            urls,
            torrent_urls: Vec::new(),
            size: data.len() as u64,
            hash_code: String::new(),
            chunk_map: Some(ChunkMap {
                chunk_size: 4,
                chunk_hashes: data.chunks(4).map(compute_sha256_hex).collect(),
            }),
        }
    }

    fn transport() -> ChunkedHttpTransport {
        ChunkedHttpTransport::new(
            reqwest::Client::new(),
            3,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
    }

    fn temp_dest() -> PathBuf {
        std::env::temp_dir()
            .join(format!("updater-chunked-{}", Uuid::new_v4()))
            .join("package.zip")
    }

    async fn mount_chunks(server: &MockServer, route: &str) {
        let data = payload();
        for (start, end) in [(0usize, 4usize), (4, 8), (8, 10)] {
            Mock::given(method("GET"))
                .and(path(route))
                .and(header("range", format!("bytes={}-{}", start, end - 1).as_str()))
                .respond_with(ResponseTemplate::new(206).set_body_bytes(data[start..end].to_vec()))
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn downloads_and_verifies_every_chunk() {
        let server = MockServer::start().await;
        mount_chunks(&server, "/pkg").await;
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();
        let reporter = aggregator.add_download_progress(1.0);

        transport()
            .download(
                &dest,
                &resource(vec![format!("{}/pkg", server.uri())]),
                &reporter,
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), payload());
        assert_eq!(aggregator.overall().download_bytes, 10);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn missing_url_is_dropped_from_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        mount_chunks(&server, "/live").await;
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();

        transport()
            .download(
                &dest,
                &resource(vec![
                    format!("{}/gone", server.uri()),
                    format!("{}/live", server.uri()),
                ]),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), payload());
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn resumes_after_verified_prefix() {
        let server = MockServer::start().await;
        let data = payload();
        Mock::given(method("GET"))
            .and(path("/pkg"))
            .and(header("range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        mount_chunks(&server, "/pkg").await;

        let dest = temp_dest();
        fs::create_dir_all(dest.parent().expect("parent")).expect("create dir");
        // First chunk intact, second chunk garbage.
        let mut partial = data[..4].to_vec();
        partial.extend_from_slice(&[0xff, 0xff]);
        fs::write(&dest, &partial).expect("seed partial");

        let aggregator = ProgressAggregator::new();
        transport()
            .download(
                &dest,
                &resource(vec![format!("{}/pkg", server.uri())]),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), data);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn corrupt_chunks_exhaust_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![9u8; 4]))
            .mount(&server)
            .await;
        let dest = temp_dest();
        let aggregator = ProgressAggregator::new();

        let err = transport()
            .download(
                &dest,
                &resource(vec![format!("{}/bad", server.uri())]),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect_err("hash mismatch");
        assert!(matches!(err, UpdaterError::Transport(_)));
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_request_awaiting_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(payload()[0..4].to_vec())
                    .set_delay(Duration::from_secs(8)),
            )
            .mount(&server)
            .await;
        let dest = temp_dest();
        let (source, token) = CancellationSource::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            source.cancel().expect("cancel");
        });

        let aggregator = ProgressAggregator::new();
        let started = std::time::Instant::now();
        let err = transport()
            .download(
                &dest,
                &resource(vec![format!("{}/slow", server.uri())]),
                &aggregator.add_download_progress(1.0),
                &token,
            )
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled(), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }
}
