use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;

use super::{trim_text_snippet, wait_or_cancel, Transport, TransportTier};
use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::models::RemoteResource;
use crate::progress::DownloadReporter;
use crate::services::api_client::is_retryable_status;

enum AttemptError {
    Fatal(UpdaterError),
    NextUrl(String),
    Retry(String),
}

/// Streamed GET with `Range` resume of an existing partial file.
#[derive(Clone)]
pub struct PlainHttpTransport {
    client: reqwest::Client,
    max_attempts: usize,
    retry_backoff: Duration,
    idle_timeout: Duration,
}

impl PlainHttpTransport {
    pub fn new(
        client: reqwest::Client,
        max_attempts: usize,
        retry_backoff: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
            retry_backoff,
            idle_timeout,
        }
    }

    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        size: u64,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> std::result::Result<(), AttemptError> {
        let existing = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.len() <= size => meta.len(),
            _ => 0,
        };
        if existing == size {
            return Ok(());
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }
        let response = tokio::select! {
            sent = request.send() => {
                sent.map_err(|err| AttemptError::Retry(format!("{} -> {}", url, err)))?
            }
            _ = token.cancelled() => return Err(AttemptError::Fatal(UpdaterError::Cancelled)),
        };

        let status = response.status();
        let resume = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK => false,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(AttemptError::Retry(format!("{} -> range rejected", url)));
            }
            StatusCode::NOT_FOUND => {
                return Err(AttemptError::NextUrl(format!("{} -> HTTP 404", url)));
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                let message = format!("{} -> HTTP {} ({})", url, other, trim_text_snippet(&body));
                return Err(if is_retryable_status(other) {
                    AttemptError::Retry(message)
                } else {
                    AttemptError::NextUrl(message)
                });
            }
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(dest)
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        let mut written = if resume { existing } else { 0 };
        reporter.update(written, size);

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
                _ = token.cancelled() => return Err(AttemptError::Fatal(UpdaterError::Cancelled)),
            };
            let next = next.map_err(|_| AttemptError::Retry(format!("{} -> stalled", url)))?;
            let Some(next) = next else { break };
            let bytes = next.map_err(|err| AttemptError::Retry(format!("{} -> {}", url, err)))?;
            if written + bytes.len() as u64 > size {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(AttemptError::NextUrl(format!(
                    "{} -> body exceeds {} bytes",
                    url, size
                )));
            }
            file.write_all(&bytes)
                .await
                .map_err(|err| AttemptError::Fatal(err.into()))?;
            written += bytes.len() as u64;
            reporter.update(written, size);
        }
        file.flush()
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        file.sync_all()
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;

        if written != size {
            return Err(AttemptError::Retry(format!(
                "{} -> received {} of {} bytes",
                url, written, size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for PlainHttpTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::Http
    }

    async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        if resource.urls.is_empty() {
            return Err(UpdaterError::Transport("no http urls".to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut failures: Vec<String> = Vec::new();
        for url in &resource.urls {
            for attempt in 1..=self.max_attempts {
                token.throw_if_cancelled()?;
                tracing::info!(
                    "http download url={} attempt={}/{}",
                    url,
                    attempt,
                    self.max_attempts
                );
                match self.attempt(url, dest, resource.size, reporter, token).await {
                    Ok(()) => return Ok(()),
                    Err(AttemptError::Fatal(err)) => return Err(err),
                    Err(AttemptError::NextUrl(message)) => {
                        tracing::warn!("http url abandoned {}", message);
                        failures.push(message);
                        break;
                    }
                    Err(AttemptError::Retry(message)) => {
                        tracing::warn!("http attempt failed {}", message);
                        failures.push(format!("{} [attempt {}/{}]", message, attempt, self.max_attempts));
                        if attempt < self.max_attempts {
                            wait_or_cancel(self.retry_backoff * attempt as u32, token).await?;
                        }
                    }
                }
            }
        }

        Err(UpdaterError::Transport(format!(
            "all endpoints failed: {}",
            failures.join(" | ")
        )))
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

    fn transport() -> PlainHttpTransport {
        PlainHttpTransport::new(
            reqwest::Client::new(),
            2,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
    }

    fn temp_dest() -> PathBuf {
        std::env::temp_dir()
            .join(format!("updater-http-{}", Uuid::new_v4()))
            .join("package.zip")
    }

    fn resource(urls: Vec<String>, size: u64) -> RemoteResource {
        RemoteResource {
            urls,
            size,
            ..RemoteResource::default()
        }
    }

    #[tokio::test]
    async fn resumes_partial_file_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg"))
            .and(header("range", "bytes=5-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"world".to_vec()))
            .mount(&server)
            .await;
        let dest = temp_dest();
        fs::create_dir_all(dest.parent().expect("parent")).expect("create dir");
        fs::write(&dest, b"hello").expect("seed partial");

        let aggregator = ProgressAggregator::new();
        transport()
            .download(
                &dest,
                &resource(vec![format!("{}/pkg", server.uri())], 10),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), b"helloworld");
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn full_response_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"helloworld".to_vec()))
            .mount(&server)
            .await;
        let dest = temp_dest();
        fs::create_dir_all(dest.parent().expect("parent")).expect("create dir");
        fs::write(&dest, b"junk").expect("seed partial");

        let aggregator = ProgressAggregator::new();
        transport()
            .download(
                &dest,
                &resource(vec![format!("{}/pkg", server.uri())], 10),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), b"helloworld");
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn falls_over_to_next_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;
        let dest = temp_dest();

        let aggregator = ProgressAggregator::new();
        transport()
            .download(
                &dest,
                &resource(
                    vec![
                        format!("{}/missing", server.uri()),
                        format!("{}/mirror", server.uri()),
                    ],
                    3,
                ),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("download");
        assert_eq!(fs::read(&dest).expect("read dest"), b"abc");
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn wrong_size_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/short"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ab".to_vec()))
            .mount(&server)
            .await;
        let dest = temp_dest();

        let aggregator = ProgressAggregator::new();
        let err = transport()
            .download(
                &dest,
                &resource(vec![format!("{}/short", server.uri())], 3),
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect_err("short body");
        assert_eq!(err.kind(), crate::errors::FailureKind::TransportFailure);
        let _ = fs::remove_dir_all(dest.parent().expect("parent"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_request_awaiting_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"abc".to_vec())
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
                &resource(vec![format!("{}/slow", server.uri())], 3),
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
