//! Peer-to-peer tier driven through an external torrent-client process.
//!
//! The client speaks a line protocol on stdin (`add-torrent <file> <dir>`,
//! `status`) and answers with a JSON document terminated by `#=end`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{wait_or_cancel, Transport, TransportTier};
use crate::cancellation::{run_cancellable, CancellationToken};
use crate::errors::{Result, UpdaterError};
use crate::models::RemoteResource;
use crate::progress::DownloadReporter;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESPONSE_TERMINATOR: &[u8] = b"#=end";
const RESPONSE_LIMIT: usize = 1024 * 1024;

#[derive(Deserialize, Debug)]
struct ClientMessage {
    status: String,
    #[serde(default)]
    data: Option<StatusData>,
}

#[derive(Deserialize, Debug, Default)]
struct StatusData {
    #[serde(default)]
    count: usize,
    #[serde(default)]
    torrents: Vec<TorrentStatus>,
}

#[derive(Deserialize, Debug, Default)]
struct TorrentStatus {
    #[serde(default)]
    error: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    is_seeding: bool,
}

fn peer_error(message: impl Into<String>) -> UpdaterError {
    UpdaterError::Transport(format!("torrent: {}", message.into()))
}

fn client_path_arg(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").replace(' ', "\\ ")
}

fn with_suffix(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

struct TorrentClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl TorrentClient {
    fn spawn(program: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| peer_error(format!("cannot start {}: {}", program.display(), err)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| peer_error("client stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| peer_error("client stdout unavailable"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn execute(&mut self, command: &str, token: &CancellationToken) -> Result<ClientMessage> {
        tracing::debug!("torrent-client command={}", command);
        self.stdin.write_all(command.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let raw = tokio::select! {
            raw = read_response(&mut self.stdout) => raw?,
            _ = token.cancelled() => return Err(UpdaterError::Cancelled),
        };
        serde_json::from_str(raw.trim())
            .map_err(|err| peer_error(format!("bad response to {}: {}", command, err)))
    }

    async fn shutdown(mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!("torrent-client kill failed: {}", err);
        }
    }
}

async fn read_response(stdout: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut buffer = Vec::new();
    while !buffer.ends_with(RESPONSE_TERMINATOR) {
        let byte = stdout
            .read_u8()
            .await
            .map_err(|err| peer_error(format!("client closed output: {}", err)))?;
        buffer.push(byte);
        if buffer.len() > RESPONSE_LIMIT {
            return Err(peer_error("response too large"));
        }
    }
    buffer.truncate(buffer.len() - RESPONSE_TERMINATOR.len());
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

/// Fetches the `.torrent` over HTTP, lets the client download next to the
/// destination and moves the result into place.
#[derive(Clone)]
pub struct TorrentTransport {
    client_program: PathBuf,
    http: reqwest::Client,
    stall_timeout: Duration,
}

impl TorrentTransport {
    pub fn new(client_program: PathBuf, http: reqwest::Client, stall_timeout: Duration) -> Self {
        Self {
            client_program,
            http,
            stall_timeout,
        }
    }

    async fn fetch_torrent_file(
        &self,
        urls: &[String],
        target: &Path,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut last_error = String::from("no torrent urls");
        for url in urls {
            let sent = run_cancellable(token, async {
                Ok::<_, UpdaterError>(self.http.get(url).send().await)
            })
            .await?;
            match sent {
                Ok(response) if response.status().is_success() => {
                    let bytes = run_cancellable(token, async {
                        Ok::<_, UpdaterError>(response.bytes().await?)
                    })
                    .await?;
                    tokio::fs::write(target, &bytes).await?;
                    return Ok(());
                }
                Ok(response) => last_error = format!("{} -> HTTP {}", url, response.status()),
                Err(err) => last_error = format!("{} -> {}", url, err),
            }
        }
        Err(peer_error(format!("unable to fetch torrent file: {}", last_error)))
    }

    async fn run(
        &self,
        dest: &Path,
        torrent_file: &Path,
        download_dir: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        self.fetch_torrent_file(&resource.torrent_urls, torrent_file, token)
            .await?;
        tokio::fs::create_dir_all(download_dir).await?;

        let mut client = TorrentClient::spawn(&self.client_program)?;
        let result = self
            .drive(&mut client, torrent_file, download_dir, resource, reporter, token)
            .await;
        client.shutdown().await;
        result?;

        let downloaded = first_file_in(download_dir).await?;
        if tokio::fs::metadata(dest).await.is_ok() {
            tokio::fs::remove_file(dest).await?;
        }
        tokio::fs::rename(&downloaded, dest).await?;

        let size = tokio::fs::metadata(dest).await?.len();
        if size != resource.size {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(peer_error(format!(
                "downloaded {} bytes, expected {}",
                size, resource.size
            )));
        }
        Ok(())
    }

    async fn drive(
        &self,
        client: &mut TorrentClient,
        torrent_file: &Path,
        download_dir: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        let command = format!(
            "add-torrent {} {}",
            client_path_arg(torrent_file),
            client_path_arg(download_dir)
        );
        let added = client.execute(&command, token).await?;
        if added.status != "ok" {
            return Err(peer_error(format!("add-torrent answered {}", added.status)));
        }

        let mut last_progress = 0.0f64;
        let mut last_change = Instant::now();
        loop {
            token.throw_if_cancelled()?;
            let status = client.execute("status", token).await?;
            if status.status != "ok" {
                return Err(peer_error(format!("status answered {}", status.status)));
            }
            let data = status.data.unwrap_or_default();
            if data.count < 1 {
                return Err(peer_error("torrent is not listed"));
            }
            let Some(torrent) = data.torrents.first() else {
                return Err(peer_error("torrent is not listed"));
            };
            if !torrent.error.is_empty() {
                return Err(peer_error(torrent.error.clone()));
            }

            let progress = torrent.progress.clamp(0.0, 1.0);
            if progress > last_progress {
                last_progress = progress;
                last_change = Instant::now();
            }
            reporter.update((resource.size as f64 * progress) as u64, resource.size);

            if torrent.is_seeding {
                return Ok(());
            }
            if last_change.elapsed() > self.stall_timeout {
                return Err(peer_error(format!(
                    "timed out at {:.1}% after {:?} without progress",
                    progress * 100.0,
                    self.stall_timeout
                )));
            }
            wait_or_cancel(STATUS_POLL_INTERVAL, token).await?;
        }
    }
}

async fn first_file_in(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            return Ok(entry.path());
        }
    }
    Err(peer_error("missing files in torrent download directory"))
}

#[async_trait]
impl Transport for TorrentTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::Peer
    }

    async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        if resource.torrent_urls.is_empty() {
            return Err(peer_error("resource has no torrent urls"));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let torrent_file = with_suffix(dest, ".torrent");
        let download_dir = with_suffix(dest, ".torrent_dir");

        tracing::info!(
            "torrent download start dest={} client={}",
            dest.display(),
            self.client_program.display()
        );
        let result = self
            .run(dest, &torrent_file, &download_dir, resource, reporter, token)
            .await;

        if let Err(err) = tokio::fs::remove_dir_all(&download_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("unable to clean torrent dir {}: {}", download_dir.display(), err);
            }
        }
        if let Err(err) = tokio::fs::remove_file(&torrent_file).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("unable to clean torrent file {}: {}", torrent_file.display(), err);
            }
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::progress::ProgressAggregator;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEEDING_CLIENT: &str = r#"#!/bin/sh
while read cmd a b; do
  case "$cmd" in
    add-torrent)
      mkdir -p "$b"
      printf 'peer-bytes' > "$b/package.bin"
      printf '{"status":"ok"}#=end' ;;
    status)
      printf '{"status":"ok","data":{"count":1,"torrents":[{"error":"","progress":1.0,"is_seeding":true}]}}#=end' ;;
  esac
done
"#;

    const STALLED_CLIENT: &str = r#"#!/bin/sh
while read cmd a b; do
  case "$cmd" in
    add-torrent) printf '{"status":"ok"}#=end' ;;
    status)
      printf '{"status":"ok","data":{"count":1,"torrents":[{"error":"","progress":0.0,"is_seeding":false}]}}#=end' ;;
  esac
done
"#;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("torrent-client.sh");
        fs::write(&script, body).expect("write script");
        let mut perms = fs::metadata(&script).expect("script meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod script");
        script
    }

    async fn torrent_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg.torrent"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"d4:infoe".to_vec()))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn seeding_client_moves_file_into_place() {
        let server = torrent_server().await;
        let dir = std::env::temp_dir().join(format!("updater-peer-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create dir");
        let script = write_script(&dir, SEEDING_CLIENT);
        let dest = dir.join("package.zip");
        let resource = RemoteResource {
            torrent_urls: vec![format!("{}/pkg.torrent", server.uri())],
            size: 10,
            ..RemoteResource::default()
        };

        let transport = TorrentTransport::new(script, reqwest::Client::new(), Duration::from_secs(5));
        let aggregator = ProgressAggregator::new();
        transport
            .download(
                &dest,
                &resource,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect("peer download");

        assert_eq!(fs::read(&dest).expect("read dest"), b"peer-bytes");
        assert!(!dir.join("package.zip.torrent").exists());
        assert!(!dir.join("package.zip.torrent_dir").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stalled_client_times_out() {
        let server = torrent_server().await;
        let dir = std::env::temp_dir().join(format!("updater-peer-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create dir");
        let script = write_script(&dir, STALLED_CLIENT);
        let dest = dir.join("package.zip");
        let resource = RemoteResource {
            torrent_urls: vec![format!("{}/pkg.torrent", server.uri())],
            size: 10,
            ..RemoteResource::default()
        };

        let transport =
            TorrentTransport::new(script, reqwest::Client::new(), Duration::from_millis(200));
        let aggregator = ProgressAggregator::new();
        let err = transport
            .download(
                &dest,
                &resource,
                &aggregator.add_download_progress(1.0),
                &CancellationToken::none(),
            )
            .await
            .expect_err("stalled");
        assert!(matches!(err, UpdaterError::Transport(_)));
        assert!(!dest.exists());
        assert!(!dir.join("package.zip.torrent_dir").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_slow_torrent_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.torrent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"d4:infoe".to_vec())
                    .set_delay(Duration::from_secs(8)),
            )
            .mount(&server)
            .await;
        let dir = std::env::temp_dir().join(format!("updater-peer-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create dir");
        let (source, token) = CancellationSource::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            source.cancel().expect("cancel");
        });

        let transport = TorrentTransport::new(
            PathBuf::from("unused-client"),
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let started = std::time::Instant::now();
        let err = transport
            .fetch_torrent_file(
                &[format!("{}/slow.torrent", server.uri())],
                &dir.join("package.zip.torrent"),
                &token,
            )
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled(), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!dir.join("package.zip.torrent").exists());
        let _ = fs::remove_dir_all(dir);
    }
}
