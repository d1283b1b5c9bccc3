use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::progress::StepReporter;

/// Extracts a zip package into `output_dir`, returning the relative paths of
/// the extracted files. Entries that would escape `output_dir` are skipped.
pub fn extract_zip_archive(
    archive_path: &Path,
    output_dir: &Path,
    token: &CancellationToken,
    reporter: Option<&StepReporter>,
) -> Result<Vec<String>> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(output_dir)?;

    let total = archive.len();
    let mut extracted = Vec::new();
    for index in 0..total {
        token.throw_if_cancelled()?;
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(collapse_parents) else {
            tracing::warn!("skipping unsafe archive entry name={}", entry.name());
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let out_path = output_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile)?;
            extracted.push(slash_path(&relative));
        }

        if let Some(reporter) = reporter {
            reporter.set_ratio(index + 1, total);
        }
    }
    if let Some(reporter) = reporter {
        reporter.set(1.0);
    }

    tracing::info!(
        "unarchived package={} files={}",
        archive_path.display(),
        extracted.len()
    );
    Ok(extracted)
}

/// Resolves `..` inside an already enclosed entry name.
fn collapse_parents(enclosed: &Path) -> PathBuf {
    let mut relative = PathBuf::new();
    for component in enclosed.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                relative.pop();
            }
            _ => {}
        }
    }
    relative
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// [`extract_zip_archive`] on the blocking pool.
pub async fn extract_zip_blocking(
    archive_path: PathBuf,
    output_dir: PathBuf,
    token: CancellationToken,
    reporter: Option<StepReporter>,
) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || {
        extract_zip_archive(&archive_path, &output_dir, &token, reporter.as_ref())
    })
    .await
    .map_err(|err| UpdaterError::Programming(format!("unarchive join error: {err}")))?
}
