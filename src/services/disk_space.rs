use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::errors::{Result, UpdaterError};

/// Headroom kept free on top of every estimate.
pub const DISK_SPACE_RESERVE: u64 = 20 * 1024 * 1024;

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

/// Free bytes on the volume holding `path`, picking the longest matching
/// mount point.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }

    best.map(|(_, available)| available)
        .or_else(|| disks.list().first().map(|disk| disk.available_space()))
}

/// Bytes a content install needs: the package plus its unpacked files.
pub fn content_requirement(package_size: u64, uncompressed_size: u64) -> u64 {
    package_size
        .saturating_add(uncompressed_size.max(package_size))
        .saturating_add(DISK_SPACE_RESERVE)
}

/// Bytes a diff install needs: every package unpacked plus a patched copy of
/// the largest file.
pub fn diff_requirement(packages: &[(u64, u64)], biggest_file: u64) -> u64 {
    packages
        .iter()
        .map(|(size, uncompressed)| size.saturating_add((*uncompressed).max(*size)))
        .fold(0u64, u64::saturating_add)
        .saturating_add(biggest_file)
        .saturating_add(DISK_SPACE_RESERVE)
}

pub fn ensure_available(path: &Path, required: u64) -> Result<()> {
    let Some(available) = available_disk_space(path) else {
        tracing::warn!("free space unknown for {}, continuing", path.display());
        return Ok(());
    };
    tracing::info!(
        "disk space check path={} required={} available={}",
        path.display(),
        required,
        available
    );
    if available < required {
        return Err(UpdaterError::DiskSpace(format!(
            "{} needs {} bytes, {} available",
            path.display(),
            required,
            available
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_include_reserve() {
        assert_eq!(content_requirement(100, 300), 400 + DISK_SPACE_RESERVE);
        assert_eq!(content_requirement(100, 0), 200 + DISK_SPACE_RESERVE);
        assert_eq!(
            diff_requirement(&[(10, 20), (5, 0)], 50),
            30 + 10 + 50 + DISK_SPACE_RESERVE
        );
    }

    #[test]
    fn absurd_requirement_is_rejected() {
        let result = ensure_available(&std::env::temp_dir(), u64::MAX);
        if available_disk_space(&std::env::temp_dir()).is_some() {
            assert!(matches!(result, Err(UpdaterError::DiskSpace(_))));
        }
    }
}
