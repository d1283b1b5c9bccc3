use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Filesystem helpers scoped to one installation directory.
#[derive(Clone, Debug)]
pub struct FileManager {
    install_dir: PathBuf,
}

impl FileManager {
    pub fn new(install_dir: PathBuf) -> Self {
        Self { install_dir }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Resolves an install-relative path, rejecting absolute and `..` components.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let normalized = relative.replace('\\', "/");
        let trimmed = normalized.trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let path = Path::new(trimmed);
        if !is_safe_relative_path(path) {
            return None;
        }
        Some(self.install_dir.join(path))
    }

    /// Removes `dir` and its empty parents up to (not including) the install dir.
    pub fn remove_empty_dirs(&self, dir: &Path) {
        let mut current = dir.to_path_buf();
        while current.starts_with(&self.install_dir) && current != self.install_dir {
            let is_empty = fs::read_dir(&current)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty || fs::remove_dir(&current).is_err() {
                break;
            }
            if !current.pop() {
                break;
            }
        }
    }
}

pub fn is_safe_relative_path(path: &Path) -> bool {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

/// Sibling temp path that never collides with a concurrent writer.
pub fn sibling_temp_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{}.{}.{}", name, Uuid::new_v4().simple(), suffix))
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = sibling_temp_path(path, "tmp");
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Copies `source` over `target` through a sibling temp file.
pub fn copy_atomic(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = sibling_temp_path(target, "copy-tmp");
    let result = (|| {
        fs::copy(source, &temp_path)?;
        File::open(&temp_path)?.sync_all()?;
        fs::rename(&temp_path, target)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

pub fn mmap_read(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: installed files are not truncated while the updater holds the map.
    unsafe { MmapOptions::new().map(&file) }
}

pub fn compute_sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn compute_sha256_file(path: &Path) -> io::Result<String> {
    let len = fs::metadata(path)?.len();
    // Zero-length files cannot be mapped on every platform.
    if len > 0 {
        if let Ok(map) = mmap_read(path) {
            return Ok(compute_sha256_hex(&map));
        }
    }

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn hashes_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("updater-file-{}-{}", label, Uuid::new_v4()))
    }

    #[test]
    fn write_atomic_replaces_contents_without_leftovers() {
        let root = temp_root("atomic");
        let target = root.join("nested").join("state.json");
        write_atomic(&target, b"first").expect("first write");
        write_atomic(&target, b"second").expect("second write");

        assert_eq!(fs::read(&target).expect("read back"), b"second");
        let leftovers = fs::read_dir(target.parent().expect("parent"))
            .expect("list dir")
            .count();
        assert_eq!(leftovers, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn copy_atomic_creates_parents_and_overwrites() {
        let root = temp_root("copy");
        let source = root.join("source.bin");
        let target = root.join("nested/dir/target.bin");
        write_atomic(&source, b"fresh").expect("write source");
        write_atomic(&target, b"stale contents").expect("write target");

        copy_atomic(&source, &target).expect("copy");
        assert_eq!(fs::read(&target).expect("read target"), b"fresh");
        let leftovers = fs::read_dir(target.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let manager = FileManager::new(PathBuf::from("/install"));
        assert!(manager.resolve("../outside").is_none());
        assert!(manager.resolve("/etc/passwd").is_none());
        assert!(manager.resolve("").is_none());
        assert_eq!(
            manager.resolve("data\\level1.bin"),
            Some(PathBuf::from("/install/data/level1.bin"))
        );
    }

    #[test]
    fn file_hash_matches_buffer_hash() {
        let root = temp_root("hash");
        fs::create_dir_all(&root).expect("create root");
        let path = root.join("payload.bin");
        fs::write(&path, b"hello world").expect("write payload");
        let expected = compute_sha256_hex(b"hello world");
        assert_eq!(compute_sha256_file(&path).expect("hash"), expected);

        let empty = root.join("empty.bin");
        fs::write(&empty, b"").expect("write empty");
        assert_eq!(
            compute_sha256_file(&empty).expect("hash empty"),
            compute_sha256_hex(b"")
        );
        let _ = fs::remove_dir_all(root);
    }
}
