use serde::{Deserialize, Serialize};

use crate::errors::{Result, UpdaterError};

pub type VersionId = u32;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AppInfo {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub use_keys: bool,
    #[serde(default)]
    pub current_version: VersionId,
    #[serde(default)]
    pub lowest_version_with_diff: VersionId,
}

/// Per-chunk SHA-256 hashes; chunk `i` covers
/// `[i * size, min((i + 1) * size, total))`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkMap {
    #[serde(rename = "size")]
    pub chunk_size: u64,
    #[serde(rename = "hashes")]
    pub chunk_hashes: Vec<String>,
}

impl ChunkMap {
    pub fn chunk_count(&self, total: u64) -> usize {
        if self.chunk_size == 0 {
            return 0;
        }
        total.div_ceil(self.chunk_size) as usize
    }

    /// Byte range `[start, end)` of chunk `index` for a resource of `total` bytes.
    pub fn chunk_range(&self, index: usize, total: u64) -> Option<(u64, u64)> {
        if index >= self.chunk_count(total) {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(total);
        Some((start, end))
    }

    pub fn validate(&self, total: u64) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(UpdaterError::InvalidResource(
                "chunk size must be positive".to_string(),
            ));
        }
        let expected = self.chunk_count(total);
        if expected != self.chunk_hashes.len() {
            return Err(UpdaterError::InvalidResource(format!(
                "chunk map lists {} hashes, resource needs {}",
                self.chunk_hashes.len(),
                expected
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContentFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
}

impl ContentFile {
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContentSummary {
    #[serde(rename = "version")]
    pub version_id: VersionId,
    pub size: u64,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub files: Vec<ContentFile>,
    #[serde(default)]
    pub hash_code: String,
    #[serde(default)]
    pub chunks: Option<ChunkMap>,
}

impl ContentSummary {
    pub fn regular_files(&self) -> impl Iterator<Item = &ContentFile> {
        self.files.iter().filter(|file| !file.is_dir())
    }

    pub fn total_file_size(&self) -> u64 {
        self.regular_files().map(|file| file.size).sum()
    }

    pub fn biggest_file_size(&self) -> u64 {
        self.regular_files().map(|file| file.size).max().unwrap_or(0)
    }

    pub fn file(&self, path: &str) -> Option<&ContentFile> {
        self.files.iter().find(|file| file.path == path)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiffOperation {
    Add,
    Modify,
    Remove,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub operation: DiffOperation,
    #[serde(default)]
    pub size: u64,
}

impl DiffEntry {
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DiffSummary {
    #[serde(rename = "version")]
    pub version_id: VersionId,
    pub size: u64,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub entries: Vec<DiffEntry>,
    #[serde(default)]
    pub hash_code: String,
    #[serde(default)]
    pub chunks: Option<ChunkMap>,
}

impl DiffSummary {
    pub fn entries_with(&self, operation: DiffOperation) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.operation == operation)
    }

    pub fn biggest_entry_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.operation != DiffOperation::Remove)
            .map(|entry| entry.size)
            .max()
            .unwrap_or(0)
    }
}

/// Single mirror entry returned by the `*_urls` endpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourceUrl {
    pub url: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteResource {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub torrent_urls: Vec<String>,
    pub size: u64,
    #[serde(default)]
    pub hash_code: String,
    #[serde(default)]
    pub chunk_map: Option<ChunkMap>,
}

impl RemoteResource {
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() && self.torrent_urls.is_empty() {
            return Err(UpdaterError::InvalidResource(
                "resource has no download urls".to_string(),
            ));
        }
        if self.size == 0 {
            return Err(UpdaterError::InvalidResource(
                "resource size must be positive".to_string(),
            ));
        }
        if let Some(map) = self.chunk_map.as_ref() {
            map.validate(self.size)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeySecretResponse {
    pub key_secret: String,
}
