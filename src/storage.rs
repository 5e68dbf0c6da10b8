//! File-save collaborator: writes finished buffers into the download
//! directory, hands out platform-style save handles, and searches prior
//! downloads by filename.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use regex::RegexBuilder;

use crate::error::DownloadError;
use crate::utils::get_unique_filepath;

#[derive(Debug, Clone)]
pub struct SavedFile {
    /// Save-operation identifier, unique per process. Notifications that
    /// lost their correlation id can still be matched through it.
    pub handle: u64,
    pub path: PathBuf,
}

pub struct Storage {
    download_dir: PathBuf,
    next_handle: AtomicU64,
}

impl Storage {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            next_handle: AtomicU64::new(1),
        }
    }

    pub async fn save_file(&self, bytes: &[u8], filename: &str) -> Result<SavedFile, DownloadError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| DownloadError::SaveFailure(e.to_string()))?;

        let path = get_unique_filepath(&self.download_dir, filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| DownloadError::SaveFailure(e.to_string()))?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!("saved {} bytes to {:?} (handle {})", bytes.len(), path, handle);
        Ok(SavedFile { handle, path })
    }

    /// Case-insensitive filename search over the download directory. The
    /// query is treated as a regular expression, or as a literal when it
    /// does not parse as one.
    pub fn search_prior_downloads(&self, query: &str) -> Vec<PathBuf> {
        let matcher = RegexBuilder::new(query)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(query))
                    .case_insensitive(true)
                    .build()
            });
        let Ok(matcher) = matcher else {
            return Vec::new();
        };

        let pattern = self.download_dir.join("*");
        let Some(pattern) = pattern.to_str().map(|s| s.to_string()) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        match glob::glob(&pattern) {
            Ok(paths) => {
                for entry in paths.flatten() {
                    let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if entry.is_file() && matcher.is_match(name) {
                        found.push(entry);
                    }
                }
            }
            Err(e) => warn!("download directory scan failed: {}", e),
        }
        found.sort();
        found
    }
}
