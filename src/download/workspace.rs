//! Scoped temp directories for one download.
//!
//! The directory lives under the configured download root and is removed
//! when the workspace is closed or dropped, whichever comes first.

use fs_err::tokio as fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::core::error::AppResult;

#[derive(Debug)]
pub struct TempWorkspace {
    download_id: i64,
    dir: TempDir,
}

impl TempWorkspace {
    /// Creates `<root>/ytdl_<id>_XXXX`, creating `root` when missing.
    pub async fn create(root: &Path, download_id: i64) -> AppResult<Self> {
        fs::create_dir_all(root).await?;
        let prefix = format!("ytdl_{}_", download_id);
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;
        log::debug!("Created workspace {} for download {}", dir.path().display(), download_id);
        Ok(Self { download_id, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn download_id(&self) -> i64 {
        self.download_id
    }

    /// Largest regular file in the workspace with its size.
    pub async fn largest_file(&self) -> AppResult<Option<(PathBuf, u64)>> {
        let mut entries = fs::read_dir(self.dir.path()).await?;
        let mut largest: Option<(PathBuf, u64)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let size = metadata.len();
            if largest.as_ref().map_or(true, |(_, best)| size > *best) {
                largest = Some((entry.path(), size));
            }
        }
        Ok(largest)
    }

    /// Removes the directory and everything in it.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => log::debug!("Removed workspace {}", path.display()),
            Err(e) => log::warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_prefix_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let workspace = TempWorkspace::create(&root.path().join("downloads"), 42).await.unwrap();
        let path = workspace.path().to_path_buf();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ytdl_42_"), "{}", name);
        assert!(path.exists());

        workspace.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = TempWorkspace::create(root.path(), 7).await.unwrap();
            fs::write(workspace.path().join("a.mp4"), b"data").await.unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_largest_file_is_selected() {
        let root = tempfile::tempdir().unwrap();
        let workspace = TempWorkspace::create(root.path(), 1).await.unwrap();
        assert_eq!(workspace.largest_file().await.unwrap(), None);

        fs::write(workspace.path().join("thumb.jpg"), vec![0u8; 10]).await.unwrap();
        fs::write(workspace.path().join("video.mp4"), vec![0u8; 100]).await.unwrap();
        fs::create_dir(workspace.path().join("sub")).await.unwrap();

        let (path, size) = workspace.largest_file().await.unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), "video.mp4");
        assert_eq!(size, 100);
    }
}
