//! Local file system backing the agent's `fs/*` requests

use super::path_guard::PathGuard;
use crate::acp::FileSystem;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// File system handler with an optional granted-root guard
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    guard: Arc<RwLock<PathGuard>>,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(guard: PathGuard) -> Self {
        Self {
            guard: Arc::new(RwLock::new(guard)),
        }
    }

    /// Restrict access to `root` (and any other granted roots)
    pub fn grant(&self, root: impl AsRef<Path>) {
        self.guard.write().grant(root);
    }

    pub fn revoke(&self, root: impl AsRef<Path>) {
        self.guard.write().revoke(root);
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_text_file(&self, path: &Path) -> Result<String> {
        let path = self.guard.read().check(path)?;
        debug!("Reading file: {:?}", path);
        Ok(fs::read_to_string(&path).await?)
    }

    async fn write_text_file(&self, path: &Path, content: &str) -> Result<()> {
        let path = self.guard.read().check(path)?;
        debug!("Writing file: {:?}", path);

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(&path, content).await?;
        info!("Wrote {} bytes to {:?}", content.len(), path);
        Ok(())
    }
}

/// Slice `content` to `limit` lines starting at 1-based `line`
pub fn line_window(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }

    let skip = line.map_or(0, |l| l.saturating_sub(1) as usize);
    let take = limit.map_or(usize::MAX, |l| l as usize);

    content
        .split_inclusive('\n')
        .skip(skip)
        .take(take)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let path = dir.path().join("a/b/c.txt");

        fs.write_text_file(&path, "hello").await.unwrap();
        assert_eq!(fs.read_text_file(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_guard_blocks_outside_paths() {
        let granted = tempdir().unwrap();
        let other = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        fs.grant(granted.path());

        fs.write_text_file(&granted.path().join("ok.txt"), "x")
            .await
            .unwrap();

        let result = fs
            .write_text_file(&other.path().join("nope.txt"), "x")
            .await;
        assert!(matches!(result, Err(Error::AccessDenied(_))));
        assert!(!other.path().join("nope.txt").exists());
    }

    #[tokio::test]
    async fn test_with_guard_and_revoke() {
        let granted = tempdir().unwrap();
        let path = granted.path().join("notes.txt");
        std::fs::write(&path, "kept").unwrap();

        let fs = LocalFileSystem::with_guard(PathGuard::with_roots([granted.path()]));
        assert_eq!(fs.read_text_file(&path).await.unwrap(), "kept");
        assert!(matches!(
            fs.read_text_file(Path::new("/etc/hostname")).await,
            Err(Error::AccessDenied(_))
        ));

        // Revoking the last root lifts the restriction
        fs.revoke(granted.path());
        assert!(fs.read_text_file(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let result = fs.read_text_file(&dir.path().join("missing.txt")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_line_window() {
        let content = "one\ntwo\nthree\nfour\n";
        assert_eq!(line_window(content, None, None), content);
        assert_eq!(line_window(content, Some(2), Some(2)), "two\nthree\n");
        assert_eq!(line_window(content, Some(4), None), "four\n");
        assert_eq!(line_window(content, None, Some(1)), "one\n");
        assert_eq!(line_window(content, Some(10), Some(1)), "");
        assert_eq!(line_window("a\nb", Some(2), None), "b");
    }
}
