//! Granted-root checks for agent file access

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Set of directory roots the agent may touch
///
/// An empty guard allows every path. Once a root is granted, only paths
/// inside a granted root pass.
#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut guard = Self::new();
        for root in roots {
            guard.grant(root);
        }
        guard
    }

    /// Grant access to a directory tree
    pub fn grant(&mut self, root: impl AsRef<Path>) {
        let root = normalize_path(root.as_ref());
        if !self.roots.contains(&root) {
            info!("Granting access to: {:?}", root);
            self.roots.push(root);
        }
    }

    pub fn revoke(&mut self, root: impl AsRef<Path>) {
        let root = normalize_path(root.as_ref());
        self.roots.retain(|r| r != &root);
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_restricted(&self) -> bool {
        !self.roots.is_empty()
    }

    /// Resolve a path, failing if it falls outside every granted root
    pub fn check(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = normalize_path(path.as_ref());
        if !self.is_restricted() || self.roots.iter().any(|root| path.starts_with(root)) {
            return Ok(path);
        }
        Err(Error::AccessDenied(format!(
            "{} is outside the granted directories",
            path.display()
        )))
    }
}

/// Expand `~`, canonicalize the longest existing prefix and fold `..`
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let expanded = clean_path(&expand_home(path));

    if let Ok(canonical) = expanded.canonicalize() {
        return canonical;
    }

    // Canonicalize the deepest existing ancestor so /tmp -> /private/tmp
    // style symlinks agree with granted roots
    let mut current = expanded.as_path();
    let mut remaining = Vec::new();
    while !current.exists() {
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                remaining.push(name.to_owned());
                current = parent;
            }
            _ => break,
        }
    }

    let mut result = current
        .canonicalize()
        .unwrap_or_else(|_| current.to_path_buf());
    for part in remaining.into_iter().rev() {
        result.push(part);
    }

    clean_path(&result)
}

pub(crate) fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Clean a path without requiring it to exist
fn clean_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => components.push(Component::ParentDir),
            },
            Component::CurDir => {}
            c => components.push(c),
        }
    }

    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_guard_allows_everything() {
        let guard = PathGuard::new();
        assert!(!guard.is_restricted());
        assert!(guard.check("/etc/hosts").is_ok());
    }

    #[test]
    fn test_paths_inside_granted_root() {
        let dir = tempdir().unwrap();
        let guard = PathGuard::with_roots([dir.path()]);

        assert!(guard.check(dir.path().join("src/new_file.rs")).is_ok());
        assert!(guard.check(dir.path()).is_ok());
    }

    #[test]
    fn test_parent_escape_is_denied() {
        let dir = tempdir().unwrap();
        let guard = PathGuard::with_roots([dir.path().join("project")]);

        let escaped = dir.path().join("project/../secrets.txt");
        match guard.check(&escaped) {
            Err(Error::AccessDenied(msg)) => assert!(msg.contains("secrets.txt")),
            other => panic!("expected AccessDenied, got {other:?}"),
        }
    }

    #[test]
    fn test_revoke() {
        let dir = tempdir().unwrap();
        let mut guard = PathGuard::with_roots([dir.path()]);
        guard.grant(dir.path());
        assert_eq!(guard.roots().len(), 1);

        guard.revoke(dir.path());
        assert!(!guard.is_restricted());
    }

    #[test]
    fn test_home_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/bin/agent")), home.join("bin/agent"));
        }
        assert_eq!(expand_home(Path::new("/usr/bin")), PathBuf::from("/usr/bin"));
    }
}
