//! Repository path resolution.
//!
//! Maps a [`RepositoryRef`] onto an absolute directory inside one of the
//! configured storages. Relative paths are confined to their storage root:
//! absolute paths and `..` components are rejected before touching the
//! file system.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::StorageConfig;
use crate::models::repository::RepositoryRef;
use crate::{AppError, Result};

/// Resolves repository references to absolute paths.
pub trait RepositoryResolver: Send + Sync {
    /// Resolve `repository` to the absolute path of its git directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when the storage is unknown or the path
    /// does not name a git directory, and `AppError::InvalidArgument` when
    /// the relative path escapes its storage.
    fn resolve(&self, repository: &RepositoryRef) -> Result<PathBuf>;
}

/// Resolver backed by the `[[storages]]` table of the configuration.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    storages: Vec<StorageConfig>,
}

impl StorageResolver {
    /// Create a resolver over `storages`.
    #[must_use]
    pub fn new(storages: Vec<StorageConfig>) -> Self {
        Self { storages }
    }
}

impl RepositoryResolver for StorageResolver {
    fn resolve(&self, repository: &RepositoryRef) -> Result<PathBuf> {
        let storage = self
            .storages
            .iter()
            .find(|s| s.name == repository.storage_name)
            .ok_or_else(|| {
                AppError::NotFound(format!("storage '{}' not found", repository.storage_name))
            })?;

        let relative = confined_relative_path(&repository.relative_path)?;
        let path = storage.path.join(relative);

        if !is_git_directory(&path) {
            return Err(AppError::NotFound(format!(
                "repository '{}' not found in storage '{}'",
                repository.relative_path, repository.storage_name
            )));
        }

        debug!(
            storage = %repository.storage_name,
            relative_path = %repository.relative_path,
            path = %path.display(),
            "repository resolved"
        );
        Ok(path)
    }
}

/// Validate that `raw` is a non-empty relative path without parent
/// traversal.
///
/// # Errors
///
/// Returns `AppError::InvalidArgument` for empty, absolute, or traversing paths.
pub fn confined_relative_path(raw: &str) -> Result<&Path> {
    if raw.is_empty() {
        return Err(AppError::InvalidArgument("empty relative path".into()));
    }
    if raw.contains('\0') {
        return Err(AppError::InvalidArgument(
            "relative path contains NUL byte".into(),
        ));
    }

    let path = Path::new(raw);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(AppError::InvalidArgument(format!(
                    "relative path '{raw}' traverses outside its storage"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::InvalidArgument(format!(
                    "relative path '{raw}' must not be absolute"
                )));
            }
        }
    }
    Ok(path)
}

/// A git directory holds `objects/`, `refs/` and a `HEAD` file.
fn is_git_directory(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("refs").is_dir() && path.join("HEAD").is_file()
}
