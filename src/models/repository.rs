//! Repository reference carried in the header message of every call.

use serde::{Deserialize, Serialize};

/// Identifies a repository on disk by storage and storage-relative path.
///
/// Resolved to an absolute path by a [`RepositoryResolver`](crate::storage::RepositoryResolver)
/// before any process is spawned. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RepositoryRef {
    /// Storage identifier, matching a configured storage name.
    pub storage_name: String,
    /// Path of the repository relative to the storage root.
    pub relative_path: String,
    /// Alternate object directories, relative to the repository path.
    #[serde(default)]
    pub alternate_object_directories: Vec<String>,
}

impl RepositoryRef {
    /// Construct a reference without alternate object directories.
    #[must_use]
    pub fn new(storage_name: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            storage_name: storage_name.into(),
            relative_path: relative_path.into(),
            alternate_object_directories: Vec::new(),
        }
    }

    /// Attach alternate object directories.
    #[must_use]
    pub fn with_alternates(mut self, alternates: Vec<String>) -> Self {
        self.alternate_object_directories = alternates;
        self
    }
}
