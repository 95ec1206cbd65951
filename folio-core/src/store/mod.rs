//! Project persistence seam.
//!
//! The collaboration relay and the compile queue only ever talk to storage
//! through [`ProjectStore`]: read/write a file of a project, find a
//! project's owner, and find the owner's on-disk directory for it.
//!
//! ```text
//! ┌──────────────┐  read (hydration)   ┌──────────────┐
//! │ Room actor   │ ──────────────────► │              │
//! ├──────────────┤  write (debounced)  │ ProjectStore │
//! │ Debouncer    │ ──────────────────► │  (Fs/Memory) │
//! ├──────────────┤  owner + directory  │              │
//! │ Compile run  │ ──────────────────► │              │
//! └──────────────┘                     └──────────────┘
//! ```

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::ids::{ResourceId, UserId};

pub use fs::FsProjectStore;
pub use memory::MemoryProjectStore;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("invalid file path: {0}")]
    InvalidPath(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence collaborator consumed by the relay, the debouncer and the
/// compile runner.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Content of `path` inside the resource, `None` when the file does not exist.
    async fn read_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn write_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn resolve_resource_owner(&self, resource: &ResourceId) -> Result<UserId, StoreError>;

    /// Absolute directory holding the owner's copy of the resource.
    async fn resolve_resource_directory(
        &self,
        owner: &UserId,
        resource: &ResourceId,
    ) -> Result<PathBuf, StoreError>;

    /// Whether `user` owns or collaborates on `resource`.
    async fn has_access(&self, user: &UserId, resource: &ResourceId) -> Result<bool, StoreError>;
}

/// Join a client-supplied relative path onto `dir`, refusing anything that
/// could leave it.
pub fn resolve_within(dir: &Path, path: &str) -> Result<PathBuf, StoreError> {
    let relative = Path::new(path);
    let mut resolved = dir.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(resolved)
}
