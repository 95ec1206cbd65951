//! Filesystem-backed project store.
//!
//! Layout:
//! ```text
//! <root>/
//! ├── projects.json          resource id → { owner, collaborators }
//! └── <owner>/<resource>/    the owner's working copy (sources, logs, PDFs)
//! ```
//!
//! Every collaborator reads and writes the owner's copy; there is no
//! per-collaborator mirror.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{resolve_within, ProjectStore, StoreError};
use crate::ids::{ResourceId, UserId};

const MANIFEST_FILE: &str = "projects.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectRecord {
    owner: UserId,
    #[serde(default)]
    collaborators: Vec<UserId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    projects: BTreeMap<ResourceId, ProjectRecord>,
}

pub struct FsProjectStore {
    root: PathBuf,
    manifest: RwLock<Manifest>,
}

impl FsProjectStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let manifest = match tokio::fs::read(root.join(MANIFEST_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Manifest(e.to_string()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Manifest::default(),
            Err(e) => return Err(e.into()),
        };
        log::info!(
            "Opened project store at {} ({} projects)",
            root.display(),
            manifest.projects.len()
        );

        Ok(Self {
            root,
            manifest: RwLock::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record a new project and create its directory.
    pub async fn register_project(
        &self,
        resource: ResourceId,
        owner: UserId,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.directory_for(&owner, &resource)?;
        tokio::fs::create_dir_all(&dir).await?;

        let mut manifest = self.manifest.write().await;
        manifest.projects.insert(
            resource,
            ProjectRecord {
                owner,
                collaborators: Vec::new(),
            },
        );
        self.save(&manifest).await?;
        Ok(dir)
    }

    pub async fn add_collaborator(
        &self,
        resource: &ResourceId,
        user: UserId,
    ) -> Result<(), StoreError> {
        let mut manifest = self.manifest.write().await;
        let record = manifest
            .projects
            .get_mut(resource)
            .ok_or_else(|| StoreError::NotFound(resource.clone()))?;
        if !record.collaborators.contains(&user) {
            record.collaborators.push(user);
        }
        self.save(&manifest).await
    }

    async fn save(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| StoreError::Manifest(e.to_string()))?;
        let tmp = self.root.join(format!("{MANIFEST_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.root.join(MANIFEST_FILE)).await?;
        Ok(())
    }

    fn directory_for(&self, owner: &UserId, resource: &ResourceId) -> Result<PathBuf, StoreError> {
        let owner_dir = resolve_within(&self.root, owner.as_str())?;
        resolve_within(&owner_dir, resource.as_str())
    }

    async fn file_path(&self, resource: &ResourceId, path: &str) -> Result<PathBuf, StoreError> {
        let owner = self.resolve_resource_owner(resource).await?;
        let dir = self.directory_for(&owner, resource)?;
        resolve_within(&dir, path)
    }
}

#[async_trait]
impl ProjectStore for FsProjectStore {
    async fn read_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        let file = self.file_path(resource, path).await?;
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let file = self.file_path(resource, path).await?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        Ok(())
    }

    async fn resolve_resource_owner(&self, resource: &ResourceId) -> Result<UserId, StoreError> {
        self.manifest
            .read()
            .await
            .projects
            .get(resource)
            .map(|record| record.owner.clone())
            .ok_or_else(|| StoreError::NotFound(resource.clone()))
    }

    async fn resolve_resource_directory(
        &self,
        owner: &UserId,
        resource: &ResourceId,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.directory_for(owner, resource)?;
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(StoreError::NotFound(resource.clone()));
        }
        Ok(dir)
    }

    async fn has_access(&self, user: &UserId, resource: &ResourceId) -> Result<bool, StoreError> {
        let manifest = self.manifest.read().await;
        Ok(manifest
            .projects
            .get(resource)
            .is_some_and(|r| &r.owner == user || r.collaborators.contains(user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_then_read_in_owner_directory() {
        let dir = tempdir().unwrap();
        let store = FsProjectStore::open(dir.path()).await.unwrap();
        let resource = ResourceId::from("p1");
        store.register_project(resource.clone(), UserId::from("alice")).await.unwrap();

        store
            .write_file_content(&resource, "sections/intro.tex", "\\section{Intro}")
            .await
            .unwrap();

        let on_disk = dir.path().join("alice/p1/sections/intro.tex");
        assert_eq!(std::fs::read_to_string(on_disk).unwrap(), "\\section{Intro}");
        assert_eq!(
            store.read_file_content(&resource, "sections/intro.tex").await.unwrap(),
            Some("\\section{Intro}".to_string())
        );
        assert_eq!(store.read_file_content(&resource, "missing.tex").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_manifest_survives_reopen() {
        let dir = tempdir().unwrap();
        let resource = ResourceId::from("p1");
        {
            let store = FsProjectStore::open(dir.path()).await.unwrap();
            store.register_project(resource.clone(), UserId::from("alice")).await.unwrap();
            store.add_collaborator(&resource, UserId::from("bob")).await.unwrap();
        }

        let store = FsProjectStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.resolve_resource_owner(&resource).await.unwrap(),
            UserId::from("alice")
        );
        assert!(store.has_access(&UserId::from("bob"), &resource).await.unwrap());
        assert!(!store.has_access(&UserId::from("carol"), &resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FsProjectStore::open(dir.path()).await.unwrap();
        let err = store
            .read_file_content(&ResourceId::from("ghost"), "main.tex")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_directory_resolves_to_owner_copy() {
        let dir = tempdir().unwrap();
        let store = FsProjectStore::open(dir.path()).await.unwrap();
        let resource = ResourceId::from("p1");
        let created = store
            .register_project(resource.clone(), UserId::from("alice"))
            .await
            .unwrap();
        store.add_collaborator(&resource, UserId::from("bob")).await.unwrap();

        let owner = store.resolve_resource_owner(&resource).await.unwrap();
        let resolved = store.resolve_resource_directory(&owner, &resource).await.unwrap();
        assert_eq!(resolved, created);
        assert!(store
            .resolve_resource_directory(&UserId::from("bob"), &resource)
            .await
            .is_err());
    }
}
