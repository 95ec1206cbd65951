//! In-memory project store for tests.
//!
//! Directories are computed under a caller-supplied root but never created,
//! so the compile runner can be pointed at a tempdir while file content
//! round-trips through memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ProjectStore, StoreError};
use crate::ids::{ResourceId, UserId};

#[derive(Default)]
struct MemoryState {
    owners: HashMap<ResourceId, UserId>,
    collaborators: HashMap<ResourceId, Vec<UserId>>,
    files: HashMap<(ResourceId, String), String>,
    writes: Vec<(ResourceId, String, String)>,
}

pub struct MemoryProjectStore {
    root: PathBuf,
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    stalled: AtomicBool,
    owner_lookups: AtomicUsize,
}

impl MemoryProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MemoryState::default()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            owner_lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_project(self, resource: &str, owner: &str) -> Self {
        self.lock()
            .owners
            .insert(ResourceId::from(resource), UserId::from(owner));
        self
    }

    pub fn with_file(self, resource: &str, path: &str, content: &str) -> Self {
        self.lock()
            .files
            .insert((ResourceId::from(resource), path.to_string()), content.to_string());
        self
    }

    pub fn add_collaborator(&self, resource: &str, user: &str) {
        self.lock()
            .collaborators
            .entry(ResourceId::from(resource))
            .or_default()
            .push(UserId::from(user));
    }

    pub fn remove_project(&self, resource: &str) {
        self.lock().owners.remove(&ResourceId::from(resource));
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent reads and owner lookups never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// How many times `resolve_resource_owner` was called.
    pub fn owner_lookups(&self) -> usize {
        self.owner_lookups.load(Ordering::SeqCst)
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(ResourceId, String, String)> {
        self.lock().writes.clone()
    }

    pub fn file(&self, resource: &str, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(ResourceId::from(resource), path.to_string()))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    async fn stall(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn read_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        self.stall().await;
        self.check()?;
        Ok(self.lock().files.get(&(resource.clone(), path.to_string())).cloned())
    }

    async fn write_file_content(
        &self,
        resource: &ResourceId,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.lock();
        state
            .files
            .insert((resource.clone(), path.to_string()), content.to_string());
        state
            .writes
            .push((resource.clone(), path.to_string(), content.to_string()));
        Ok(())
    }

    async fn resolve_resource_owner(&self, resource: &ResourceId) -> Result<UserId, StoreError> {
        self.owner_lookups.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        self.check()?;
        self.lock()
            .owners
            .get(resource)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(resource.clone()))
    }

    async fn resolve_resource_directory(
        &self,
        owner: &UserId,
        resource: &ResourceId,
    ) -> Result<PathBuf, StoreError> {
        self.check()?;
        Ok(self.root.join(owner.as_str()).join(resource.as_str()))
    }

    async fn has_access(&self, user: &UserId, resource: &ResourceId) -> Result<bool, StoreError> {
        self.check()?;
        let state = self.lock();
        let owner = state.owners.get(resource) == Some(user);
        let collaborator = state
            .collaborators
            .get(resource)
            .is_some_and(|users| users.contains(user));
        Ok(owner || collaborator)
    }
}
