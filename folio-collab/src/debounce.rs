//! Debounced persistence of room content.
//!
//! ```text
//! mutation ─► schedule(key, text) ─┬─ cancel previous task for key
//!                                  └─ spawn: sleep(window) → write(text)
//! ```
//!
//! Each key holds at most one scheduled write. The text is captured when
//! the write is scheduled, so the task never touches the CRDT and a room
//! may be evicted while its write is still pending. Writes are
//! fire-and-forget: failures are logged and not retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;

use folio_core::{DocumentKey, ProjectStore};

struct Pending {
    generation: u64,
    content: String,
    handle: AbortHandle,
}

#[derive(Default)]
struct PendingWrites {
    next_generation: u64,
    by_key: HashMap<DocumentKey, Pending>,
}

pub struct Debouncer {
    store: Arc<dyn ProjectStore>,
    window: Duration,
    pending: Arc<Mutex<PendingWrites>>,
}

impl Debouncer {
    pub fn new(store: Arc<dyn ProjectStore>, window: Duration) -> Self {
        Self {
            store,
            window,
            pending: Arc::new(Mutex::new(PendingWrites::default())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Replace any scheduled write for `key` with a fresh one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, key: DocumentKey, content: String) {
        let mut pending = lock(&self.pending);
        pending.next_generation += 1;
        let generation = pending.next_generation;

        let task = tokio::spawn(write_after(
            self.store.clone(),
            self.pending.clone(),
            key.clone(),
            generation,
            self.window,
        ));

        let replaced = pending.by_key.insert(
            key.clone(),
            Pending {
                generation,
                content,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.handle.abort();
            log::trace!("Rescheduled write for {key}");
        }
    }

    /// Number of writes waiting for their window to elapse.
    pub fn pending(&self) -> usize {
        lock(&self.pending).by_key.len()
    }

    /// Write everything now (shutdown path). Returns the number of writes
    /// that succeeded.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(DocumentKey, Pending)> = lock(&self.pending).by_key.drain().collect();

        let mut written = 0;
        for (key, pending) in drained {
            pending.handle.abort();
            if persist(self.store.as_ref(), &key, &pending.content).await {
                written += 1;
            }
        }
        written
    }
}

async fn write_after(
    store: Arc<dyn ProjectStore>,
    pending: Arc<Mutex<PendingWrites>>,
    key: DocumentKey,
    generation: u64,
    window: Duration,
) {
    tokio::time::sleep(window).await;

    // Claim the entry; a newer schedule or a flush may have taken it.
    let content = {
        let mut pending = lock(&pending);
        let current = pending.by_key.get(&key).map(|p| p.generation);
        if current == Some(generation) {
            pending.by_key.remove(&key).map(|p| p.content)
        } else {
            None
        }
    };

    if let Some(content) = content {
        persist(store.as_ref(), &key, &content).await;
    }
}

async fn persist(store: &dyn ProjectStore, key: &DocumentKey, content: &str) -> bool {
    match store
        .write_file_content(&key.resource_id, &key.path, content)
        .await
    {
        Ok(()) => {
            log::debug!("Persisted {key} ({} bytes)", content.len());
            true
        }
        Err(e) => {
            log::error!("Failed to persist {key}: {e}");
            false
        }
    }
}

fn lock(pending: &Mutex<PendingWrites>) -> MutexGuard<'_, PendingWrites> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
