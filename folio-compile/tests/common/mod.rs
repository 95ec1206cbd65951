//! Fake toolchains and fixtures shared by the compile tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use folio_compile::{
    CompileQueue, CompileRunner, JobId, JobStatus, JobView, PassOutput, QueueConfig, Toolchain,
    Toolchains, Workspace,
};
use folio_core::MemoryProjectStore;

/// What a fake pass leaves behind.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Produces {
    Pdf,
    Nothing,
}

/// Fake compiler. Every pass waits for a permit from its resource's gate
/// (or the shared gate), exits 0 and, on the last pass, writes the
/// artifact when asked to.
pub struct FakeToolchain {
    pub passes: usize,
    pub produces: Produces,
    pub gate: Option<Arc<Semaphore>>,
    pub resource_gates: HashMap<String, Arc<Semaphore>>,
}

impl FakeToolchain {
    pub fn producing(produces: Produces) -> Self {
        Self {
            passes: 3,
            produces,
            gate: None,
            resource_gates: HashMap::new(),
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            passes: 3,
            produces: Produces::Pdf,
            gate: Some(gate),
            resource_gates: HashMap::new(),
        }
    }

    pub fn gated_resources(gates: &[(&str, Arc<Semaphore>)]) -> Self {
        Self {
            passes: 3,
            produces: Produces::Pdf,
            gate: None,
            resource_gates: gates
                .iter()
                .map(|(resource, gate)| (resource.to_string(), gate.clone()))
                .collect(),
        }
    }

    fn gate_for(&self, workspace: &Workspace) -> Option<&Arc<Semaphore>> {
        let resource = workspace.dir.file_name().and_then(|n| n.to_str());
        resource
            .and_then(|r| self.resource_gates.get(r))
            .or(self.gate.as_ref())
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    fn name(&self) -> &str {
        "fake"
    }

    fn passes(&self) -> usize {
        self.passes
    }

    async fn run_pass(&self, workspace: &Workspace, pass: usize) -> io::Result<PassOutput> {
        if let Some(gate) = self.gate_for(workspace) {
            gate.acquire().await.map_err(io::Error::other)?.forget();
        }
        if pass == self.passes && self.produces == Produces::Pdf {
            tokio::fs::write(&workspace.artifact, b"%PDF-1.7 fake").await?;
        }
        Ok(PassOutput {
            success: true,
            code: Some(0),
            stdout: format!("fake pass {pass} on {}", workspace.file_name).into_bytes(),
            stderr: Vec::new(),
        })
    }
}

/// Never finishes on its own.
pub struct HangingToolchain;

#[async_trait]
impl Toolchain for HangingToolchain {
    fn name(&self) -> &str {
        "hanging"
    }

    fn passes(&self) -> usize {
        1
    }

    async fn run_pass(&self, _workspace: &Workspace, _pass: usize) -> io::Result<PassOutput> {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Ok(PassOutput::default())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryProjectStore>,
    pub queue: CompileQueue,
}

/// Store rooted in a temp dir: `p1` owned by alice with bob as collaborator,
/// plus projects `r0`..`r19` owned by alice.
pub fn fixture(toolchain: Arc<dyn Toolchain>, config: QueueConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MemoryProjectStore::new(dir.path()).with_project("p1", "alice");
    for i in 0..20 {
        store = store.with_project(&format!("r{i}"), "alice");
    }
    store.add_collaborator("p1", "bob");
    let store = Arc::new(store);

    let runner = CompileRunner::new(store.clone(), Toolchains::new(toolchain.clone(), toolchain));
    let queue = CompileQueue::new(config, runner);
    Fixture { dir, store, queue }
}

/// Poll until `id` reaches `status`.
pub async fn wait_for_status(queue: &CompileQueue, id: &JobId, status: JobStatus) -> JobView {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Some(view) = queue.get_job(id) {
                if view.status == status {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {status:?}"))
}
