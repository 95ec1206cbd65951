//! Compile queue service: the [`JobBoard`] behind a mutex, plus the tasks
//! that run admitted jobs.
//!
//! Admission happens synchronously under the lock. Each admitted job runs in
//! its own task; when it ends, its outcome re-enters the board under the
//! lock and whatever that admits is spawned in turn. A panicking or
//! timed-out run fails only its own job.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::task::JoinHandle;

use folio_core::{ResourceId, UserId};

use crate::error::CompileError;
use crate::job::{CompileJob, JobId, JobStatus, JobView, PublicStats, QueueStats, WallClock};
use crate::runner::CompileRunner;
use crate::scheduler::{JobBoard, Outcome};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global limit on jobs compiling at once.
    pub max_concurrent: usize,
    /// How long finished jobs stay queryable.
    pub retention: Duration,
    /// Wall-clock bound on one job's compiler passes.
    pub compile_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retention: Duration::from_secs(30 * 60),
            compile_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    board: Mutex<JobBoard>,
    runner: CompileRunner,
    clock: WallClock,
}

#[derive(Clone)]
pub struct CompileQueue {
    inner: Arc<QueueInner>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl CompileQueue {
    pub fn new(config: QueueConfig, runner: CompileRunner) -> Self {
        let board = JobBoard::new(config.max_concurrent, config.retention);
        Self {
            inner: Arc::new(QueueInner {
                config,
                board: Mutex::new(board),
                runner,
                clock: WallClock::new(now(), SystemTime::now()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn board(&self) -> MutexGuard<'_, JobBoard> {
        self.inner
            .board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a compile and start whatever can run now.
    ///
    /// Callers validate the file name and the submitter's access first.
    /// Must be called from within a tokio runtime.
    pub fn add_job(
        &self,
        submitter: UserId,
        resource_id: ResourceId,
        file_name: impl Into<String>,
        content: impl Into<String>,
    ) -> JobId {
        let job = CompileJob::new(submitter, resource_id, file_name, content, now());
        let id = job.id;
        log::info!(
            "Job {id} submitted by {} for {}:{}",
            job.submitter,
            job.resource_id,
            job.file_name
        );
        let admitted = self.board().submit(job, now());
        self.dispatch(admitted);
        id
    }

    fn dispatch(&self, jobs: Vec<CompileJob>) {
        for job in jobs {
            let queue = self.clone();
            tokio::spawn(async move { queue.execute(job).await });
        }
    }

    async fn execute(&self, job: CompileJob) {
        let id = job.id;
        let queue = self.clone();
        let run = tokio::spawn(async move { queue.compile(&job).await });

        let outcome = match run.await {
            Ok(Ok(artifact)) => Outcome::Completed { artifact },
            Ok(Err(e)) => Outcome::Failed {
                error: e.to_string(),
            },
            Err(e) => Outcome::Failed {
                error: CompileError::Aborted(e.to_string()).to_string(),
            },
        };

        let admitted = self.board().finish(id, outcome, now());
        self.dispatch(admitted);
    }

    async fn compile(&self, job: &CompileJob) -> Result<PathBuf, CompileError> {
        let runner = &self.inner.runner;
        let workspace = runner.prepare(job).await?;
        self.board().attach_outputs(
            job.id,
            workspace.job_dir.clone(),
            workspace.log.clone(),
            workspace.kept_native_log.clone(),
        );

        let limit = self.inner.config.compile_timeout;
        match tokio::time::timeout(limit, runner.run(&workspace)).await {
            Ok(result) => result,
            Err(_) => {
                let error = CompileError::Timeout(limit);
                if let Err(e) = runner.note(&workspace, &error.to_string()).await {
                    log::warn!("Could not record timeout for job {}: {e}", job.id);
                }
                Err(error)
            }
        }
    }

    /// Look a job up across queued, compiling and finished jobs.
    pub fn get_job(&self, id: &JobId) -> Option<JobView> {
        let board = self.purged_board();
        board.get(id).map(|job| JobView::of(job, &self.inner.clock))
    }

    pub fn stats(&self) -> QueueStats {
        self.board().stats()
    }

    pub fn public_stats(&self) -> PublicStats {
        self.board().public_stats()
    }

    /// Artifact bytes of a completed job.
    pub async fn get_artifact(&self, id: &JobId) -> Result<Vec<u8>, CompileError> {
        let path = {
            let board = self.purged_board();
            let job = board.get(id).ok_or(CompileError::JobNotFound(*id))?;
            match (&job.status, &job.artifact_path) {
                (JobStatus::Completed, Some(path)) => path.clone(),
                _ => {
                    return Err(CompileError::NotReady {
                        id: *id,
                        status: job.status,
                    })
                }
            }
        };
        Ok(fs::read(path).await?)
    }

    /// Compile log of a job, readable while it is still compiling.
    ///
    /// Prefers the cumulative log, falling back to the job's copy of the
    /// compiler's own log.
    pub async fn get_log(&self, id: &JobId) -> Result<String, CompileError> {
        let (live, native) = {
            let board = self.purged_board();
            let job = board.get(id).ok_or(CompileError::JobNotFound(*id))?;
            (job.log_path.clone(), job.native_log_path.clone())
        };

        let live_text = match &live {
            Some(path) => read_optional(path).await?,
            None => None,
        };
        if let Some(text) = live_text.as_ref().filter(|t| !t.is_empty()) {
            return Ok(text.clone());
        }
        if let Some(path) = &native {
            if let Some(text) = read_optional(path).await? {
                return Ok(text);
            }
        }
        live_text.ok_or(CompileError::LogUnavailable(*id))
    }

    /// Drop expired records and delete their per-job directories. The
    /// compiler's output next to the source stays.
    pub fn purge_expired(&self) -> usize {
        let purged = self.board().purge_expired(now());
        let count = purged.len();
        discard_job_dirs(purged);
        count
    }

    fn purged_board(&self) -> MutexGuard<'_, JobBoard> {
        let mut board = self.board();
        discard_job_dirs(board.purge_expired(now()));
        board
    }

    /// Purge expired jobs every `sweep_interval` until the queue is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let inner: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let every = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                let purged = CompileQueue { inner }.purge_expired();
                if purged > 0 {
                    log::info!("Retention sweep dropped {purged} jobs");
                }
            }
        })
    }
}

fn discard_job_dirs(jobs: Vec<CompileJob>) {
    let dirs: Vec<PathBuf> = jobs.into_iter().filter_map(|job| job.job_dir).collect();
    if dirs.is_empty() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        log::warn!("No runtime to remove {} expired job directories", dirs.len());
        return;
    };
    runtime.spawn(async move {
        for dir in dirs {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => log::debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Could not remove {}: {e}", dir.display()),
            }
        }
    });
}

async fn read_optional(path: &Path) -> Result<Option<String>, CompileError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
