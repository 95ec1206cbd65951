//! Admission state machine for compile jobs.
//!
//! ```text
//!            submit                admit                  finish
//!  (new) ──────────► queued ─────────────► compiling ─────────────► completed | failed
//!                      │   first job whose      │   lock released,        │
//!                      │   resource is unlocked │   queue drained again   │ purge after
//!                      ▼                        ▼                         ▼ retention
//!                 FIFO (VecDeque)       resource lock map            (dropped)
//! ```
//!
//! Admission is FIFO-with-skip: a queued job whose resource is already
//! compiling is passed over for the next eligible one, so a slow project
//! never holds up unrelated ones while slots are free. The board does no
//! I/O and takes every timestamp as an argument.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use folio_core::ResourceId;

use crate::job::{CompileJob, JobId, JobStatus, PublicStats, QueueStats};

/// Result of running one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { artifact: PathBuf },
    Failed { error: String },
}

#[derive(Debug)]
pub struct JobBoard {
    limit: usize,
    retention: Duration,
    queue: VecDeque<JobId>,
    active: HashSet<JobId>,
    locks: HashMap<ResourceId, JobId>,
    jobs: HashMap<JobId, CompileJob>,
    total_ever_seen: u64,
}

impl JobBoard {
    pub fn new(limit: usize, retention: Duration) -> Self {
        Self {
            limit,
            retention,
            queue: VecDeque::new(),
            active: HashSet::new(),
            locks: HashMap::new(),
            jobs: HashMap::new(),
            total_ever_seen: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Queue `job` and admit whatever can run now.
    ///
    /// Returns the jobs that moved to `compiling`; the caller starts them.
    pub fn submit(&mut self, mut job: CompileJob, now: Instant) -> Vec<CompileJob> {
        job.status = JobStatus::Queued;
        self.total_ever_seen += 1;
        self.queue.push_back(job.id);
        self.jobs.insert(job.id, job);
        self.advance(now)
    }

    /// Admit jobs until the concurrency limit is reached or every queued
    /// job's resource is locked.
    pub fn advance(&mut self, now: Instant) -> Vec<CompileJob> {
        let mut admitted = Vec::new();
        while let Some(job) = self.admit_one(now) {
            admitted.push(job);
        }
        self.renumber();
        admitted
    }

    fn admit_one(&mut self, now: Instant) -> Option<CompileJob> {
        if self.active.len() >= self.limit {
            return None;
        }

        let index = self.queue.iter().position(|id| {
            self.jobs
                .get(id)
                .is_some_and(|job| !self.locks.contains_key(&job.resource_id))
        })?;
        let id = self.queue.remove(index)?;
        let job = self.jobs.get_mut(&id)?;

        self.locks.insert(job.resource_id.clone(), id);
        self.active.insert(id);
        job.status = JobStatus::Compiling;
        job.queue_position = None;
        job.started_at = Some(now);

        let dispatched = job.clone();
        // The runner holds the source from here on.
        job.content = String::new();
        log::info!(
            "Admitted job {id} ({}:{}), {} compiling",
            dispatched.resource_id,
            dispatched.file_name,
            self.active.len()
        );
        Some(dispatched)
    }

    fn renumber(&mut self) {
        for (index, id) in self.queue.iter().enumerate() {
            if let Some(job) = self.jobs.get_mut(id) {
                job.queue_position = Some(index + 1);
            }
        }
    }

    /// Record where a running job keeps its outputs.
    pub fn attach_outputs(
        &mut self,
        id: JobId,
        job_dir: PathBuf,
        log: PathBuf,
        native_log: PathBuf,
    ) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.job_dir = Some(job_dir);
            job.log_path = Some(log);
            job.native_log_path = Some(native_log);
        }
    }

    /// Move a compiling job to its terminal state, release its resource
    /// and admit the next jobs.
    pub fn finish(&mut self, id: JobId, outcome: Outcome, now: Instant) -> Vec<CompileJob> {
        if !self.active.remove(&id) {
            log::warn!("Finish for job {id} which is not compiling");
            return Vec::new();
        }

        if let Some(job) = self.jobs.get_mut(&id) {
            if self.locks.get(&job.resource_id) == Some(&id) {
                self.locks.remove(&job.resource_id);
            }
            job.completed_at = Some(now);
            match outcome {
                Outcome::Completed { artifact } => {
                    job.status = JobStatus::Completed;
                    job.artifact_path = Some(artifact);
                    log::info!("Job {id} completed");
                }
                Outcome::Failed { error } => {
                    job.status = JobStatus::Failed;
                    log::warn!("Job {id} failed: {error}");
                    job.error = Some(error);
                }
            }
        }

        self.advance(now)
    }

    pub fn get(&self, id: &JobId) -> Option<&CompileJob> {
        self.jobs.get(id)
    }

    /// Ids of queued jobs in FIFO order.
    pub fn queued(&self) -> Vec<JobId> {
        self.queue.iter().copied().collect()
    }

    pub fn is_locked(&self, resource: &ResourceId) -> bool {
        self.locks.contains_key(resource)
    }

    /// Drop terminal jobs that finished more than `retention` ago and hand
    /// them back so the caller can clean up their files.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<CompileJob> {
        let retention = self.retention;
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| match job.completed_at {
                Some(done) if job.status.is_terminal() => {
                    now.saturating_duration_since(done) > retention
                }
                _ => false,
            })
            .map(|job| job.id)
            .collect();

        let purged: Vec<CompileJob> = expired
            .iter()
            .filter_map(|id| self.jobs.remove(id))
            .collect();
        if !purged.is_empty() {
            log::debug!("Purged {} expired jobs", purged.len());
        }
        purged
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total_ever_seen: self.total_ever_seen,
            compiling: self.active.len(),
            queued: self.queue.len(),
            ..QueueStats::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    pub fn public_stats(&self) -> PublicStats {
        PublicStats {
            compiling: self.active.len(),
            queued: self.queue.len(),
            total: self.total_ever_seen,
            available_slots: self.limit.saturating_sub(self.active.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::UserId;

    fn job(resource: &str, now: Instant) -> CompileJob {
        CompileJob::new(UserId::from("u1"), ResourceId::from(resource), "main.tex", "\\relax", now)
    }

    fn done() -> Outcome {
        Outcome::Completed {
            artifact: PathBuf::from("/tmp/main.pdf"),
        }
    }

    /// Lock map and active set agree, and limits hold.
    fn assert_invariants(board: &JobBoard) {
        assert!(board.active.len() <= board.limit);
        assert_eq!(board.locks.len(), board.active.len());
        let mut compiling_resources = HashSet::new();
        for job in board.jobs.values().filter(|j| j.status == JobStatus::Compiling) {
            assert!(compiling_resources.insert(job.resource_id.clone()));
            assert_eq!(board.locks.get(&job.resource_id), Some(&job.id));
        }
        for (index, id) in board.queue.iter().enumerate() {
            assert_eq!(board.jobs[id].queue_position, Some(index + 1));
        }
    }

    // ── admission ────────────────────────────────────────────────

    #[test]
    fn test_limit_bounds_concurrency() {
        let now = Instant::now();
        let mut board = JobBoard::new(10, Duration::from_secs(1800));
        let mut ids = Vec::new();
        for i in 0..12 {
            let j = job(&format!("r{i}"), now);
            ids.push(j.id);
            board.submit(j, now);
            assert_invariants(&board);
        }

        let stats = board.stats();
        assert_eq!(stats.compiling, 10);
        assert_eq!(stats.queued, 2);
        assert_eq!(board.get(&ids[10]).unwrap().queue_position, Some(1));
        assert_eq!(board.get(&ids[11]).unwrap().queue_position, Some(2));
        assert_eq!(board.public_stats().available_slots, 0);
    }

    #[test]
    fn test_same_resource_is_serialized() {
        let now = Instant::now();
        let mut board = JobBoard::new(10, Duration::from_secs(1800));
        let first = job("r1", now);
        let second = job("r1", now);
        let (first_id, second_id) = (first.id, second.id);

        assert_eq!(board.submit(first, now).len(), 1);
        assert!(board.submit(second, now).is_empty());
        assert_eq!(board.get(&second_id).unwrap().status, JobStatus::Queued);
        assert_eq!(board.get(&second_id).unwrap().queue_position, Some(1));

        let admitted = board.finish(first_id, done(), now);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, second_id);
        assert_eq!(board.get(&second_id).unwrap().status, JobStatus::Compiling);
        assert_invariants(&board);
    }

    #[test]
    fn test_locked_head_is_skipped() {
        let now = Instant::now();
        let mut board = JobBoard::new(2, Duration::from_secs(1800));
        let running_x = job("x", now);
        let running_x_id = running_x.id;
        board.submit(running_x, now);

        // Second slot taken by y1 so that a and b both queue.
        let y1 = job("y", now);
        let y1_id = y1.id;
        board.submit(y1, now);

        let a = job("x", now);
        let b = job("z", now);
        let (a_id, b_id) = (a.id, b.id);
        board.submit(a, now);
        board.submit(b, now);
        assert_eq!(board.queued(), vec![a_id, b_id]);

        // One slot frees up while x is still compiling: b jumps ahead of a.
        let admitted = board.finish(y1_id, done(), now);
        assert_eq!(admitted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b_id]);
        assert_eq!(board.get(&a_id).unwrap().queue_position, Some(1));
        assert_eq!(board.get(&a_id).unwrap().status, JobStatus::Queued);

        board.finish(b_id, done(), now);
        assert_eq!(board.get(&a_id).unwrap().status, JobStatus::Queued);
        board.finish(running_x_id, done(), now);
        assert_eq!(board.get(&a_id).unwrap().status, JobStatus::Compiling);
        assert_invariants(&board);
    }

    #[test]
    fn test_advance_fills_every_free_slot() {
        let now = Instant::now();
        let mut board = JobBoard::new(0, Duration::from_secs(60));
        for r in ["a", "b", "c"] {
            board.submit(job(r, now), now);
        }
        assert_eq!(board.stats().queued, 3);

        board.limit = 3;
        assert_eq!(board.advance(now).len(), 3);
        assert_invariants(&board);
    }

    #[test]
    fn test_failure_releases_lock() {
        let now = Instant::now();
        let mut board = JobBoard::new(1, Duration::from_secs(60));
        let failing = job("r", now);
        let id = failing.id;
        board.submit(failing, now);
        assert!(board.is_locked(&ResourceId::from("r")));

        board.finish(
            id,
            Outcome::Failed {
                error: "no output".into(),
            },
            now,
        );
        assert!(!board.is_locked(&ResourceId::from("r")));
        let record = board.get(&id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("no output"));
        assert_eq!(board.stats().failed, 1);
    }

    #[test]
    fn test_finish_unknown_job_is_ignored() {
        let now = Instant::now();
        let mut board = JobBoard::new(1, Duration::from_secs(60));
        assert!(board.finish(JobId::new_v4(), done(), now).is_empty());
    }

    #[test]
    fn test_dispatched_job_carries_content_board_drops_it() {
        let now = Instant::now();
        let mut board = JobBoard::new(1, Duration::from_secs(60));
        let j = job("r", now);
        let id = j.id;
        let admitted = board.submit(j, now);
        assert_eq!(admitted[0].content, "\\relax");
        assert!(board.get(&id).unwrap().content.is_empty());
    }

    // ── retention ────────────────────────────────────────────────

    #[test]
    fn test_retention_purges_only_old_terminal_jobs() {
        let start = Instant::now();
        let retention = Duration::from_secs(1800);
        let mut board = JobBoard::new(1, retention);

        let old = job("a", start);
        let old_id = old.id;
        board.submit(old, start);
        let waiting = job("a", start);
        let waiting_id = waiting.id;
        board.submit(waiting, start);
        board.finish(old_id, done(), start);

        assert!(board.purge_expired(start + retention).is_empty());
        assert!(board.get(&old_id).is_some());

        let later = start + retention + Duration::from_secs(1);
        let purged = board.purge_expired(later);
        assert_eq!(purged.iter().map(|j| j.id).collect::<Vec<_>>(), vec![old_id]);
        assert!(board.get(&old_id).is_none());
        // Still compiling, never purged.
        assert!(board.get(&waiting_id).is_some());
        assert_eq!(board.stats().total_ever_seen, 2);
    }
}
