//! Compilation job records and the views handed to HTTP clients.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use folio_core::{ResourceId, UserId};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Compiling,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One compile request and everything the scheduler learns about it.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub id: JobId,
    /// User who submitted the job (not necessarily the project owner).
    pub submitter: UserId,
    pub resource_id: ResourceId,
    pub file_name: String,
    pub content: String,
    pub status: JobStatus,
    /// 1-based FIFO position while queued.
    pub queue_position: Option<usize>,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub artifact_path: Option<PathBuf>,
    /// Directory holding this job's log and artifact copy.
    pub job_dir: Option<PathBuf>,
    /// Cumulative log written across passes.
    pub log_path: Option<PathBuf>,
    /// Log the compiler itself writes next to the source.
    pub native_log_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl CompileJob {
    pub fn new(
        submitter: UserId,
        resource_id: ResourceId,
        file_name: impl Into<String>,
        content: impl Into<String>,
        now: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter,
            resource_id,
            file_name: file_name.into(),
            content: content.into(),
            status: JobStatus::Queued,
            queue_position: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            artifact_path: None,
            job_dir: None,
            log_path: None,
            native_log_path: None,
            error: None,
        }
    }
}

/// Maps monotonic instants to wall-clock milliseconds for display.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    instant: Instant,
    unix_ms: u64,
}

impl WallClock {
    pub fn new(instant: Instant, at: SystemTime) -> Self {
        let unix_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { instant, unix_ms }
    }

    pub fn unix_ms(&self, at: Instant) -> u64 {
        match at.checked_duration_since(self.instant) {
            Some(after) => self.unix_ms + after.as_millis() as u64,
            None => self
                .unix_ms
                .saturating_sub(self.instant.duration_since(at).as_millis() as u64),
        }
    }
}

/// Status of one job as returned by `GET /compile/status/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub resource_id: ResourceId,
    pub file_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobView {
    pub fn of(job: &CompileJob, clock: &WallClock) -> Self {
        Self {
            job_id: job.id,
            resource_id: job.resource_id.clone(),
            file_name: job.file_name.clone(),
            status: job.status,
            queue_position: job.queue_position,
            created_at: clock.unix_ms(job.created_at),
            started_at: job.started_at.map(|t| clock.unix_ms(t)),
            completed_at: job.completed_at.map(|t| clock.unix_ms(t)),
            error: job.error.clone(),
        }
    }
}

/// Full scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_ever_seen: u64,
    pub compiling: usize,
    pub queued: usize,
    /// Completed jobs still retained in memory.
    pub completed: usize,
    /// Failed jobs still retained in memory.
    pub failed: usize,
}

/// The public subset served by `GET /compile/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicStats {
    pub compiling: usize,
    pub queued: usize,
    pub total: u64,
    pub available_slots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Compiling).unwrap(), "\"compiling\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_wall_clock_offsets() {
        let start = Instant::now();
        let clock = WallClock::new(start, UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.unix_ms(start), 100_000);
        assert_eq!(clock.unix_ms(start + Duration::from_millis(1500)), 101_500);
    }

    #[test]
    fn test_view_omits_unset_fields() {
        let now = Instant::now();
        let job = CompileJob::new(UserId::from("u"), ResourceId::from("r"), "main.tex", "x", now);
        let clock = WallClock::new(now, SystemTime::now());
        let json = serde_json::to_value(JobView::of(&job, &clock)).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("startedAt").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["fileName"], "main.tex");
    }
}
