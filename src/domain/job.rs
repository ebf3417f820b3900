use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Flip a disbursed loan to active once the cooling period has passed
    ActivateLoan,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ActivateLoan => "activate_loan",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "activate_loan" => Some(JobKind::ActivateLoan),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A deferred state change persisted alongside the data it affects, so it
/// survives restarts. Jobs are keyed by `subject` (a loan number for
/// `ActivateLoan`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub kind: JobKind,
    pub subject: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Give up on a job after this many failed runs.
pub const MAX_JOB_ATTEMPTS: i64 = 5;

impl ScheduledJob {
    pub fn new(kind: JobKind, subject: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject: subject.into(),
            run_at,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Done;
        self.completed_at = Some(now);
        self.last_error = None;
    }

    /// Record a failed run; the job stays pending until attempts run out.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        if self.attempts >= MAX_JOB_ATTEMPTS {
            self.status = JobStatus::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_due_only_after_run_at() {
        let now = Utc::now();
        let job = ScheduledJob::new(JobKind::ActivateLoan, "LN0000000001", now + Duration::hours(24));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::hours(24)));
    }

    #[test]
    fn test_completed_job_is_not_due() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(JobKind::ActivateLoan, "LN0000000001", now);
        job.complete(now);
        assert!(!job.is_due(now));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_failures_exhaust_attempts() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(JobKind::ActivateLoan, "LN0000000001", now);
        for _ in 0..MAX_JOB_ATTEMPTS - 1 {
            job.fail("database is locked");
            assert_eq!(job.status, JobStatus::Pending);
        }
        job.fail("database is locked");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("database is locked"));
    }
}
