//! Job models and state records for the conversion queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Opaque job handle minted by the broker at enqueue time.
///
/// The coordinator passes it through verbatim and never interprets it, so
/// any string a client sends is a valid (possibly unknown) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mints a fresh identifier. Only brokers call this.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversion request submitted by a client. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub input_path: String,
    pub output_path: String,
    /// Higher values are preferred by the queue.
    #[serde(default)]
    pub priority: i64,
}

impl JobDescriptor {
    pub fn new(input_path: impl Into<String>, output_path: impl Into<String>, priority: i64) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            priority,
        }
    }
}

/// A descriptor as held by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub descriptor: JobDescriptor,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(id: JobId, descriptor: JobDescriptor) -> Self {
        Self {
            id,
            descriptor,
            enqueued_at: Utc::now(),
        }
    }
}

/// Queue-owned lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Pending,
    Processing,
    Success,
    Failure,
    Revoked,
    /// Any other state a broker reports; surfaced verbatim.
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Revoked => "REVOKED",
            JobState::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Revoked)
    }
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PENDING" => JobState::Pending,
            "PROCESSING" => JobState::Processing,
            "SUCCESS" => JobState::Success,
            "FAILURE" => JobState::Failure,
            "REVOKED" => JobState::Revoked,
            _ => JobState::Other(s),
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress payload attached to a `PROCESSING` job. Replaced on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub status: String,
    pub progress: u8,
}

impl ProgressInfo {
    pub fn new(status: impl Into<String>, progress: u8) -> Self {
        Self {
            status: status.into(),
            progress,
        }
    }
}

/// Terminal conversion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub success: bool,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub processing_time_ms: u64,
}

impl ConversionResult {
    pub fn succeeded(output_path: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            success: true,
            output_path: Some(output_path.into()),
            error: None,
            processing_time_ms,
        }
    }

    pub fn failed(error: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            success: false,
            output_path: None,
            error: Some(error.into()),
            processing_time_ms,
        }
    }
}

/// Terminal task failure as returned by the task function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub processing_time_ms: u64,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            processing_time_ms,
        }
    }

    /// The `{success: false, ...}` result shape for this failure.
    pub fn to_result(&self) -> ConversionResult {
        ConversionResult::failed(self.message.clone(), self.processing_time_ms)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of one task run; stored verbatim as the terminal record.
pub type TaskOutput = Result<ConversionResult, TaskFailure>;

/// Metadata accompanying a state, discriminated by what the state carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskInfo {
    Progress(ProgressInfo),
    Result(ConversionResult),
    Error(TaskFailure),
}

/// Per-job state record kept in the broker's result store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: JobState,
    pub info: Option<TaskInfo>,
    pub worker: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn with(state: JobState, info: Option<TaskInfo>, worker: Option<String>) -> Self {
        Self {
            state,
            info,
            worker,
            updated_at: Utc::now(),
        }
    }

    pub fn pending() -> Self {
        Self::with(JobState::Pending, None, None)
    }

    pub fn processing(progress: ProgressInfo, worker: &str) -> Self {
        Self::with(
            JobState::Processing,
            Some(TaskInfo::Progress(progress)),
            Some(worker.to_string()),
        )
    }

    pub fn success(result: ConversionResult, worker: &str) -> Self {
        Self::with(
            JobState::Success,
            Some(TaskInfo::Result(result)),
            Some(worker.to_string()),
        )
    }

    pub fn failure(failure: TaskFailure, worker: &str) -> Self {
        Self::with(
            JobState::Failure,
            Some(TaskInfo::Error(failure)),
            Some(worker.to_string()),
        )
    }

    /// Revoked before a worker touched it.
    pub fn revoked() -> Self {
        Self::with(JobState::Revoked, None, None)
    }

    /// Maps a task's return value to the record the worker persists.
    pub fn from_output(output: TaskOutput, worker: &str) -> Self {
        match output {
            Ok(result) => Self::success(result, worker),
            Err(failure) if failure.kind == ErrorKind::Revoked => Self::with(
                JobState::Revoked,
                Some(TaskInfo::Error(failure)),
                Some(worker.to_string()),
            ),
            Err(failure) => Self::failure(failure, worker),
        }
    }

    pub fn progress(&self) -> Option<&ProgressInfo> {
        match &self.info {
            Some(TaskInfo::Progress(p)) => Some(p),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&ConversionResult> {
        match &self.info {
            Some(TaskInfo::Result(r)) => Some(r),
            _ => None,
        }
    }

    pub fn failure_info(&self) -> Option<&TaskFailure> {
        match &self.info {
            Some(TaskInfo::Error(f)) => Some(f),
            _ => None,
        }
    }
}

/// What one worker reports about the jobs it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker: String,
    /// Claimed and running.
    pub active: Vec<JobId>,
    /// Deferred for later execution.
    pub scheduled: Vec<JobId>,
    /// Claimed, waiting for a free slot.
    pub reserved: Vec<JobId>,
    pub processed: u64,
    pub heartbeat_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            active: Vec::new(),
            scheduled: Vec::new(),
            reserved: Vec::new(),
            processed: 0,
            heartbeat_at: Utc::now(),
        }
    }
}

/// Aggregated queue telemetry across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub active: usize,
    pub scheduled: usize,
    pub reserved: usize,
    pub total_pending: usize,
}

impl QueueStats {
    pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a WorkerSnapshot>) -> Self {
        let mut stats = QueueStats::default();
        for snapshot in snapshots {
            stats.active += snapshot.active.len();
            stats.scheduled += snapshot.scheduled.len();
            stats.reserved += snapshot.reserved.len();
        }
        stats.total_pending = stats.active + stats.scheduled + stats.reserved;
        stats
    }
}
