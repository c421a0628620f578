use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Assigned,
    Completed,
    Failed,
    Lost,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Lost => write!(f, "lost"),
        }
    }
}

/// What a collaborator submits. Everything except the type tag and the
/// requester is opaque to the coordinator and forwarded to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub requester: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub user_config: Value,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            requester: requester.into(),
            module: String::new(),
            command: String::new(),
            context: Value::Null,
            params: Value::Null,
            user_config: Value::Null,
        }
    }

    pub fn with_command(mut self, module: impl Into<String>, command: impl Into<String>) -> Self {
        self.module = module.into();
        self.command = command.into();
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set whenever the job is moved between queues or reordered
    pub migrated_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Identity of the worker whose queue or slot currently holds the job
    pub worker: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec, Utc::now())
    }

    pub fn with_id(id: JobId, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Queued,
            created_at,
            migrated_at: None,
            acknowledged_at: None,
            worker: None,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.spec.job_type
    }

    pub fn requester(&self) -> &str {
        &self.spec.requester
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated_at.is_some()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    pub fn mark_migrated(&mut self, at: DateTime<Utc>) {
        self.migrated_at = Some(at);
    }

    /// Borrowed view sent to the worker in an `execute_job` frame.
    pub fn envelope(&self) -> JobEnvelope<'_> {
        JobEnvelope {
            job_id: self.id,
            job_type: &self.spec.job_type,
            requester: &self.spec.requester,
            module: &self.spec.module,
            command: &self.spec.command,
            context: &self.spec.context,
            params: &self.spec.params,
            user_config: &self.spec.user_config,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobEnvelope<'a> {
    pub job_id: JobId,
    pub job_type: &'a str,
    pub requester: &'a str,
    pub module: &'a str,
    pub command: &'a str,
    pub context: &'a Value,
    pub params: &'a Value,
    pub user_config: &'a Value,
}

/// Listing view of a job, used by the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub job_type: String,
    pub requester: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub migrated_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.spec.job_type.clone(),
            requester: job.spec.requester.clone(),
            status: job.status,
            created_at: job.created_at,
            migrated_at: job.migrated_at,
            acknowledged_at: job.acknowledged_at,
            worker: job.worker.clone(),
        }
    }
}
