use serde_json::Value;

use crate::error::FleetError;
use crate::scheduler::job::Job;

/// Notification seam towards whoever owns a job (chat or game logic).
///
/// All methods are called synchronously from the coordinator's tasks and
/// must not block.
pub trait JobObserver: Send + Sync {
    /// The job was placed on a worker's queue.
    fn job_queued(&self, _job: &Job, _worker_id: &str) {}

    fn job_completed(&self, _job: &Job) {}

    /// A worker reported a result payload for a job it is running.
    fn job_result(&self, _job: &Job, _result: &Value) {}

    /// The job's worker went away and no peer could take the job.
    fn job_lost(&self, _job: &Job, _reason: &FleetError) {}

    /// The job was assigned but writing it to the connection failed.
    fn delivery_failed(&self, _job: &Job, _error: &FleetError) {}
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn job_queued(&self, job: &Job, worker_id: &str) {
        tracing::debug!(job_id = %job.id, worker_id, job_type = job.job_type(), "Job queued");
    }

    fn job_completed(&self, job: &Job) {
        tracing::info!(
            job_id = %job.id,
            worker_id = ?job.worker,
            requester = job.requester(),
            "Job completed"
        );
    }

    fn job_result(&self, job: &Job, result: &Value) {
        tracing::info!(job_id = %job.id, result_bytes = result.to_string().len(), "Job result received");
    }

    fn job_lost(&self, job: &Job, reason: &FleetError) {
        tracing::warn!(job_id = %job.id, requester = job.requester(), reason = %reason, "Job lost");
    }

    fn delivery_failed(&self, job: &Job, error: &FleetError) {
        tracing::error!(job_id = %job.id, requester = job.requester(), error = %error, "Job delivery failed");
    }
}
