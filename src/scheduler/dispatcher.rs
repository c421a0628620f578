use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{FleetError, Result};
use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::scheduler::observer::JobObserver;
use crate::scheduler::queue::WorkerQueue;
use crate::scheduler::registry::{QueueDepth, WorkerRecord, WorkerRegistry};

/// Attempts at placing a submitted job when the chosen worker disappears
/// between selection and enqueue.
const SUBMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
struct QueueSlot {
    queue: Arc<WorkerQueue>,
    record: Arc<WorkerRecord>,
}

/// Outcome of draining a departing worker's queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// (job, new worker) for every job that found a peer
    pub migrated: Vec<(JobId, String)>,
    pub lost: Vec<JobId>,
}

/// Owns every per-worker queue and is the only component that changes
/// queue membership.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    queues: RwLock<HashMap<String, QueueSlot>>,
    /// Identifiers of every job that is queued or assigned
    live_jobs: Mutex<HashSet<JobId>>,
    observer: Arc<dyn JobObserver>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.worker_ids())
            .finish_non_exhaustive()
    }
}

impl QueueDepth for Dispatcher {
    fn queue_length(&self, identity: &str) -> Option<usize> {
        Dispatcher::queue_length(self, identity)
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, observer: Arc<dyn JobObserver>) -> Self {
        Self {
            registry,
            queues: RwLock::new(HashMap::new()),
            live_jobs: Mutex::new(HashSet::new()),
            observer,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn observer(&self) -> &Arc<dyn JobObserver> {
        &self.observer
    }

    fn live(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.live_jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, identity: &str) -> Option<QueueSlot> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Ensure a queue exists for the worker. Re-creating for the same
    /// identity keeps the existing queue and points it at the new record.
    pub fn create_queue(&self, worker: &Arc<WorkerRecord>) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        match queues.get_mut(&worker.identity) {
            Some(slot) => slot.record = worker.clone(),
            None => {
                queues.insert(
                    worker.identity.clone(),
                    QueueSlot {
                        queue: Arc::new(WorkerQueue::new()),
                        record: worker.clone(),
                    },
                );
                tracing::debug!(worker_id = %worker.identity, "Queue created");
            }
        }
    }

    pub fn has_queue(&self, identity: &str) -> bool {
        self.slot(identity).is_some()
    }

    /// Identities of every worker with a queue, sorted.
    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, job_id: &JobId) -> bool {
        self.live().contains(job_id)
    }

    fn forget(&self, job_id: &JobId) {
        self.live().remove(job_id);
    }

    fn try_enqueue(&self, worker: &str, mut job: Job) -> std::result::Result<(), Job> {
        let Some(slot) = self.slot(worker) else {
            return Err(job);
        };
        job.worker = Some(worker.to_string());
        job.status = JobStatus::Queued;
        slot.queue.push(job)
    }

    /// Append a job to a worker's queue. Fails with `DuplicateJob` if the
    /// identifier is already queued or assigned anywhere.
    pub fn enqueue(&self, worker: &str, job: Job) -> Result<()> {
        let job_id = job.id;
        if !self.live().insert(job_id) {
            return Err(FleetError::DuplicateJob(job_id));
        }
        match self.try_enqueue(worker, job) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.forget(&job_id);
                Err(FleetError::WorkerNotFound(worker.to_string()))
            }
        }
    }

    /// Pick a worker for the job and queue it there.
    pub async fn submit(&self, job: Job) -> Result<String> {
        {
            let mut live = self.live();
            if !live.insert(job.id) {
                return Err(FleetError::DuplicateJob(job.id));
            }
        }

        let mut notice = job.clone();
        let mut job = job;
        for _ in 0..SUBMIT_ATTEMPTS {
            let Some(worker) = self.registry.find_best_fit(&job, self).await else {
                break;
            };
            match self.try_enqueue(&worker.identity, job) {
                Ok(()) => {
                    notice.worker = Some(worker.identity.clone());
                    self.observer.job_queued(&notice, &worker.identity);
                    return Ok(worker.identity.clone());
                }
                Err(rejected) => job = rejected,
            }
        }

        self.forget(&job.id);
        Err(FleetError::NoCapableWorker(job.job_type().to_string()))
    }

    /// Wait for the worker's next job. Returns `None` once the worker is
    /// terminating or its queue is gone.
    pub async fn dequeue(&self, worker: &WorkerRecord) -> Option<Job> {
        let slot = self.slot(&worker.identity)?;
        slot.queue.pop(worker.termination_token()).await
    }

    /// Move a dequeued job into the worker's in-flight slot. Hands the job
    /// back if the slot for its type is still taken or the worker is
    /// terminating.
    pub fn assign(&self, worker: &WorkerRecord, job: Job) -> std::result::Result<(), Job> {
        worker.assign(job)?;
        if let Some(slot) = self.slot(&worker.identity) {
            slot.queue.release_staged();
        }
        Ok(())
    }

    /// Queued plus in-flight jobs for a worker. Never waits.
    pub fn queue_length(&self, identity: &str) -> Option<usize> {
        let slot = self.slot(identity)?;
        Some(slot.queue.len() + slot.record.assigned_count())
    }

    /// Snapshot of the queued jobs, front first.
    pub fn view_queue(&self, identity: &str) -> Vec<Job> {
        self.slot(identity)
            .map(|slot| slot.queue.snapshot())
            .unwrap_or_default()
    }

    pub fn remove_job(&self, identity: &str, job_id: &JobId) -> Option<Job> {
        self.slot(identity)?.queue.remove(job_id)
    }

    /// Reorder a worker's queue to follow `order`, marking the moved jobs
    /// as migrated. Never adds or drops jobs.
    pub fn replace_queue(&self, identity: &str, order: &[JobId], at: DateTime<Utc>) -> usize {
        self.slot(identity)
            .map(|slot| slot.queue.reorder(order, at))
            .unwrap_or(0)
    }

    /// Move one queued job from `from` to `to`. Returns false if the job
    /// already left `from`.
    pub async fn migrate_job(&self, from: &str, to: &str, job_id: &JobId, at: DateTime<Utc>) -> bool {
        let Some(mut job) = self.remove_job(from, job_id) else {
            return false;
        };
        let previous = job.migrated_at;
        job.mark_migrated(at);

        let mut job = match self.try_enqueue(to, job) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, from, to, "Job migrated");
                return true;
            }
            Err(job) => job,
        };
        // Nothing moved, so the cool-down must not start.
        job.migrated_at = previous;
        // Target vanished between selection and enqueue.
        match self.try_enqueue(from, job) {
            Ok(()) => false,
            Err(job) => {
                self.rehome(job, from).await;
                false
            }
        }
    }

    /// Find a new home for a job whose worker is leaving, or declare it lost.
    pub async fn rehome(&self, mut job: Job, departed: &str) -> Option<String> {
        job.status = JobStatus::Queued;
        job.mark_migrated(Utc::now());
        for _ in 0..SUBMIT_ATTEMPTS {
            let Some(peer) = self
                .registry
                .find_fewest_queued(job.job_type(), Some(departed), self)
                .await
            else {
                break;
            };
            match self.try_enqueue(&peer.identity, job) {
                Ok(()) => return Some(peer.identity.clone()),
                Err(rejected) => job = rejected,
            }
        }
        self.mark_lost(job, departed);
        None
    }

    /// Drain a departing worker's queue onto peers. Jobs without a capable
    /// peer are marked lost and their owners notified.
    pub async fn unregister_worker(&self, identity: &str) -> MigrationReport {
        let removed = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        let mut report = MigrationReport::default();
        let Some(slot) = removed else {
            return report;
        };

        for job in slot.queue.close_and_drain() {
            let job_id = job.id;
            match self.rehome(job, identity).await {
                Some(peer) => {
                    tracing::info!(job_id = %job_id, from = identity, to = %peer, "Job migrated off departing worker");
                    report.migrated.push((job_id, peer));
                }
                None => report.lost.push(job_id),
            }
        }

        tracing::info!(
            worker_id = identity,
            migrated = report.migrated.len(),
            lost = report.lost.len(),
            "Worker queue removed"
        );
        report
    }

    /// Drop a job whose worker is gone and tell its owner.
    pub fn mark_lost(&self, mut job: Job, departed: &str) {
        job.status = JobStatus::Lost;
        self.forget(&job.id);
        let reason = FleetError::JobLost {
            job_id: job.id,
            worker_id: departed.to_string(),
        };
        tracing::warn!(job_id = %job.id, worker_id = departed, "No peer for job, marked lost");
        self.observer.job_lost(&job, &reason);
    }

    /// Free the job's slot after the worker reports completion.
    pub fn complete(&self, worker: &WorkerRecord, job_id: &JobId) -> Result<Job> {
        let mut job = worker
            .release(job_id)
            .ok_or(FleetError::JobNotFound(*job_id))?;
        job.status = JobStatus::Completed;
        self.forget(job_id);
        self.observer.job_completed(&job);
        Ok(job)
    }

    /// The job could not be written to the worker: drop it from the slot and
    /// report to the owner. It is not retried.
    pub fn fail_delivery(&self, worker: &WorkerRecord, job_id: &JobId, error: FleetError) {
        let Some(mut job) = worker.release(job_id) else {
            return;
        };
        job.status = JobStatus::Failed;
        self.forget(job_id);
        tracing::error!(job_id = %job_id, worker_id = %worker.identity, error = %error, "Job delivery failed");
        self.observer.delivery_failed(&job, &error);
    }
}
