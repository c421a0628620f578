use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{FleetError, Result};
use crate::protocol::ConnectionHandle;
use crate::scheduler::job::{Job, JobId, JobStatus};

/// Free-form key/value hardware description sent by the worker.
pub type Descriptor = serde_json::Map<String, Value>;

const MAX_IDENTITY_LEN: usize = 128;

/// Reject blank or malformed worker identities before touching any state.
pub fn validate_identity(identity: &str) -> Result<()> {
    let malformed = identity.trim().is_empty()
        || identity.len() > MAX_IDENTITY_LEN
        || identity.chars().any(|c| c.is_control() || c.is_whitespace());
    if malformed {
        return Err(FleetError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

/// Where a worker's processing loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Idle,
    Dequeuing,
    Assigning,
    Executing,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorState::Idle => write!(f, "idle"),
            ProcessorState::Dequeuing => write!(f, "dequeuing"),
            ProcessorState::Assigning => write!(f, "assigning"),
            ProcessorState::Executing => write!(f, "executing"),
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connected worker: identity, what it can run, and what it is running.
#[derive(Debug)]
pub struct WorkerRecord {
    pub identity: String,
    pub capabilities: HashMap<String, bool>,
    pub hardware_limits: Descriptor,
    pub hardware_info: Descriptor,
    pub host_label: String,
    pub registered_at: DateTime<Utc>,
    connection: Mutex<Option<ConnectionHandle>>,
    /// job type -> in-flight jobs; at most one entry per type
    assigned: Mutex<HashMap<String, Vec<Job>>>,
    state: Mutex<ProcessorState>,
    terminate: CancellationToken,
    removed: AtomicBool,
}

impl WorkerRecord {
    pub fn new(
        identity: String,
        capabilities: HashMap<String, bool>,
        hardware_limits: Descriptor,
        hardware_info: Descriptor,
    ) -> Self {
        let host_label = hardware_info
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Self {
            identity,
            capabilities,
            hardware_limits,
            hardware_info,
            host_label,
            registered_at: Utc::now(),
            connection: Mutex::new(None),
            assigned: Mutex::new(HashMap::new()),
            state: Mutex::new(ProcessorState::Idle),
            terminate: CancellationToken::new(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn is_capable(&self, job_type: &str) -> bool {
        self.capabilities.get(job_type).copied().unwrap_or(false)
    }

    /// Job types this worker advertises as runnable, sorted.
    pub fn capable_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .capabilities
            .iter()
            .filter(|(_, &capable)| capable)
            .map(|(job_type, _)| job_type.clone())
            .collect();
        types.sort();
        types
    }

    /// A worker is busy for a type while any job of that type is assigned.
    pub fn is_busy(&self, job_type: &str) -> bool {
        locked(&self.assigned)
            .get(job_type)
            .is_some_and(|jobs| !jobs.is_empty())
    }

    pub fn assigned_count(&self) -> usize {
        locked(&self.assigned).values().map(Vec::len).sum()
    }

    pub fn assigned_ids(&self) -> Vec<JobId> {
        locked(&self.assigned)
            .values()
            .flat_map(|jobs| jobs.iter().map(|job| job.id))
            .collect()
    }

    pub fn assigned_job(&self, job_id: &JobId) -> Option<Job> {
        locked(&self.assigned)
            .values()
            .flat_map(|jobs| jobs.iter())
            .find(|job| job.id == *job_id)
            .cloned()
    }

    /// Move a job into its type slot. Hands it back if the slot is taken or
    /// the worker is terminating.
    ///
    /// Termination is checked under the slot lock and removal cancels the
    /// token before taking the slots, so nothing is assigned after removal
    /// has collected the in-flight jobs.
    pub fn assign(&self, mut job: Job) -> std::result::Result<(), Job> {
        let mut assigned = locked(&self.assigned);
        if self.is_terminating() {
            return Err(job);
        }
        let slot = assigned.entry(job.job_type().to_string()).or_default();
        if !slot.is_empty() {
            return Err(job);
        }
        job.status = JobStatus::Assigned;
        job.worker = Some(self.identity.clone());
        slot.push(job);
        Ok(())
    }

    pub fn acknowledge(&self, job_id: &JobId, at: DateTime<Utc>) -> bool {
        let mut assigned = locked(&self.assigned);
        match assigned
            .values_mut()
            .flat_map(|jobs| jobs.iter_mut())
            .find(|job| job.id == *job_id)
        {
            Some(job) => {
                job.acknowledged_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Remove a job from its slot, freeing the slot.
    pub fn release(&self, job_id: &JobId) -> Option<Job> {
        let mut assigned = locked(&self.assigned);
        let (job_type, position) = assigned.iter().find_map(|(job_type, jobs)| {
            jobs.iter()
                .position(|job| job.id == *job_id)
                .map(|position| (job_type.clone(), position))
        })?;
        let jobs = assigned.get_mut(&job_type)?;
        let job = jobs.remove(position);
        if jobs.is_empty() {
            assigned.remove(&job_type);
        }
        Some(job)
    }

    pub fn take_assigned(&self) -> Vec<Job> {
        locked(&self.assigned)
            .drain()
            .flat_map(|(_, jobs)| jobs)
            .collect()
    }

    pub fn attach_connection(&self, connection: ConnectionHandle) {
        *locked(&self.connection) = Some(connection);
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        locked(&self.connection).clone()
    }

    pub fn detach_connection(&self) -> Option<ConnectionHandle> {
        locked(&self.connection).take()
    }

    pub fn state(&self) -> ProcessorState {
        *locked(&self.state)
    }

    pub fn set_state(&self, state: ProcessorState) {
        *locked(&self.state) = state;
    }

    /// Request termination: wakes a parked dequeue and closes the connection.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminate.cancelled()
    }

    pub fn termination_token(&self) -> &CancellationToken {
        &self.terminate
    }

    /// Returns true only for the first caller; removal runs once per record.
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::SeqCst)
    }

    pub fn summary(&self, queue_length: usize) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.identity.clone(),
            host: self.host_label.clone(),
            capabilities: self.capable_types(),
            hardware_limits: self.hardware_limits.clone(),
            queue_length,
            in_flight: self.assigned_ids(),
            state: self.state(),
            terminating: self.is_terminating(),
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub host: String,
    pub capabilities: Vec<String>,
    pub hardware_limits: Descriptor,
    pub queue_length: usize,
    pub in_flight: Vec<JobId>,
    pub state: ProcessorState,
    pub terminating: bool,
    pub registered_at: DateTime<Utc>,
}

/// Source of per-worker queue lengths used by the selection algorithms.
pub trait QueueDepth: Send + Sync {
    /// Queued plus assigned jobs, or `None` if the worker has no queue.
    fn queue_length(&self, identity: &str) -> Option<usize>;
}

#[derive(Debug, Default)]
struct RegistryInner {
    workers: HashMap<String, Arc<WorkerRecord>>,
    /// job type -> identities in registration order
    by_capability: HashMap<String, Vec<String>>,
}

impl RegistryInner {
    fn insert(&mut self, record: Arc<WorkerRecord>) {
        for job_type in record.capable_types() {
            self.by_capability
                .entry(job_type)
                .or_default()
                .push(record.identity.clone());
        }
        self.workers.insert(record.identity.clone(), record);
    }

    fn remove(&mut self, identity: &str) -> Option<Arc<WorkerRecord>> {
        let record = self.workers.remove(identity)?;
        self.by_capability.retain(|_, identities| {
            identities.retain(|id| id != identity);
            !identities.is_empty()
        });
        Some(record)
    }

    fn candidates<'a>(
        &'a self,
        job_type: &str,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Arc<WorkerRecord>> + 'a {
        self.by_capability
            .get(job_type)
            .into_iter()
            .flatten()
            .filter(move |id| Some(id.as_str()) != exclude)
            .filter_map(|id| self.workers.get(id))
            .filter(|record| !record.is_terminating())
    }
}

/// Owns all worker records, indexed by identity and by capability.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker.
    ///
    /// Fails with `DuplicateWorker` while the identity is registered and
    /// leaves the live record untouched. Evicting it means draining its
    /// queue too, which [`Coordinator::register_worker`] does before
    /// rejecting.
    ///
    /// [`Coordinator::register_worker`]: crate::Coordinator::register_worker
    pub async fn register(
        &self,
        identity: &str,
        capabilities: HashMap<String, bool>,
        hardware_limits: Descriptor,
        hardware_info: Descriptor,
    ) -> Result<Arc<WorkerRecord>> {
        validate_identity(identity)?;

        let mut inner = self.inner.write().await;
        if inner.workers.contains_key(identity) {
            tracing::warn!(worker_id = identity, "Duplicate registration rejected");
            return Err(FleetError::DuplicateWorker(identity.to_string()));
        }

        let record = Arc::new(WorkerRecord::new(
            identity.to_string(),
            capabilities,
            hardware_limits,
            hardware_info,
        ));
        inner.insert(record.clone());
        tracing::info!(
            worker_id = identity,
            host = %record.host_label,
            capabilities = ?record.capable_types(),
            "Worker registered"
        );
        Ok(record)
    }

    /// Remove a worker from the identity map and every capability list and
    /// signal it to close. Queue cleanup is the dispatcher's job.
    pub async fn unregister(&self, identity: &str) -> Option<Arc<WorkerRecord>> {
        let record = self.inner.write().await.remove(identity)?;
        record.terminate();
        tracing::info!(worker_id = identity, "Worker unregistered");
        Some(record)
    }

    /// Like [`unregister`](Self::unregister) but only if `record` is still
    /// the registered one for its identity.
    pub async fn unregister_record(&self, record: &Arc<WorkerRecord>) -> bool {
        let mut inner = self.inner.write().await;
        let current = inner
            .workers
            .get(&record.identity)
            .is_some_and(|existing| Arc::ptr_eq(existing, record));
        if !current {
            return false;
        }
        inner.remove(&record.identity);
        record.terminate();
        tracing::info!(worker_id = %record.identity, "Worker unregistered");
        true
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<WorkerRecord>> {
        self.inner.read().await.workers.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of all records, sorted by identity.
    pub async fn workers(&self) -> Vec<Arc<WorkerRecord>> {
        let mut workers: Vec<Arc<WorkerRecord>> =
            self.inner.read().await.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.identity.cmp(&b.identity));
        workers
    }

    /// Snapshot of the capability index entry for a job type.
    pub async fn capable_workers(&self, job_type: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_capability
            .get(job_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the whole capability index.
    pub async fn capability_index(&self) -> HashMap<String, Vec<String>> {
        self.inner.read().await.by_capability.clone()
    }

    pub async fn find_first_capable(&self, job_type: &str) -> Option<Arc<WorkerRecord>> {
        self.inner
            .read()
            .await
            .candidates(job_type, None)
            .next()
            .cloned()
    }

    /// Capable worker with the strictly smallest queue length; ties keep
    /// the earliest registered.
    pub async fn find_fewest_queued(
        &self,
        job_type: &str,
        exclude: Option<&str>,
        depth: &dyn QueueDepth,
    ) -> Option<Arc<WorkerRecord>> {
        let inner = self.inner.read().await;
        let mut best: Option<(&Arc<WorkerRecord>, usize)> = None;
        for record in inner.candidates(job_type, exclude) {
            let Some(length) = depth.queue_length(&record.identity) else {
                continue;
            };
            if best.map_or(true, |(_, shortest)| length < shortest) {
                best = Some((record, length));
            }
        }
        best.map(|(record, _)| record.clone())
    }

    /// Capable worker with nothing queued or in flight.
    pub async fn find_idle(
        &self,
        job_type: &str,
        exclude: Option<&str>,
        depth: &dyn QueueDepth,
    ) -> Option<Arc<WorkerRecord>> {
        self.inner
            .read()
            .await
            .candidates(job_type, exclude)
            .find(|record| depth.queue_length(&record.identity) == Some(0))
            .cloned()
    }

    /// Job-assignment entry point.
    ///
    /// Hardware-aware scoring against `hardware_limits` would slot in here;
    /// for now this is plain fewest-queued selection.
    pub async fn find_best_fit(
        &self,
        job: &Job,
        depth: &dyn QueueDepth,
    ) -> Option<Arc<WorkerRecord>> {
        self.find_fewest_queued(job.job_type(), None, depth).await
    }
}
