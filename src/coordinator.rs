use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::CoordinatorConfig;
use crate::error::{FleetError, Result};
use crate::monitor::FleetMonitor;
use crate::protocol::auth::{CredentialValidator, StaticTokens};
use crate::protocol::messages::RegisterPayload;
use crate::protocol::ConnectionHandle;
use crate::scheduler::registry::validate_identity;
use crate::scheduler::{
    Dispatcher, Job, JobId, JobObserver, JobSpec, TracingObserver, WorkerRecord, WorkerRegistry,
    WorkerSummary,
};
use crate::worker::JobProcessor;

/// Where a submitted job landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker_id: String,
}

/// Owns the registry and dispatcher and wires connections, processing
/// loops and the fleet monitor together.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    validator: Arc<dyn CredentialValidator>,
    /// Serializes the duplicate check, eviction and insert of registrations
    registration: Mutex<()>,
}

impl Coordinator {
    /// Coordinator that logs job events and accepts the configured tokens.
    pub fn new(config: CoordinatorConfig) -> Self {
        let validator = StaticTokens::new(config.auth_tokens.iter().cloned());
        Self::with_collaborators(config, Arc::new(TracingObserver), Arc::new(validator))
    }

    pub fn with_collaborators(
        config: CoordinatorConfig,
        observer: Arc<dyn JobObserver>,
        validator: Arc<dyn CredentialValidator>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), observer));
        Self {
            config,
            registry,
            dispatcher,
            validator,
            registration: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn authorize(&self, credential: Option<&str>) -> Result<()> {
        match credential {
            Some(c) if self.validator.validate(c) => Ok(()),
            _ => Err(FleetError::Unauthorized),
        }
    }

    pub fn monitor(&self) -> FleetMonitor {
        FleetMonitor::new(self.dispatcher.clone(), self.config.monitor.clone())
    }

    // =========================================================================
    // Collaborator API
    // =========================================================================

    pub async fn submit_job(&self, spec: JobSpec) -> Result<Assignment> {
        self.submit(Job::new(spec)).await
    }

    pub async fn submit(&self, job: Job) -> Result<Assignment> {
        let job_id = job.id;
        let worker_id = self.dispatcher.submit(job).await?;
        Ok(Assignment { job_id, worker_id })
    }

    pub fn queue_length_for(&self, worker_id: &str) -> Option<usize> {
        self.dispatcher.queue_length(worker_id)
    }

    pub async fn list_workers(&self) -> Vec<WorkerSummary> {
        self.registry
            .workers()
            .await
            .into_iter()
            .map(|record| {
                let length = self.dispatcher.queue_length(&record.identity).unwrap_or(0);
                record.summary(length)
            })
            .collect()
    }

    // =========================================================================
    // Worker lifecycle
    // =========================================================================

    /// Register a worker, create its queue and start its processing loop.
    ///
    /// If the identity is already live the stale worker is fully removed
    /// (queue migrated, connection closed) and this registration is
    /// rejected; the worker may register again afterwards.
    pub async fn register_worker(
        &self,
        payload: RegisterPayload,
        connection: Option<ConnectionHandle>,
    ) -> Result<Arc<WorkerRecord>> {
        validate_identity(&payload.worker_id)?;

        let _registering = self.registration.lock().await;
        if let Some(stale) = self.registry.get(&payload.worker_id).await {
            tracing::warn!(worker_id = %payload.worker_id, "Worker re-registered while live, evicting stale record");
            self.remove_worker(&stale).await;
            return Err(FleetError::DuplicateWorker(payload.worker_id));
        }

        let record = self
            .registry
            .register(
                &payload.worker_id,
                payload.capabilities,
                payload.hardware_limits,
                payload.hardware_info,
            )
            .await?;
        if let Some(connection) = connection {
            record.attach_connection(connection);
        }
        self.dispatcher.create_queue(&record);

        JobProcessor::new(
            self.dispatcher.clone(),
            record.clone(),
            self.config.processor.clone(),
        )
        .spawn();

        Ok(record)
    }

    /// Remove a worker exactly once: dispatcher first (queued jobs migrate),
    /// then registry (capability index cleanup). In-flight jobs are lost.
    ///
    /// Returns false if the record was already removed.
    pub async fn remove_worker(&self, record: &Arc<WorkerRecord>) -> bool {
        if !record.mark_removed() {
            return false;
        }
        record.terminate();

        let report = self.dispatcher.unregister_worker(&record.identity).await;
        self.registry.unregister_record(record).await;

        let in_flight = record.take_assigned();
        let lost_in_flight = in_flight.len();
        for job in in_flight {
            self.dispatcher.mark_lost(job, &record.identity);
        }
        record.detach_connection();

        tracing::info!(
            worker_id = %record.identity,
            migrated = report.migrated.len(),
            lost = report.lost.len() + lost_in_flight,
            "Worker removed"
        );
        true
    }

    pub async fn remove_worker_by_id(&self, worker_id: &str) -> bool {
        match self.registry.get(worker_id).await {
            Some(record) => self.remove_worker(&record).await,
            None => false,
        }
    }

    async fn record(&self, worker_id: &str) -> Result<Arc<WorkerRecord>> {
        self.registry
            .get(worker_id)
            .await
            .ok_or_else(|| FleetError::WorkerNotFound(worker_id.to_string()))
    }

    pub async fn acknowledge_job(&self, worker_id: &str, job_id: &JobId) -> Result<()> {
        let record = self.record(worker_id).await?;
        if !record.acknowledge(job_id, chrono::Utc::now()) {
            return Err(FleetError::JobNotFound(*job_id));
        }
        tracing::debug!(worker_id, job_id = %job_id, "Job acknowledged");
        Ok(())
    }

    pub async fn complete_job(&self, worker_id: &str, job_id: &JobId) -> Result<Job> {
        let record = self.record(worker_id).await?;
        self.dispatcher.complete(&record, job_id)
    }

    /// Forward a result payload to the job's owner. The job stays in flight
    /// until the worker reports completion.
    pub async fn record_result(&self, worker_id: &str, job_id: &JobId, result: &Value) -> Result<()> {
        let record = self.record(worker_id).await?;
        let job = record
            .assigned_job(job_id)
            .ok_or(FleetError::JobNotFound(*job_id))?;
        self.dispatcher.observer().job_result(&job, result);
        Ok(())
    }

    // =========================================================================
    // Serving
    // =========================================================================

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| FleetError::Internal(format!("failed to bind {}: {}", self.config.listen_addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve worker connections and the HTTP API on an already-bound
    /// listener, with the fleet monitor running alongside.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let monitor = self.monitor();
        let monitor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        // Close every worker connection once shutdown starts so the
        // server can drain.
        let coordinator = self.clone();
        let drain_shutdown = shutdown.clone();
        tokio::spawn(async move {
            drain_shutdown.cancelled().await;
            for record in coordinator.registry.workers().await {
                coordinator.remove_worker(&record).await;
            }
        });

        let addr = listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Starting coordinator server");

        axum::serve(listener, api::router(self))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| FleetError::Internal(format!("server failed: {}", e)))
    }
}
