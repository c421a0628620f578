use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ProcessorConfig;
use crate::error::FleetError;
use crate::protocol::messages::execute_job_frame;
use crate::scheduler::{Dispatcher, Job, JobId, ProcessorState, WorkerRecord};

/// Serial job loop for one worker: dequeue, wait for the job type's slot,
/// assign, write the job to the connection, repeat.
///
/// Exits when the worker starts terminating. A job in hand at that point
/// is handed back to the dispatcher for migration.
pub struct JobProcessor {
    dispatcher: Arc<Dispatcher>,
    record: Arc<WorkerRecord>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(dispatcher: Arc<Dispatcher>, record: Arc<WorkerRecord>, config: ProcessorConfig) -> Self {
        Self {
            dispatcher,
            record,
            config,
        }
    }

    /// Start the supervised processing loop in the background.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).supervise())
    }

    /// Keep the processing loop alive until the worker terminates.
    pub async fn supervise(self: Arc<Self>) {
        let worker_id = self.record.identity.clone();
        loop {
            let processor = self.clone();
            let outcome = tokio::spawn(async move { processor.run().await }).await;

            if self.record.is_terminating() {
                tracing::debug!(worker_id = %worker_id, "Processing loop stopped");
                break;
            }
            match outcome {
                Ok(()) => tracing::warn!(worker_id = %worker_id, "Processing loop exited unexpectedly, restarting"),
                Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Processing loop panicked, restarting"),
            }

            tokio::select! {
                _ = self.record.terminated() => break,
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }
        }
        self.record.set_state(ProcessorState::Idle);
    }

    /// The processing loop proper.
    pub async fn run(&self) {
        while !self.record.is_terminating() {
            self.record.set_state(ProcessorState::Dequeuing);
            let Some(job) = self.dispatcher.dequeue(&self.record).await else {
                break;
            };

            self.record.set_state(ProcessorState::Assigning);
            let job_id = job.id;
            let frame = execute_job_frame(&job);
            if !self.assign_when_free(job).await {
                break;
            }

            self.record.set_state(ProcessorState::Executing);
            match frame {
                Ok(text) => self.execute(job_id, text).await,
                Err(e) => self.dispatcher.fail_delivery(&self.record, &job_id, e.into()),
            }
            self.record.set_state(ProcessorState::Idle);
        }
    }

    /// Wait until no job of the same type is in flight on this worker, then
    /// move the job into its slot. Returns false if the worker started
    /// terminating first; the job has then been handed back for migration.
    pub async fn assign_when_free(&self, job: Job) -> bool {
        let mut job = job;
        loop {
            match self.dispatcher.assign(&self.record, job) {
                Ok(()) => return true,
                Err(rejected) => job = rejected,
            }
            if self.record.is_terminating() {
                break;
            }
            tracing::trace!(worker_id = %self.record.identity, job_type = job.job_type(), "Slot busy, waiting");

            tokio::select! {
                _ = self.record.terminated() => break,
                _ = tokio::time::sleep(self.config.slot_poll_interval) => {}
            }
        }

        tracing::debug!(worker_id = %self.record.identity, job_id = %job.id, "Worker terminating, handing job back");
        self.dispatcher.rehome(job, &self.record.identity).await;
        false
    }

    async fn execute(&self, job_id: JobId, text: String) {
        // Removal reports this worker's in-flight jobs lost.
        if self.record.is_terminating() {
            tracing::debug!(worker_id = %self.record.identity, job_id = %job_id, "Worker terminating, job not sent");
            return;
        }
        let Some(connection) = self.record.connection() else {
            self.dispatcher.fail_delivery(
                &self.record,
                &job_id,
                FleetError::Delivery("worker has no live connection".to_string()),
            );
            return;
        };

        match connection.deliver(text).await {
            Ok(()) => tracing::info!(worker_id = %self.record.identity, job_id = %job_id, "Job dispatched"),
            Err(e) => self.dispatcher.fail_delivery(&self.record, &job_id, e),
        }
    }
}
