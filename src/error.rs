use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid worker identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("No capable worker available for job type {0}")]
    NoCapableWorker(String),

    #[error("Job {job_id} lost: worker {worker_id} vanished and no peer could take it")]
    JobLost { job_id: Uuid, worker_id: String },

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job already live: {0}")]
    DuplicateJob(Uuid),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
