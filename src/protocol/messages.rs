//! Wire format between coordinator and workers.
//!
//! Every frame is a JSON text message `{"command": ..., "payload": {...}}`.
//! Inbound frames decode into [`WorkerCommand`]; anything that is not a
//! known command is rejected.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::scheduler::{Descriptor, Job, JobId};

pub const REGISTER_WORKER: &str = "register_worker";
pub const UNREGISTER_WORKER: &str = "unregister_worker";
pub const JOB_ACK: &str = "job_ack";
pub const JOB_COMPLETE: &str = "job_complete";
pub const JOB_RESULT: &str = "job_result";

pub const REGISTERED: &str = "registered";
pub const EXECUTE_JOB: &str = "execute_job";
pub const ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid payload for {command}: {source}")]
    InvalidPayload {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Errors after which the connection cannot be trusted to stay in sync.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_) | ProtocolError::BinaryFrame)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterPayload {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    #[serde(default)]
    pub hardware_limits: Descriptor,
    #[serde(default)]
    pub hardware_info: Descriptor,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerRef {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobRef {
    pub worker_id: String,
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobResultPayload {
    pub worker_id: String,
    pub job_id: JobId,
    #[serde(default)]
    pub result: Value,
}

/// Worker -> coordinator commands.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Register(RegisterPayload),
    Unregister(WorkerRef),
    Acknowledge(JobRef),
    Complete(JobRef),
    Result(JobResultPayload),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    command: String,
    #[serde(default)]
    payload: Value,
}

fn payload<T: DeserializeOwned>(raw: RawFrame) -> Result<T, ProtocolError> {
    serde_json::from_value(raw.payload).map_err(|source| ProtocolError::InvalidPayload {
        command: raw.command,
        source,
    })
}

impl WorkerCommand {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        match raw.command.as_str() {
            REGISTER_WORKER => payload(raw).map(WorkerCommand::Register),
            UNREGISTER_WORKER => payload(raw).map(WorkerCommand::Unregister),
            JOB_ACK => payload(raw).map(WorkerCommand::Acknowledge),
            JOB_COMPLETE => payload(raw).map(WorkerCommand::Complete),
            JOB_RESULT => payload(raw).map(WorkerCommand::Result),
            _ => Err(ProtocolError::UnknownCommand(raw.command)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Register(_) => REGISTER_WORKER,
            WorkerCommand::Unregister(_) => UNREGISTER_WORKER,
            WorkerCommand::Acknowledge(_) => JOB_ACK,
            WorkerCommand::Complete(_) => JOB_COMPLETE,
            WorkerCommand::Result(_) => JOB_RESULT,
        }
    }

    /// Identity the command claims to come from.
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerCommand::Register(p) => &p.worker_id,
            WorkerCommand::Unregister(p) => &p.worker_id,
            WorkerCommand::Acknowledge(p) | WorkerCommand::Complete(p) => &p.worker_id,
            WorkerCommand::Result(p) => &p.worker_id,
        }
    }
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    command: &'a str,
    payload: T,
}

pub fn encode<T: Serialize>(command: &str, payload: T) -> Result<String, ProtocolError> {
    serde_json::to_string(&Frame { command, payload }).map_err(ProtocolError::Encode)
}

pub fn execute_job_frame(job: &Job) -> Result<String, ProtocolError> {
    encode(EXECUTE_JOB, job.envelope())
}

pub fn registered_frame(worker_id: &str) -> Result<String, ProtocolError> {
    encode(REGISTERED, serde_json::json!({ "worker_id": worker_id }))
}

pub fn error_frame(message: &str) -> Result<String, ProtocolError> {
    encode(ERROR, serde_json::json!({ "message": message }))
}

/// Why the coordinator closed a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// Explicit unregister or eviction by a newer registration
    Deregistered,
    BadCredential,
    MalformedFrame,
    IdleTimeout,
    Error,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::Deregistered => 4000,
            CloseReason::BadCredential => 4001,
            CloseReason::MalformedFrame => 4002,
            CloseReason::IdleTimeout => 4008,
            CloseReason::Error => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Normal => "closing",
            CloseReason::Deregistered => "deregistered",
            CloseReason::BadCredential => "invalid credential",
            CloseReason::MalformedFrame => "malformed frame",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Error => "internal error",
        }
    }
}
