pub mod dispatcher;
pub mod job;
pub mod observer;
pub mod queue;
pub mod registry;

pub use dispatcher::{Dispatcher, MigrationReport};
pub use job::{Job, JobId, JobSpec, JobStatus, JobSummary};
pub use observer::{JobObserver, TracingObserver};
pub use queue::WorkerQueue;
pub use registry::{
    Descriptor, ProcessorState, QueueDepth, WorkerRecord, WorkerRegistry, WorkerSummary,
};
