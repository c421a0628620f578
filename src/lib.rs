pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use coordinator::{Assignment, Coordinator};
pub use error::{FleetError, Result};
