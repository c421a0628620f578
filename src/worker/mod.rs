//! Per-worker processing loop.
//!
//! Each registered worker gets one [`JobProcessor`] task, run under a
//! supervisor that restarts it if it stops while the worker is still live.
//!
//! # Cycle
//!
//! 1. **Dequeue**: park until the worker's queue has a job
//! 2. **Assign**: wait for the job type's slot, then move the job in
//! 3. **Execute**: write the job to the worker's connection
//!
//! A job whose write fails is reported to its owner and not retried.

pub mod processor;

pub use processor::JobProcessor;
