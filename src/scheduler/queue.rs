use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::{Job, JobId};

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    /// Jobs popped by the processing loop but not yet moved into the
    /// worker's in-flight slots
    staged: usize,
    closed: bool,
}

/// Ordered pending jobs for a single worker.
///
/// Every mutation happens under one short-lived lock, so a reorder or a
/// point removal can never interleave with a pop. The lock is never held
/// across an await.
#[derive(Debug, Default)]
pub struct WorkerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job. Hands the job back if the queue has been closed.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(job);
            }
            state.jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait until a job is available and pop it.
    ///
    /// Returns `None` when `cancel` fires or the queue is closed.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(job) = state.jobs.pop_front() {
                    state.staged += 1;
                    return Some(job);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// The popped job reached its worker slot (or was handed elsewhere).
    pub fn release_staged(&self) {
        let mut state = self.state();
        state.staged = state.staged.saturating_sub(1);
    }

    /// Queued plus staged jobs.
    pub fn len(&self) -> usize {
        let state = self.state();
        state.jobs.len() + state.staged
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.state().jobs.iter().cloned().collect()
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Job> {
        let mut state = self.state();
        let position = state.jobs.iter().position(|job| job.id == *job_id)?;
        state.jobs.remove(position)
    }

    /// Put the jobs named in `order` first, in that order, stamping each as
    /// migrated. Jobs not named keep their relative order behind them and
    /// named jobs that already left the queue are skipped.
    ///
    /// Returns the number of jobs that were reordered.
    pub fn reorder(&self, order: &[JobId], at: DateTime<Utc>) -> usize {
        let mut state = self.state();
        let mut slots: Vec<Option<Job>> = state.jobs.drain(..).map(Some).collect();
        let index: HashMap<JobId, usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|job| (job.id, i)))
            .collect();

        let mut reordered = VecDeque::with_capacity(slots.len());
        for id in order {
            if let Some(mut job) = index.get(id).and_then(|&i| slots[i].take()) {
                job.mark_migrated(at);
                reordered.push_back(job);
            }
        }
        let moved = reordered.len();
        reordered.extend(slots.into_iter().flatten());
        state.jobs = reordered;
        moved
    }

    /// Close the queue and take everything still in it. Parked poppers
    /// wake up and observe the closed state.
    pub fn close_and_drain(&self) -> Vec<Job> {
        let drained = {
            let mut state = self.state();
            state.closed = true;
            state.staged = 0;
            state.jobs.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }
}
