use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::scheduler::{Dispatcher, Job, JobId};

/// True if the not-yet-migrated jobs contain a run of more than
/// `block_len` consecutive jobs from one requester. Migrated jobs are
/// skipped entirely.
pub fn has_block(jobs: &[Job], block_len: usize) -> bool {
    let mut run = 0;
    let mut last: Option<&str> = None;
    for job in jobs.iter().filter(|job| !job.is_migrated()) {
        if last == Some(job.requester()) {
            run += 1;
        } else {
            last = Some(job.requester());
            run = 1;
        }
        if run > block_len {
            return true;
        }
    }
    false
}

/// Round-robin the jobs across requesters, requesters ordered by first
/// appearance: A1, B1, C1, A2, B2, ...
pub fn interleave(jobs: &[Job]) -> Vec<JobId> {
    let mut requesters: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, VecDeque<JobId>> = HashMap::new();
    for job in jobs {
        let group = groups.entry(job.requester()).or_insert_with(|| {
            requesters.push(job.requester());
            VecDeque::new()
        });
        group.push_back(job.id);
    }

    let mut seen = HashSet::with_capacity(jobs.len());
    let mut order = Vec::with_capacity(jobs.len());
    loop {
        let mut progressed = false;
        for requester in &requesters {
            let Some(id) = groups.get_mut(requester).and_then(VecDeque::pop_front) else {
                continue;
            };
            progressed = true;
            if seen.insert(id) {
                order.push(id);
            }
        }
        if !progressed {
            break;
        }
    }
    order
}

/// New order for a queue that needs fairness reordering, if any.
pub fn plan_reorder(jobs: &[Job], block_len: usize) -> Option<Vec<JobId>> {
    let requesters: HashSet<&str> = jobs.iter().map(Job::requester).collect();
    if requesters.len() < 2 || !has_block(jobs, block_len) {
        return None;
    }
    Some(interleave(jobs))
}

/// Reorder every queue holding a same-requester block. Jobs never change
/// worker. Returns the identities of the reordered workers.
pub fn rebalance(dispatcher: &Dispatcher, block_len: usize, now: DateTime<Utc>) -> Vec<String> {
    let mut reordered = Vec::new();
    for worker_id in dispatcher.worker_ids() {
        let jobs = dispatcher.view_queue(&worker_id);
        let Some(order) = plan_reorder(&jobs, block_len) else {
            continue;
        };
        let moved = dispatcher.replace_queue(&worker_id, &order, now);
        tracing::info!(worker_id = %worker_id, jobs = moved, "Queue reordered for fairness");
        reordered.push(worker_id);
    }
    reordered
}
