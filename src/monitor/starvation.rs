use chrono::{DateTime, Utc};

use crate::config::MonitorConfig;
use crate::scheduler::{Dispatcher, Job};

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - since).to_std().unwrap_or_default()
}

/// A job is starving once it has waited past the threshold and has not
/// been migrated within the cool-down window.
pub fn is_starving(job: &Job, now: DateTime<Utc>, config: &MonitorConfig) -> bool {
    if elapsed(job.created_at, now) <= config.starvation_threshold {
        return false;
    }
    match job.migrated_at {
        None => true,
        Some(at) => elapsed(at, now) > config.migration_cooldown,
    }
}

/// Move starving jobs to an idle capable peer. Busy peers are never
/// preferred over the current worker. Returns the number of jobs moved.
pub async fn recover_starving(dispatcher: &Dispatcher, config: &MonitorConfig, now: DateTime<Utc>) -> usize {
    let mut migrated = 0;
    for worker_id in dispatcher.worker_ids() {
        for job in dispatcher.view_queue(&worker_id) {
            if !is_starving(&job, now, config) {
                continue;
            }
            let Some(peer) = dispatcher
                .registry()
                .find_idle(job.job_type(), Some(&worker_id), dispatcher)
                .await
            else {
                continue;
            };
            if peer.identity == worker_id {
                continue;
            }
            if dispatcher
                .migrate_job(&worker_id, &peer.identity, &job.id, now)
                .await
            {
                tracing::info!(
                    job_id = %job.id,
                    from = %worker_id,
                    to = %peer.identity,
                    waited_secs = elapsed(job.created_at, now).as_secs(),
                    "Starving job migrated"
                );
                migrated += 1;
            }
        }
    }
    migrated
}
