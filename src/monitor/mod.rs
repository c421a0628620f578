//! Background fleet monitor.
//!
//! Every interval the monitor makes two independent passes over all
//! queues: starvation recovery moves long-waiting jobs to an idle peer,
//! and fairness reordering interleaves requesters within a queue. Both
//! passes work on snapshots and apply one targeted mutation at a time, so
//! no queue lock is held across a scan.

pub mod fairness;
pub mod starvation;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::scheduler::Dispatcher;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub migrated: usize,
    pub reordered_workers: Vec<String>,
}

pub struct FleetMonitor {
    dispatcher: Arc<Dispatcher>,
    config: MonitorConfig,
}

impl FleetMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, config: MonitorConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run cycles until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a fresh
        // coordinator does not scan empty queues.
        interval.tick().await;

        tracing::info!(interval_secs = self.config.interval.as_secs(), "Fleet monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.run_cycle(Utc::now()).await;
                    tracing::debug!(
                        migrated = report.migrated,
                        reordered = report.reordered_workers.len(),
                        "Fleet monitor cycle finished"
                    );
                }
            }
        }
        tracing::info!("Fleet monitor stopped");
    }

    /// One monitor cycle evaluated at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let migrated = starvation::recover_starving(&self.dispatcher, &self.config, now).await;
        let reordered_workers =
            fairness::rebalance(&self.dispatcher, self.config.fairness_block_len, now);
        CycleReport {
            migrated,
            reordered_workers,
        }
    }
}
