/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::archivist::{ArchiveCategory, ArchivedTask, Archivist};
use crate::config::RetentionConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::outbound::Outbound;
use crate::store::now_ms;
use crate::suspense::VoteSuspense;
use anyhow::Result;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Acknowledged jobs stay this long in the transient queue for inspection.
const FINISHED_JOB_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_votes: usize,
    pub flushed_batches: usize,
    pub pruned_jobs: u64,
    pub purged_archive: u64,
    pub purged_activity_log: u64,
}

#[derive(Clone)]
pub struct Maintenance {
    cfg: RetentionConfig,
    suspense: Arc<VoteSuspense>,
    outbound: Outbound,
    queue: DeliveryQueue,
    archivist: Archivist,
}

impl Maintenance {
    pub fn new(
        cfg: RetentionConfig,
        suspense: Arc<VoteSuspense>,
        outbound: Outbound,
        queue: DeliveryQueue,
        archivist: Archivist,
    ) -> Self {
        Self {
            cfg,
            suspense,
            outbound,
            queue,
            archivist,
        }
    }

    pub fn start_worker(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let interval = this.cfg.maintenance_interval_secs.max(1);
            let mut tick = tokio::time::interval(Duration::from_secs(interval));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {}
                }

                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = this.run_once().await {
                    warn!("maintenance error: {e:#}");
                }
            }
            // Pending batches would otherwise be lost with the process.
            if let Err(e) = this.outbound.flush_all_batches().await {
                warn!("final batch flush failed: {e:#}");
            }
        })
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        let expired = self.suspense.expire(now_ms());
        report.expired_votes = expired.len();
        for vote in expired {
            let payload = json!({
                "target": vote.target_uri,
                "actor": vote.actor_uri,
                "direction": vote.direction,
            });
            let task = ArchivedTask::new(ArchiveCategory::DeadLettered, "vote target never arrived")
                .activity(
                    Some(if vote.direction > 0 { "Like" } else { "Dislike" }.to_string()),
                    Some(vote.activity_id.clone()),
                )
                .payload(serde_json::to_vec(&payload)?);
            let archivist = self.archivist.clone();
            tokio::task::spawn_blocking(move || archivist.archive(&task)).await??;
        }
        if report.expired_votes > 0 {
            info!(expired = report.expired_votes, "suspended votes expired");
        }

        report.flushed_batches = self.outbound.flush_due_batches().await?;

        report.pruned_jobs = tokio::task::spawn_blocking({
            let q = self.queue.clone();
            move || q.prune_finished(FINISHED_JOB_TTL)
        })
        .await??;
        if report.pruned_jobs > 0 {
            info!(pruned = report.pruned_jobs, "maintenance pruned finished deliveries");
        }

        let retention = self.cfg.retention();
        let purged = tokio::task::spawn_blocking({
            let a = self.archivist.clone();
            move || a.purge_older_than(retention)
        })
        .await??;
        report.purged_archive = purged.archived;
        report.purged_activity_log = purged.activity_log;

        debug!(?report, "maintenance pass done");
        Ok(report)
    }
}
