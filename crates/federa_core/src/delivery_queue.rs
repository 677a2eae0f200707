/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::archivist::{ArchiveCategory, ArchivedTask, Archivist};
use crate::config::QueueConfig;
use crate::delivery::{AttemptOutcome, Signer, Transport};
use crate::health::{AttemptResult, HealthState, HealthTracker};
use crate::store::{now_ms, FederationDb};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_DELIVERED: i64 = 1;
const STATUS_DEAD: i64 = 2;

/// One activity addressed to one inbox.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub inbox: String,
    pub domain: String,
    pub signer_actor_id: i64,
    pub activity_json: Vec<u8>,
    pub activity_id: Option<String>,
    pub activity_type: Option<String>,
}

#[derive(Debug, Clone)]
struct Job {
    id: String,
    attempt: u32,
    inbox: String,
    domain: String,
    signer_actor_id: i64,
    activity_json: Vec<u8>,
    activity_id: Option<String>,
    activity_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub delivered: u64,
    pub dead: u64,
}

/// Persistent outbound task queue. Jobs live in the `delivery_jobs` table of the federation
/// database; the worker drains due jobs, signs and posts them, feeds every completed attempt
/// to the health tracker and archives whatever cannot be delivered.
#[derive(Clone)]
pub struct DeliveryQueue {
    db: FederationDb,
    notify: Arc<Notify>,
    settings: QueueConfig,
    health: HealthTracker,
    archivist: Archivist,
    transport: Arc<dyn Transport>,
    worker_running: Arc<AtomicBool>,
}

impl DeliveryQueue {
    pub fn open(
        db: FederationDb,
        settings: QueueConfig,
        health: HealthTracker,
        archivist: Archivist,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        init_db(&db.conn()?)?;
        Ok(Self {
            db,
            notify: Arc::new(Notify::new()),
            settings,
            health,
            archivist,
            transport,
            worker_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let created_at = now_ms();
        let count = tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<u64> {
                let mut conn = db.conn()?;
                let tx = conn.transaction()?;
                for j in &jobs {
                    tx.execute(
                        r#"
                        INSERT INTO delivery_jobs (
                          id, created_at_ms, next_attempt_at_ms, attempt, status, inbox, domain,
                          signer_actor_id, activity_json, activity_id, activity_type, last_error
                        ) VALUES (?1, ?2, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
                        "#,
                        params![
                            new_job_id(),
                            created_at,
                            STATUS_PENDING,
                            j.inbox,
                            j.domain,
                            j.signer_actor_id,
                            j.activity_json,
                            j.activity_id,
                            j.activity_type
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(jobs.len() as u64)
            }
        })
        .await??;

        self.notify.notify_one();
        Ok(count)
    }

    /// Spawn the delivery worker. Jobs are read and settled without a claim column, so at
    /// most one worker may run per queue; a second call returns an already finished task.
    pub fn start_worker(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        if self.worker_running.swap(true, Ordering::SeqCst) {
            warn!("delivery worker already running, not starting another");
            return tokio::spawn(async {});
        }
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown).await {
                warn!("delivery worker stopped: {e:#}");
            }
            queue.worker_running.store(false, Ordering::SeqCst);
        })
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("delivery queue db: {}", self.db.path().display());

        let tick = Duration::from_secs(self.settings.tick_secs.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.process_due_once().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("delivery pass failed: {e:#}");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// One pass over due jobs. Returns the number of jobs that reached a decision.
    pub async fn process_due_once(&self) -> Result<usize> {
        let jobs = self.fetch_due_jobs(self.settings.fetch_batch.max(1)).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        // Identical payloads from the same signer to the same inbox go out once.
        let mut groups: HashMap<(i64, String, String), Vec<Job>> = HashMap::new();
        for job in jobs {
            let key = (
                job.signer_actor_id,
                job.inbox.clone(),
                short_body_hash(&job.activity_json),
            );
            groups.entry(key).or_default().push(job);
        }

        let mut done = 0;
        for ((signer_actor_id, inbox, _), jobs) in groups {
            match self.process_group(signer_actor_id, &inbox, jobs).await {
                Ok(n) => done += n,
                Err(e) => warn!(inbox, "delivery group error: {e:#}"),
            }
        }
        Ok(done)
    }

    async fn process_group(&self, signer_actor_id: i64, inbox: &str, jobs: Vec<Job>) -> Result<usize> {
        let Some(first) = jobs.first() else { return Ok(0) };
        let domain = first.domain.clone();

        let health = {
            let db = self.db.clone();
            let domain = domain.clone();
            tokio::task::spawn_blocking(move || db.get_instance(&domain))
                .await??
                .map(|i| i.health)
                .unwrap_or_default()
        };
        let now = now_ms();
        match health.state() {
            HealthState::GoneForever => {
                for job in &jobs {
                    self.give_up(job, ArchiveCategory::FailedTask, "instance gone forever")
                        .await?;
                }
                return Ok(jobs.len());
            }
            HealthState::Dormant if !health.is_deliverable(now) => {
                // Still backing off: wait for the deadline without burning an attempt.
                let wait_ms = health.start_trying_again_ms.unwrap_or(now).saturating_sub(now);
                let delay = Duration::from_millis(wait_ms.max(0) as u64);
                for job in &jobs {
                    self.reschedule(&job.id, job.attempt, delay, "instance dormant").await?;
                }
                return Ok(0);
            }
            _ => {}
        }

        let signer = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || db.get_actor(signer_actor_id)).await??
        };
        let signer = match signer {
            Some(a) => match a.private_key_pem.clone() {
                Some(private_key_pem) => Signer {
                    key_id: a.key_id(),
                    private_key_pem,
                },
                None => return Err(anyhow!("signer {signer_actor_id} has no private key")),
            },
            None => {
                for job in &jobs {
                    self.give_up(job, ArchiveCategory::DeadLettered, "signing actor is gone")
                        .await?;
                }
                return Ok(jobs.len());
            }
        };

        let body = Bytes::from(first.activity_json.clone());
        let outcome = self.transport.post_activity(&signer, inbox, body).await;
        debug!(inbox, ?outcome, jobs = jobs.len(), "delivery outcome");

        // Health first, then archive, then the job itself.
        let attempt_result = match outcome {
            AttemptOutcome::Delivered | AttemptOutcome::Rejected { .. } => AttemptResult::Success,
            AttemptOutcome::Transient(_) => AttemptResult::Failure,
        };
        {
            let health = self.health.clone();
            let domain = domain.clone();
            tokio::task::spawn_blocking(move || health.record_attempt(&domain, attempt_result))
                .await??;
        }

        let mut done = 0;
        for job in jobs {
            match &outcome {
                AttemptOutcome::Delivered => {
                    self.mark(&job.id, STATUS_DELIVERED, None).await?;
                    done += 1;
                }
                AttemptOutcome::Rejected { .. } => {
                    let why = outcome.to_error().map(|e| e.to_string()).unwrap_or_default();
                    self.give_up(&job, ArchiveCategory::DeadLettered, &why).await?;
                    done += 1;
                }
                AttemptOutcome::Transient(err) => {
                    let attempt_no = job.attempt.saturating_add(1);
                    if attempt_no >= self.settings.max_attempts {
                        let why = format!("gave up after {attempt_no} attempts: {err}");
                        self.give_up(&job, ArchiveCategory::FailedTask, &why).await?;
                        done += 1;
                    } else {
                        let delay = next_backoff(
                            attempt_no,
                            self.settings.base_backoff_secs,
                            self.settings.max_backoff_secs,
                        );
                        self.reschedule(&job.id, attempt_no, delay, err).await?;
                    }
                }
            }
        }
        Ok(done)
    }

    async fn give_up(&self, job: &Job, category: ArchiveCategory, reason: &str) -> Result<()> {
        let task = ArchivedTask::new(category, reason)
            .activity(job.activity_type.clone(), job.activity_id.clone())
            .instance(job.domain.clone())
            .payload(job.activity_json.clone());
        tokio::task::spawn_blocking({
            let archivist = self.archivist.clone();
            move || archivist.archive(&task)
        })
        .await??;
        warn!(
            inbox = job.inbox,
            activity_id = ?job.activity_id,
            category = category.as_str(),
            "delivery abandoned: {reason}"
        );
        self.mark(&job.id, STATUS_DEAD, Some(reason)).await
    }

    async fn fetch_due_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<Vec<Job>> {
                let conn = db.conn()?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, attempt, inbox, domain, signer_actor_id, activity_json, activity_id, activity_type
                    FROM delivery_jobs
                    WHERE status = ?1 AND next_attempt_at_ms <= ?2
                    ORDER BY next_attempt_at_ms ASC
                    LIMIT ?3
                    "#,
                )?;
                let mut rows = stmt.query(params![STATUS_PENDING, now_ms(), limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Job {
                        id: row.get(0)?,
                        attempt: row.get(1)?,
                        inbox: row.get(2)?,
                        domain: row.get(3)?,
                        signer_actor_id: row.get(4)?,
                        activity_json: row.get(5)?,
                        activity_id: row.get(6)?,
                        activity_type: row.get(7)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    async fn mark(&self, id: &str, status: i64, err: Option<&str>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let id = id.to_string();
            let err = err.map(str::to_string);
            move || -> Result<()> {
                let conn = db.conn()?;
                conn.execute(
                    "UPDATE delivery_jobs SET status = ?2, last_error = ?3, finished_at_ms = ?4 WHERE id = ?1",
                    params![id, status, err, now_ms()],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = db.conn()?;
                conn.execute(
                    "UPDATE delivery_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                    params![id, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Make every pending job due now. Used by operators after reviving an instance.
    pub fn make_all_due(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "UPDATE delivery_jobs SET next_attempt_at_ms = ?2 WHERE status = ?1",
            params![STATUS_PENDING, now_ms()],
        )?;
        self.notify.notify_one();
        Ok(n as u64)
    }

    /// Drop acknowledged jobs; their trace lives in the archive and the activity log.
    pub fn prune_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(older_than.as_millis() as i64);
        let conn = self.db.conn()?;
        let n = conn.execute(
            "DELETE FROM delivery_jobs WHERE status IN (?1, ?2) AND finished_at_ms < ?3",
            params![STATUS_DELIVERED, STATUS_DEAD, cutoff],
        )?;
        Ok(n as u64)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.conn()?;
        let count = |status: i64| -> Result<u64> {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM delivery_jobs WHERE status = ?1",
                params![status],
                |r| r.get(0),
            )?)
        };
        Ok(QueueStats {
            pending: count(STATUS_PENDING)?,
            delivered: count(STATUS_DELIVERED)?,
            dead: count(STATUS_DEAD)?,
        })
    }

    pub fn pending_inboxes(&self) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT inbox FROM delivery_jobs WHERE status = ?1 ORDER BY created_at_ms, inbox",
        )?;
        let rows = stmt.query_map(params![STATUS_PENDING], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          inbox TEXT NOT NULL,
          domain TEXT NOT NULL,
          signer_actor_id INTEGER NOT NULL,
          activity_json BLOB NOT NULL,
          activity_id TEXT NULL,
          activity_type TEXT NULL,
          last_error TEXT NULL,
          finished_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_jobs(status, next_attempt_at_ms);
        "#,
    )
    .context("init delivery_jobs")?;
    Ok(())
}

fn short_body_hash(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    let mut h = sha2::Sha256::new();
    h.update(bytes);
    hex::encode(&h.finalize()[..8])
}

fn new_job_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
