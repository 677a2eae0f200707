/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable record of federation work that will never complete.

use crate::store::{now_ms, FederationDb};
use anyhow::Result;
use rusqlite::params;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCategory {
    /// Gave up after exhausting retries.
    FailedTask,
    /// Refused by the peer, or dropped without ever being attempted.
    DeadLettered,
}

impl ArchiveCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedTask => "failed_task",
            Self::DeadLettered => "dead_lettered",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "failed_task" {
            Self::FailedTask
        } else {
            Self::DeadLettered
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedTask {
    pub category: ArchiveCategory,
    pub activity_type: Option<String>,
    pub activity_id: Option<String>,
    pub failure_reason: String,
    pub instance_domain: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub archived_at_ms: i64,
}

impl ArchivedTask {
    pub fn new(category: ArchiveCategory, failure_reason: impl Into<String>) -> Self {
        Self {
            category,
            activity_type: None,
            activity_id: None,
            failure_reason: failure_reason.into(),
            instance_domain: None,
            payload: None,
            archived_at_ms: now_ms(),
        }
    }

    pub fn activity(mut self, ty: Option<String>, id: Option<String>) -> Self {
        self.activity_type = ty;
        self.activity_id = id;
        self
    }

    pub fn instance(mut self, domain: impl Into<String>) -> Self {
        self.instance_domain = Some(domain.into());
        self
    }

    pub fn payload(mut self, bytes: Vec<u8>) -> Self {
        self.payload = Some(bytes);
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub archived: u64,
    pub activity_log: u64,
}

#[derive(Clone)]
pub struct Archivist {
    db: FederationDb,
}

impl Archivist {
    pub fn new(db: FederationDb) -> Self {
        Self { db }
    }

    /// Written on a connection of its own and committed before returning, so the record
    /// survives whatever happens to the caller's work afterwards.
    pub fn archive(&self, task: &ArchivedTask) -> Result<i64> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO archived_tasks(category, activity_type, activity_id, failure_reason, instance_domain, payload, archived_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                task.category.as_str(),
                task.activity_type,
                task.activity_id,
                task.failure_reason,
                task.instance_domain,
                task.payload,
                task.archived_at_ms
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn list(&self, category: Option<ArchiveCategory>, limit: u32) -> Result<Vec<ArchivedTask>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT category, activity_type, activity_id, failure_reason, instance_domain, payload, archived_at_ms
            FROM archived_tasks
            WHERE ?1 IS NULL OR category = ?1
            ORDER BY archived_at_ms DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![category.map(|c| c.as_str()), limit], |r| {
            let category: String = r.get(0)?;
            Ok(ArchivedTask {
                category: ArchiveCategory::from_db(&category),
                activity_type: r.get(1)?,
                activity_id: r.get(2)?,
                failure_reason: r.get(3)?,
                instance_domain: r.get(4)?,
                payload: r.get(5)?,
                archived_at_ms: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Retention purge of archived tasks and of terminal activity-log entries.
    pub fn purge_older_than(&self, age: Duration) -> Result<PurgeStats> {
        self.purge_before(now_ms().saturating_sub(age.as_millis() as i64))
    }

    pub fn purge_before(&self, cutoff_ms: i64) -> Result<PurgeStats> {
        let conn = self.db.conn()?;
        let archived = conn.execute(
            "DELETE FROM archived_tasks WHERE archived_at_ms < ?1",
            params![cutoff_ms],
        )? as u64;
        let activity_log = conn.execute(
            "DELETE FROM activity_log WHERE result IS NOT NULL AND created_at_ms < ?1",
            params![cutoff_ms],
        )? as u64;
        if archived + activity_log > 0 {
            info!(archived, activity_log, "retention purge");
        }
        Ok(PurgeStats {
            archived,
            activity_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_protocol::{ActivityKind, ActivityOutcome, Direction};
    use tempfile::TempDir;

    #[test]
    fn archive_then_purge() {
        let dir = TempDir::new().unwrap();
        let db = FederationDb::open(dir.path().join("fed.db")).unwrap();
        let archivist = Archivist::new(db.clone());

        let mut old = ArchivedTask::new(ArchiveCategory::FailedTask, "timeout")
            .activity(Some("Announce".into()), Some("https://l.example/a/1".into()))
            .instance("slow.example");
        old.archived_at_ms = 1_000;
        archivist.archive(&old).unwrap();
        archivist
            .archive(&ArchivedTask::new(ArchiveCategory::DeadLettered, "403 Forbidden"))
            .unwrap();

        db.claim_activity("in-progress", ActivityKind::Like, Direction::In).unwrap();
        db.record_activity("done", ActivityKind::Like, Direction::In, ActivityOutcome::Success, None)
            .unwrap();

        let stats = archivist.purge_before(2_000).unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.activity_log, 0);

        let left = archivist.list(None, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].category, ArchiveCategory::DeadLettered);

        let stats = archivist.purge_before(now_ms() + 1_000).unwrap();
        assert_eq!(stats.activity_log, 1);
        assert!(db.get_activity("in-progress").unwrap().is_some());
        assert!(db.get_activity("done").unwrap().is_none());
    }
}
