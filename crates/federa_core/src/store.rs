/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::health::InstanceHealth;
use anyhow::{anyhow, Context, Result};
use federa_protocol::{ActivityKind, ActivityOutcome, Direction};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// In-progress activity claims older than this are considered abandoned by a crashed worker.
const STALE_CLAIM_MS: i64 = 10 * 60 * 1000;

#[derive(Clone)]
pub struct FederationDb {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Person,
    Group,
    Application,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Group => "Group",
            Self::Application => "Application",
        }
    }

    pub fn from_ap_type(ty: &str) -> Option<Self> {
        match ty {
            "Person" | "Service" => Some(Self::Person),
            "Group" => Some(Self::Group),
            "Application" => Some(Self::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub domain: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub vote_weight: f64,
    pub trusted: bool,
    pub health: InstanceHealth,
    pub last_seen_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl Instance {
    pub fn software_is(&self, names: &[String]) -> bool {
        let Some(sw) = self.software.as_deref() else { return false };
        names.iter().any(|n| n.eq_ignore_ascii_case(sw.trim()))
    }
}

/// A user or community. Local actors own a keypair; remote ones only carry a public key,
/// which is never replaced once stored.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: i64,
    pub ap_id: String,
    pub kind: ActorKind,
    pub name: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub followers_url: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub instance_id: i64,
    pub domain: String,
    pub local: bool,
    pub deleted: bool,
}

impl Actor {
    pub fn can_be_followed(&self) -> bool {
        self.kind == ActorKind::Group
    }

    pub fn can_receive_activities(&self) -> bool {
        self.inbox.is_some() || self.shared_inbox.is_some()
    }

    pub fn owns_keypair(&self) -> bool {
        self.private_key_pem.is_some()
    }

    pub fn key_id(&self) -> String {
        self.public_key_id
            .clone()
            .unwrap_or_else(|| format!("{}#main-key", self.ap_id))
    }

    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct NewActor {
    pub ap_id: String,
    pub kind: ActorKind,
    pub name: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub followers_url: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub domain: String,
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Post,
    Reply,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Reply => "reply",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "reply" {
            Self::Reply
        } else {
            Self::Post
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederatedObject {
    pub id: i64,
    pub ap_id: Option<String>,
    pub kind: ObjectKind,
    pub author_id: i64,
    pub community_id: i64,
    pub parent_id: Option<i64>,
    pub post_id: Option<i64>,
    pub path: String,
    pub depth: u32,
    pub title: Option<String>,
    pub body: Option<String>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: f64,
    pub deleted: bool,
    pub local: bool,
    pub published_ms: i64,
    pub updated_at_ms: i64,
}

impl FederatedObject {
    /// External id for remote objects, local URL otherwise.
    pub fn canonical_uri(&self, base_url: &str) -> String {
        if let Some(ap_id) = &self.ap_id {
            return ap_id.clone();
        }
        let base = base_url.trim_end_matches('/');
        match self.kind {
            ObjectKind::Post => format!("{base}/post/{}", self.id),
            ObjectKind::Reply => format!("{base}/comment/{}", self.id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewObject {
    pub ap_id: Option<String>,
    pub kind: ObjectKind,
    pub author_id: i64,
    pub community_id: i64,
    pub parent_id: Option<i64>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub local: bool,
    pub published_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRecord {
    pub object_id: i64,
    pub actor_id: i64,
    pub direction: i8,
    pub weight: f64,
    pub activity_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActivityLogEntry {
    pub activity_id: String,
    pub activity_type: String,
    pub direction: String,
    pub result: Option<ActivityOutcome>,
    pub exception: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct FollowerInbox {
    pub follower_id: i64,
    pub instance: Instance,
    pub inbox: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFollowState {
    Pending,
    Accepted,
}

impl RemoteFollowState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

const INSTANCE_COLS: &str = "id, domain, inbox, shared_inbox, software, version, vote_weight, trusted, \
     failures, dormant, gone_forever, last_successful_send_ms, last_attempt_ms, start_trying_again_ms, \
     last_seen_ms, created_at_ms";

const ACTOR_COLS: &str = "a.id, a.ap_id, a.kind, a.name, a.inbox, a.shared_inbox, a.followers_url, \
     a.public_key_id, a.public_key_pem, a.private_key_pem, a.instance_id, i.domain, a.local, a.deleted";

const OBJECT_COLS: &str = "id, ap_id, kind, author_id, community_id, parent_id, post_id, path, depth, \
     title, body, upvotes, downvotes, score, deleted, local, published_ms, updated_at_ms";

impl FederationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create db dir: {}", dir.display()))?;
            }
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS instances (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              domain TEXT NOT NULL UNIQUE,
              inbox TEXT NULL,
              shared_inbox TEXT NULL,
              software TEXT NULL,
              version TEXT NULL,
              vote_weight REAL NOT NULL DEFAULT 1.0,
              trusted INTEGER NOT NULL DEFAULT 0,
              failures INTEGER NOT NULL DEFAULT 0,
              dormant INTEGER NOT NULL DEFAULT 0,
              gone_forever INTEGER NOT NULL DEFAULT 0,
              last_successful_send_ms INTEGER NULL,
              last_attempt_ms INTEGER NULL,
              start_trying_again_ms INTEGER NULL,
              last_seen_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              ap_id TEXT NOT NULL UNIQUE,
              kind TEXT NOT NULL,
              name TEXT NOT NULL,
              inbox TEXT NULL,
              shared_inbox TEXT NULL,
              followers_url TEXT NULL,
              public_key_id TEXT NULL,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              instance_id INTEGER NOT NULL,
              local INTEGER NOT NULL,
              deleted INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_local_name ON actors(kind, name) WHERE local = 1;

            -- ap_id is NULL for local objects that never came from elsewhere.
            CREATE TABLE IF NOT EXISTS objects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              ap_id TEXT NULL UNIQUE,
              kind TEXT NOT NULL,
              author_id INTEGER NOT NULL,
              community_id INTEGER NOT NULL,
              parent_id INTEGER NULL,
              post_id INTEGER NULL,
              path TEXT NOT NULL,
              depth INTEGER NOT NULL,
              title TEXT NULL,
              body TEXT NULL,
              upvotes INTEGER NOT NULL DEFAULT 0,
              downvotes INTEGER NOT NULL DEFAULT 0,
              score REAL NOT NULL DEFAULT 0,
              deleted INTEGER NOT NULL DEFAULT 0,
              local INTEGER NOT NULL,
              published_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_objects_community ON objects(community_id);

            CREATE TABLE IF NOT EXISTS votes (
              object_id INTEGER NOT NULL,
              actor_id INTEGER NOT NULL,
              direction INTEGER NOT NULL,
              weight REAL NOT NULL,
              activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(object_id, actor_id)
            );
            CREATE INDEX IF NOT EXISTS idx_votes_activity ON votes(activity_id);

            CREATE TABLE IF NOT EXISTS community_followers (
              community_id INTEGER NOT NULL,
              follower_id INTEGER NOT NULL,
              follow_activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(community_id, follower_id)
            );

            CREATE TABLE IF NOT EXISTS remote_follows (
              actor_id INTEGER NOT NULL,
              community_id INTEGER NOT NULL,
              state TEXT NOT NULL,
              activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(actor_id, community_id)
            );

            CREATE TABLE IF NOT EXISTS instance_blocks (
              domain TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actor_blocks (
              blocker_id INTEGER NOT NULL,
              blocked_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(blocker_id, blocked_id)
            );

            -- result stays NULL while a dispatcher holds the claim.
            CREATE TABLE IF NOT EXISTS activity_log (
              activity_id TEXT PRIMARY KEY,
              activity_type TEXT NOT NULL,
              direction TEXT NOT NULL,
              result TEXT NULL,
              exception TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              finished_at_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_log_created ON activity_log(created_at_ms);

            CREATE TABLE IF NOT EXISTS archived_tasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              category TEXT NOT NULL,
              activity_type TEXT NULL,
              activity_id TEXT NULL,
              failure_reason TEXT NOT NULL,
              instance_domain TEXT NULL,
              payload BLOB NULL,
              archived_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_archived_at ON archived_tasks(archived_at_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Run blocking store work off the async runtime.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&FederationDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("store task panicked")?
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- instances -------------------------------------------------------------------------

    pub fn get_instance(&self, domain: &str) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances WHERE domain=?1");
        Ok(conn
            .query_row(&sql, params![normalize_domain(domain)], instance_from_row)
            .optional()?)
    }

    pub fn get_instance_by_id(&self, id: i64) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances WHERE id=?1");
        Ok(conn.query_row(&sql, params![id], instance_from_row).optional()?)
    }

    pub fn get_or_create_instance(&self, domain: &str) -> Result<Instance> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(anyhow!("empty instance domain"));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO instances(domain, created_at_ms) VALUES (?1, ?2)",
            params![domain, now_ms()],
        )?;
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances WHERE domain=?1");
        Ok(conn.query_row(&sql, params![domain], instance_from_row)?)
    }

    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances ORDER BY domain");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], instance_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_instance_software(&self, domain: &str, software: &str, version: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET software=?2, version=?3 WHERE domain=?1",
            params![normalize_domain(domain), software.trim().to_ascii_lowercase(), version],
        )?;
        Ok(())
    }

    pub fn set_instance_inboxes(&self, domain: &str, inbox: Option<&str>, shared_inbox: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET inbox=COALESCE(inbox, ?2), shared_inbox=COALESCE(shared_inbox, ?3) WHERE domain=?1",
            params![normalize_domain(domain), inbox, shared_inbox],
        )?;
        Ok(())
    }

    pub fn set_instance_vote_weight(&self, domain: &str, weight: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET vote_weight=?2 WHERE domain=?1",
            params![normalize_domain(domain), weight],
        )?;
        Ok(())
    }

    pub fn set_instance_trusted(&self, domain: &str, trusted: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET trusted=?2 WHERE domain=?1",
            params![normalize_domain(domain), trusted as i64],
        )?;
        Ok(())
    }

    pub fn touch_instance_seen(&self, domain: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET last_seen_ms=?2 WHERE domain=?1",
            params![normalize_domain(domain), now_ms()],
        )?;
        Ok(())
    }

    /// Read-modify-write of an instance's health under an immediate transaction.
    /// Returns the state before and after.
    pub fn update_instance_health<F>(&self, domain: &str, f: F) -> Result<(InstanceHealth, InstanceHealth)>
    where
        F: FnOnce(&InstanceHealth) -> InstanceHealth,
    {
        let domain = normalize_domain(domain);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO instances(domain, created_at_ms) VALUES (?1, ?2)",
            params![domain, now_ms()],
        )?;
        let sql = format!("SELECT {INSTANCE_COLS} FROM instances WHERE domain=?1");
        let before = tx.query_row(&sql, params![domain], instance_from_row)?.health;
        let after = f(&before);
        tx.execute(
            r#"
            UPDATE instances SET failures=?2, dormant=?3, gone_forever=?4,
              last_successful_send_ms=?5, last_attempt_ms=?6, start_trying_again_ms=?7
            WHERE domain=?1
            "#,
            params![
                domain,
                after.failures,
                after.dormant as i64,
                after.gone_forever as i64,
                after.last_successful_send_ms,
                after.last_attempt_ms,
                after.start_trying_again_ms
            ],
        )?;
        tx.commit()?;
        Ok((before, after))
    }

    // ---- actors ----------------------------------------------------------------------------

    pub fn get_actor(&self, id: i64) -> Result<Option<Actor>> {
        self.query_actor("a.id=?1", params![id])
    }

    pub fn find_actor_by_ap_id(&self, ap_id: &str) -> Result<Option<Actor>> {
        self.query_actor("a.ap_id=?1", params![ap_id.trim()])
    }

    pub fn find_local_actor(&self, kind: ActorKind, name: &str) -> Result<Option<Actor>> {
        self.query_actor(
            "a.local=1 AND a.kind=?1 AND a.name=?2",
            params![kind.as_str(), name],
        )
    }

    fn query_actor(&self, cond: &str, p: impl rusqlite::Params) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ACTOR_COLS} FROM actors a JOIN instances i ON i.id = a.instance_id WHERE {cond}"
        );
        Ok(conn.query_row(&sql, p, actor_from_row).optional()?)
    }

    /// Insert-or-fetch keyed on `ap_id`. An existing row always wins, so a stored public key
    /// can never be swapped by a later fetch. The bool is true when this call inserted.
    pub fn insert_or_fetch_actor(&self, new: &NewActor) -> Result<(Actor, bool)> {
        let instance = self.get_or_create_instance(&new.domain)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM actors WHERE ap_id=?1",
                params![new.ap_id],
                |r| r.get(0),
            )
            .optional()?;
        let (id, created) = match existing {
            Some(id) => (id, false),
            None => {
                tx.execute(
                    r#"
                    INSERT INTO actors(ap_id, kind, name, inbox, shared_inbox, followers_url,
                      public_key_id, public_key_pem, private_key_pem, instance_id, local, deleted, created_at_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
                    "#,
                    params![
                        new.ap_id,
                        new.kind.as_str(),
                        new.name,
                        new.inbox,
                        new.shared_inbox,
                        new.followers_url,
                        new.public_key_id,
                        new.public_key_pem,
                        new.private_key_pem,
                        instance.id,
                        new.local as i64,
                        now_ms()
                    ],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };
        tx.commit()?;
        let actor = self
            .get_actor(id)?
            .ok_or_else(|| anyhow!("actor {id} vanished after insert"))?;
        Ok((actor, created))
    }

    /// Refresh display data of a remote actor. Keys are deliberately not part of this.
    pub fn update_actor_profile(
        &self,
        id: i64,
        name: &str,
        inbox: Option<&str>,
        shared_inbox: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE actors SET name=?2, inbox=COALESCE(?3, inbox), shared_inbox=COALESCE(?4, shared_inbox) WHERE id=?1 AND local=0",
            params![id, name, inbox, shared_inbox],
        )?;
        Ok(())
    }

    pub fn mark_actor_deleted(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE actors SET deleted=1 WHERE id=?1", params![id])?;
        Ok(())
    }

    // ---- federated objects -----------------------------------------------------------------

    pub fn get_object(&self, id: i64) -> Result<Option<FederatedObject>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE id=?1");
        Ok(conn.query_row(&sql, params![id], object_from_row).optional()?)
    }

    pub fn find_object_by_ap_id(&self, ap_id: &str) -> Result<Option<FederatedObject>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE ap_id=?1");
        Ok(conn
            .query_row(&sql, params![ap_id.trim()], object_from_row)
            .optional()?)
    }

    pub fn count_objects_with_ap_id(&self, ap_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE ap_id=?1",
            params![ap_id],
            |r| r.get(0),
        )?)
    }

    /// Insert-or-fetch keyed on `ap_id`: the existence check and the insert share one
    /// immediate transaction, so concurrent resolvers of the same URI end up on one row.
    pub fn insert_or_fetch_object(&self, new: &NewObject) -> Result<(FederatedObject, bool)> {
        let now = now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(ap_id) = new.ap_id.as_deref() {
            let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE ap_id=?1");
            if let Some(existing) = tx.query_row(&sql, params![ap_id], object_from_row).optional()? {
                tx.commit()?;
                return Ok((existing, false));
            }
        }

        let parent = match new.parent_id {
            Some(pid) => {
                let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE id=?1");
                Some(
                    tx.query_row(&sql, params![pid], object_from_row)
                        .optional()?
                        .ok_or_else(|| anyhow!("parent object {pid} missing"))?,
                )
            }
            None => None,
        };
        if new.kind == ObjectKind::Reply && parent.is_none() {
            return Err(anyhow!("reply without parent"));
        }
        let post_id = parent.as_ref().map(|p| match p.kind {
            ObjectKind::Post => p.id,
            ObjectKind::Reply => p.post_id.unwrap_or(p.id),
        });
        let community_id = parent.as_ref().map(|p| p.community_id).unwrap_or(new.community_id);

        tx.execute(
            r#"
            INSERT INTO objects(ap_id, kind, author_id, community_id, parent_id, post_id, path, depth,
              title, body, local, published_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, '0', 0, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                new.ap_id,
                new.kind.as_str(),
                new.author_id,
                community_id,
                new.parent_id,
                post_id,
                new.title,
                new.body,
                new.local as i64,
                new.published_ms.unwrap_or(now),
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        if new.kind == ObjectKind::Reply {
            let (path, depth) = match parent.as_ref() {
                Some(p) if p.kind == ObjectKind::Reply => (format!("{}.{id}", p.path), p.depth + 1),
                _ => (format!("0.{id}"), 1),
            };
            tx.execute(
                "UPDATE objects SET path=?2, depth=?3 WHERE id=?1",
                params![id, path, depth],
            )?;
        }
        let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE id=?1");
        let obj = tx.query_row(&sql, params![id], object_from_row)?;
        tx.commit()?;
        Ok((obj, true))
    }

    pub fn update_object_content(&self, id: i64, title: Option<&str>, body: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE objects SET title=COALESCE(?2, title), body=COALESCE(?3, body), updated_at_ms=?4 WHERE id=?1",
            params![id, title, body, now_ms()],
        )?;
        Ok(())
    }

    pub fn mark_object_deleted(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE objects SET deleted=1, updated_at_ms=?2 WHERE id=?1",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    // ---- votes -----------------------------------------------------------------------------

    /// Upsert the single vote of `actor_id` on `object_id` and recompute the counters.
    pub fn apply_vote(&self, vote: &VoteRecord) -> Result<FederatedObject> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO votes(object_id, actor_id, direction, weight, activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(object_id, actor_id) DO UPDATE SET
              direction=excluded.direction,
              weight=excluded.weight,
              activity_id=excluded.activity_id,
              created_at_ms=excluded.created_at_ms
            "#,
            params![
                vote.object_id,
                vote.actor_id,
                vote.direction,
                vote.weight,
                vote.activity_id,
                now_ms()
            ],
        )?;
        recompute_counters(&tx, vote.object_id)?;
        let sql = format!("SELECT {OBJECT_COLS} FROM objects WHERE id=?1");
        let obj = tx.query_row(&sql, params![vote.object_id], object_from_row)?;
        tx.commit()?;
        Ok(obj)
    }

    /// Remove a vote. With `direction` set, only a vote of that direction is removed, so an
    /// Undo(Like) cannot cancel a later Dislike.
    pub fn remove_vote(&self, object_id: i64, actor_id: i64, direction: Option<i8>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = match direction {
            Some(d) => tx.execute(
                "DELETE FROM votes WHERE object_id=?1 AND actor_id=?2 AND direction=?3",
                params![object_id, actor_id, d],
            )?,
            None => tx.execute(
                "DELETE FROM votes WHERE object_id=?1 AND actor_id=?2",
                params![object_id, actor_id],
            )?,
        };
        if changed > 0 {
            recompute_counters(&tx, object_id)?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn find_vote_by_activity(&self, activity_id: &str) -> Result<Option<VoteRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT object_id, actor_id, direction, weight, activity_id FROM votes WHERE activity_id=?1",
                params![activity_id],
                vote_from_row,
            )
            .optional()?)
    }

    pub fn get_vote(&self, object_id: i64, actor_id: i64) -> Result<Option<VoteRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT object_id, actor_id, direction, weight, activity_id FROM votes WHERE object_id=?1 AND actor_id=?2",
                params![object_id, actor_id],
                vote_from_row,
            )
            .optional()?)
    }

    pub fn count_votes(&self, object_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM votes WHERE object_id=?1",
            params![object_id],
            |r| r.get(0),
        )?)
    }

    // ---- follows ---------------------------------------------------------------------------

    pub fn add_community_follower(&self, community_id: i64, follower_id: i64, activity_id: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO community_followers(community_id, follower_id, follow_activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(community_id, follower_id) DO UPDATE SET follow_activity_id=excluded.follow_activity_id
            "#,
            params![community_id, follower_id, activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_community_follower(&self, community_id: i64, follower_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM community_followers WHERE community_id=?1 AND follower_id=?2",
            params![community_id, follower_id],
        )?;
        Ok(n > 0)
    }

    /// Undo(Follow) by activity id only.
    pub fn remove_follower_by_activity(&self, follower_id: i64, activity_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM community_followers WHERE follower_id=?1 AND follow_activity_id=?2",
            params![follower_id, activity_id],
        )?;
        Ok(n > 0)
    }

    pub fn is_community_follower(&self, community_id: i64, follower_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM community_followers WHERE community_id=?1 AND follower_id=?2",
            params![community_id, follower_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// One inbox per remote instance that has at least one follower of `community_id`.
    /// Shared inboxes win over personal ones.
    pub fn list_follower_inboxes(&self, community_id: i64) -> Result<Vec<FollowerInbox>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT a.id, a.inbox, a.shared_inbox, a.instance_id
            FROM community_followers f
            JOIN actors a ON a.id = f.follower_id
            WHERE f.community_id=?1 AND a.local=0 AND a.deleted=0
            ORDER BY a.instance_id, a.id
            "#,
        )?;
        let rows = stmt
            .query_map(params![community_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        let mut out: Vec<FollowerInbox> = Vec::new();
        for (follower_id, inbox, shared_inbox, instance_id) in rows {
            if out.iter().any(|f| f.instance.id == instance_id) {
                continue;
            }
            let Some(instance) = self.get_instance_by_id(instance_id)? else { continue };
            let Some(inbox) = instance.shared_inbox.clone().or(shared_inbox).or(inbox) else {
                continue;
            };
            out.push(FollowerInbox {
                follower_id,
                instance,
                inbox,
            });
        }
        Ok(out)
    }

    pub fn set_remote_follow(&self, actor_id: i64, community_id: i64, state: RemoteFollowState, activity_id: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO remote_follows(actor_id, community_id, state, activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(actor_id, community_id) DO UPDATE SET
              state=excluded.state,
              activity_id=COALESCE(excluded.activity_id, remote_follows.activity_id)
            "#,
            params![actor_id, community_id, state.as_str(), activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_remote_follow(&self, actor_id: i64, community_id: i64) -> Result<Option<RemoteFollowState>> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM remote_follows WHERE actor_id=?1 AND community_id=?2",
                params![actor_id, community_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(state.map(|s| {
            if s == "accepted" {
                RemoteFollowState::Accepted
            } else {
                RemoteFollowState::Pending
            }
        }))
    }

    /// (actor_id, community_id) of the outgoing follow carrying `activity_id`.
    pub fn find_remote_follow_by_activity(&self, activity_id: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT actor_id, community_id FROM remote_follows WHERE activity_id=?1",
                params![activity_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?)
    }

    pub fn remove_remote_follow(&self, actor_id: i64, community_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM remote_follows WHERE actor_id=?1 AND community_id=?2",
            params![actor_id, community_id],
        )?;
        Ok(n > 0)
    }

    // ---- blocks ----------------------------------------------------------------------------

    pub fn block_instance(&self, domain: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO instance_blocks(domain, created_at_ms) VALUES (?1, ?2)",
            params![normalize_domain(domain), now_ms()],
        )?;
        Ok(())
    }

    pub fn unblock_instance(&self, domain: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM instance_blocks WHERE domain=?1",
            params![normalize_domain(domain)],
        )?;
        Ok(())
    }

    /// Exact match or any `*.suffix` / `.suffix` pattern stored in the block list.
    pub fn is_instance_blocked(&self, domain: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT domain FROM instance_blocks")?;
        let patterns = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(patterns.iter().any(|p| domain_matches(domain, p)))
    }

    pub fn block_actor(&self, blocker_id: i64, blocked_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO actor_blocks(blocker_id, blocked_id, created_at_ms) VALUES (?1, ?2, ?3)",
            params![blocker_id, blocked_id, now_ms()],
        )?;
        Ok(())
    }

    /// True when either side blocks the other.
    pub fn actors_block_each_other(&self, a: i64, b: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM actor_blocks WHERE (blocker_id=?1 AND blocked_id=?2) OR (blocker_id=?2 AND blocked_id=?1)",
            params![a, b],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    // ---- activity log ----------------------------------------------------------------------

    /// Claim `activity_id` for processing. False means another delivery of the same activity
    /// already holds or finished it.
    pub fn claim_activity(&self, activity_id: &str, kind: ActivityKind, direction: Direction) -> Result<bool> {
        let now = now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(Option<String>, i64)> = tx
            .query_row(
                "SELECT result, created_at_ms FROM activity_log WHERE activity_id=?1",
                params![activity_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let claimed = match existing {
            None => {
                tx.execute(
                    "INSERT INTO activity_log(activity_id, activity_type, direction, result, exception, created_at_ms) VALUES (?1, ?2, ?3, NULL, NULL, ?4)",
                    params![activity_id, kind.as_str(), direction.as_str(), now],
                )?;
                true
            }
            Some((None, created)) if now.saturating_sub(created) > STALE_CLAIM_MS => {
                tx.execute(
                    "UPDATE activity_log SET created_at_ms=?2 WHERE activity_id=?1 AND result IS NULL",
                    params![activity_id, now],
                )?;
                true
            }
            Some(_) => false,
        };
        tx.commit()?;
        Ok(claimed)
    }

    /// Record the terminal result of a claimed activity. A terminal row is never rewritten.
    pub fn finish_activity(&self, activity_id: &str, outcome: ActivityOutcome, exception: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activity_log SET result=?2, exception=?3, finished_at_ms=?4 WHERE activity_id=?1 AND result IS NULL",
            params![activity_id, outcome.as_str(), exception, now_ms()],
        )?;
        Ok(())
    }

    /// Append a complete entry in one go (outbound activities).
    pub fn record_activity(
        &self,
        activity_id: &str,
        kind: ActivityKind,
        direction: Direction,
        outcome: ActivityOutcome,
        exception: Option<&str>,
    ) -> Result<bool> {
        let now = now_ms();
        let conn = self.conn()?;
        let n = conn.execute(
            r#"
            INSERT OR IGNORE INTO activity_log(activity_id, activity_type, direction, result, exception, created_at_ms, finished_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![activity_id, kind.as_str(), direction.as_str(), outcome.as_str(), exception, now],
        )?;
        Ok(n > 0)
    }

    pub fn count_activities(&self, kind: ActivityKind, direction: Direction) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE activity_type=?1 AND direction=?2",
            params![kind.as_str(), direction.as_str()],
            |r| r.get(0),
        )?)
    }

    pub fn get_activity(&self, activity_id: &str) -> Result<Option<ActivityLogEntry>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT activity_id, activity_type, direction, result, exception, created_at_ms FROM activity_log WHERE activity_id=?1",
                params![activity_id],
                |r| {
                    let result: Option<String> = r.get(3)?;
                    Ok(ActivityLogEntry {
                        activity_id: r.get(0)?,
                        activity_type: r.get(1)?,
                        direction: r.get(2)?,
                        result: result.as_deref().and_then(ActivityOutcome::from_str),
                        exception: r.get(4)?,
                        created_at_ms: r.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn new_activity_id(&self, base_url: &str, kind: ActivityKind) -> String {
        new_activity_id(base_url, kind)
    }
}

pub fn new_activity_id(base_url: &str, kind: ActivityKind) -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    let suffix = hex::encode(b);
    format!(
        "{}/activities/{}/{suffix}",
        base_url.trim_end_matches('/'),
        kind.as_str().to_ascii_lowercase()
    )
}

fn recompute_counters(conn: &Connection, object_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        UPDATE objects SET
          upvotes=(SELECT COUNT(*) FROM votes WHERE object_id=?1 AND direction > 0),
          downvotes=(SELECT COUNT(*) FROM votes WHERE object_id=?1 AND direction < 0),
          score=(SELECT COALESCE(SUM(direction * weight), 0) FROM votes WHERE object_id=?1)
        WHERE id=?1
        "#,
        params![object_id],
    )?;
    Ok(())
}

fn instance_from_row(r: &Row<'_>) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: r.get(0)?,
        domain: r.get(1)?,
        inbox: r.get(2)?,
        shared_inbox: r.get(3)?,
        software: r.get(4)?,
        version: r.get(5)?,
        vote_weight: r.get(6)?,
        trusted: r.get::<_, i64>(7)? != 0,
        health: InstanceHealth {
            failures: r.get(8)?,
            dormant: r.get::<_, i64>(9)? != 0,
            gone_forever: r.get::<_, i64>(10)? != 0,
            last_successful_send_ms: r.get(11)?,
            last_attempt_ms: r.get(12)?,
            start_trying_again_ms: r.get(13)?,
        },
        last_seen_ms: r.get(14)?,
        created_at_ms: r.get(15)?,
    })
}

fn actor_from_row(r: &Row<'_>) -> rusqlite::Result<Actor> {
    let kind: String = r.get(2)?;
    Ok(Actor {
        id: r.get(0)?,
        ap_id: r.get(1)?,
        kind: ActorKind::from_ap_type(&kind).unwrap_or(ActorKind::Person),
        name: r.get(3)?,
        inbox: r.get(4)?,
        shared_inbox: r.get(5)?,
        followers_url: r.get(6)?,
        public_key_id: r.get(7)?,
        public_key_pem: r.get(8)?,
        private_key_pem: r.get(9)?,
        instance_id: r.get(10)?,
        domain: r.get(11)?,
        local: r.get::<_, i64>(12)? != 0,
        deleted: r.get::<_, i64>(13)? != 0,
    })
}

fn object_from_row(r: &Row<'_>) -> rusqlite::Result<FederatedObject> {
    let kind: String = r.get(2)?;
    Ok(FederatedObject {
        id: r.get(0)?,
        ap_id: r.get(1)?,
        kind: ObjectKind::from_db(&kind),
        author_id: r.get(3)?,
        community_id: r.get(4)?,
        parent_id: r.get(5)?,
        post_id: r.get(6)?,
        path: r.get(7)?,
        depth: r.get(8)?,
        title: r.get(9)?,
        body: r.get(10)?,
        upvotes: r.get(11)?,
        downvotes: r.get(12)?,
        score: r.get(13)?,
        deleted: r.get::<_, i64>(14)? != 0,
        local: r.get::<_, i64>(15)? != 0,
        published_ms: r.get(16)?,
        updated_at_ms: r.get(17)?,
    })
}

fn vote_from_row(r: &Row<'_>) -> rusqlite::Result<VoteRecord> {
    Ok(VoteRecord {
        object_id: r.get(0)?,
        actor_id: r.get(1)?,
        direction: r.get(2)?,
        weight: r.get(3)?,
        activity_id: r.get(4)?,
    })
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Authority (host[:port]) of a URL, lowercased. This is what identifies an instance.
pub fn domain_of(url: &str) -> Option<String> {
    let uri: http::Uri = url.trim().parse().ok()?;
    uri.authority().map(|a| normalize_domain(a.as_str()))
}

pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = normalize_domain(host);
    let p = normalize_domain(pattern);
    if p.is_empty() {
        return false;
    }
    if let Some(suffix) = p.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    if let Some(suffix) = p.strip_prefix('.') {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == p
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
