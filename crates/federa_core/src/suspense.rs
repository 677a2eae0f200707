/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Votes whose target is not known yet.
//!
//! Peers regularly deliver a Like before the Create it refers to. Such votes wait here,
//! keyed by target URI, until the object is materialized or the TTL runs out.

use crate::store::now_ms;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SuspendedVote {
    pub target_uri: String,
    pub actor_uri: String,
    /// +1 or -1.
    pub direction: i8,
    pub activity_id: String,
    pub created_at_ms: i64,
}

impl SuspendedVote {
    pub fn new(target_uri: &str, actor_uri: &str, direction: i8, activity_id: &str) -> Self {
        Self {
            target_uri: target_uri.to_string(),
            actor_uri: actor_uri.to_string(),
            direction,
            activity_id: activity_id.to_string(),
            created_at_ms: now_ms(),
        }
    }
}

pub struct VoteSuspense {
    ttl_ms: i64,
    queues: Mutex<HashMap<String, VecDeque<SuspendedVote>>>,
}

impl VoteSuspense {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, v: &SuspendedVote, now: i64) -> bool {
        now.saturating_sub(v.created_at_ms) > self.ttl_ms
    }

    /// False when a vote with the same activity id is already waiting.
    pub fn suspend(&self, vote: SuspendedVote) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let q = queues.entry(vote.target_uri.clone()).or_default();
        if q.iter().any(|v| v.activity_id == vote.activity_id) {
            return false;
        }
        q.push_back(vote);
        true
    }

    /// Live votes for `target_uri` in arrival order. Each vote is handed out once; expired
    /// ones stay behind for [`VoteSuspense::expire`].
    pub fn drain(&self, target_uri: &str, now: i64) -> Vec<SuspendedVote> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let Some(q) = queues.remove(target_uri) else {
            return Vec::new();
        };
        let (expired, live): (VecDeque<_>, VecDeque<_>) =
            q.into_iter().partition(|v| self.expired(v, now));
        if !expired.is_empty() {
            queues.insert(target_uri.to_string(), expired);
        }
        live.into()
    }

    /// Remove and return every vote past its TTL.
    pub fn expire(&self, now: i64) -> Vec<SuspendedVote> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        queues.retain(|_, q| {
            let mut keep = VecDeque::with_capacity(q.len());
            for v in q.drain(..) {
                if self.expired(&v, now) {
                    out.push(v);
                } else {
                    keep.push_back(v);
                }
            }
            *q = keep;
            !q.is_empty()
        });
        out
    }

    /// Undo of a vote that never got applied.
    pub fn cancel(&self, activity_id: &str) -> Option<SuspendedVote> {
        self.cancel_where(|v| v.activity_id == activity_id)
    }

    /// Undo whose inner vote carries no id.
    pub fn cancel_by_actor(&self, target_uri: &str, actor_uri: &str) -> Option<SuspendedVote> {
        self.cancel_where(|v| v.target_uri == target_uri && v.actor_uri == actor_uri)
    }

    fn cancel_where(&self, pred: impl Fn(&SuspendedVote) -> bool) -> Option<SuspendedVote> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut found = None;
        queues.retain(|_, q| {
            if found.is_none() {
                if let Some(pos) = q.iter().position(&pred) {
                    found = q.remove(pos);
                }
            }
            !q.is_empty()
        });
        found
    }

    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
