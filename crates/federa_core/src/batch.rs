/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-(instance, community) buffer of announces for peers that accept batched Announces.

use crate::config::BatchConfig;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub domain: String,
    pub community_id: i64,
}

#[derive(Debug)]
struct PendingBatch {
    inbox: String,
    items: Vec<Value>,
    opened_at: Instant,
}

/// A batch ready to be wrapped and enqueued.
#[derive(Debug, Clone)]
pub struct ReadyBatch {
    pub key: BatchKey,
    pub inbox: String,
    pub items: Vec<Value>,
}

pub struct BatchBuffer {
    max_items: usize,
    flush_after: Duration,
    pending: Mutex<HashMap<BatchKey, PendingBatch>>,
}

impl BatchBuffer {
    pub fn new(cfg: &BatchConfig) -> Self {
        Self {
            max_items: cfg.batch_max_items.max(1),
            flush_after: Duration::from_secs(cfg.batch_flush_secs),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append one announced activity. Returns the batch when it just became full.
    pub fn push(&self, key: BatchKey, inbox: &str, item: Value) -> Option<ReadyBatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
            inbox: inbox.to_string(),
            items: Vec::new(),
            opened_at: Instant::now(),
        });
        batch.items.push(item);
        if batch.items.len() < self.max_items {
            return None;
        }
        pending.remove(&key).map(|b| ReadyBatch {
            key,
            inbox: b.inbox,
            items: b.items,
        })
    }

    /// Batches whose flush interval has elapsed.
    pub fn take_due(&self, now: Instant) -> Vec<ReadyBatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let due: Vec<BatchKey> = pending
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.opened_at) >= self.flush_after)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .filter_map(|k| {
                pending.remove(&k).map(|b| ReadyBatch {
                    key: k,
                    inbox: b.inbox,
                    items: b.items,
                })
            })
            .collect()
    }

    /// Everything, regardless of age. Used on shutdown.
    pub fn take_all(&self) -> Vec<ReadyBatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending
            .drain()
            .map(|(key, b)| ReadyBatch {
                key,
                inbox: b.inbox,
                items: b.items,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|b| b.items.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
