/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::now_ms;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObjectCreated,
    ObjectUpdated,
    ObjectDeleted,
    VoteChanged,
    FollowerAdded,
    FollowerRemoved,
    FollowAccepted,
    FollowRejected,
    ActorDeleted,
    InstanceHealthChanged,
}

/// Mutation notice for the CRUD layer (cache invalidation, notifications).
#[derive(Clone, Debug, Serialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub ts_ms: i64,
    pub activity_type: Option<String>,
    pub activity_id: Option<String>,
    pub object_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub instance: Option<String>,
}

impl EngineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ts_ms: now_ms(),
            activity_type: None,
            activity_id: None,
            object_id: None,
            actor_id: None,
            instance: None,
        }
    }

    pub fn activity(mut self, ty: &str, id: &str) -> Self {
        self.activity_type = Some(ty.to_string());
        self.activity_id = Some(id.to_string());
        self
    }

    pub fn object(mut self, id: i64) -> Self {
        self.object_id = Some(id);
        self
    }

    pub fn actor(mut self, id: i64) -> Self {
        self.actor_id = Some(id);
        self
    }

    pub fn instance(mut self, domain: &str) -> Self {
        self.instance = Some(domain.to_string());
        self
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Nobody listening is fine.
    pub fn emit(&self, ev: EngineEvent) {
        let _ = self.tx.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::new(EventKind::VoteChanged).object(7).activity("Like", "x"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::VoteChanged);
        assert_eq!(ev.object_id, Some(7));
        assert_eq!(ev.activity_type.as_deref(), Some("Like"));
    }
}
