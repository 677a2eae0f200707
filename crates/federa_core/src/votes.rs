/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{FedResult, FederationError};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::store::{Actor, FederatedObject, FederationDb, VoteRecord};

pub const UPVOTE: i8 = 1;
pub const DOWNVOTE: i8 = -1;

/// Applies and retracts votes, weighting remote votes by their instance.
#[derive(Clone)]
pub struct VoteLedger {
    db: FederationDb,
    events: EventBus,
}

impl VoteLedger {
    pub fn new(db: FederationDb, events: EventBus) -> Self {
        Self { db, events }
    }

    fn weight_for(&self, actor: &Actor) -> FedResult<f64> {
        if actor.local {
            return Ok(1.0);
        }
        Ok(self
            .db
            .get_instance(&actor.domain)?
            .map(|i| i.vote_weight)
            .unwrap_or(1.0))
    }

    pub fn apply(
        &self,
        object: &FederatedObject,
        actor: &Actor,
        direction: i8,
        activity_id: Option<&str>,
    ) -> FedResult<FederatedObject> {
        if object.deleted {
            return Err(FederationError::Ignored(format!("vote on deleted object {}", object.id)));
        }
        let weight = self.weight_for(actor)?;
        let updated = self.db.apply_vote(&VoteRecord {
            object_id: object.id,
            actor_id: actor.id,
            direction: direction.signum(),
            weight,
            activity_id: activity_id.map(str::to_string),
        })?;
        let mut ev = EngineEvent::new(EventKind::VoteChanged)
            .object(object.id)
            .actor(actor.id);
        if let Some(id) = activity_id {
            ev = ev.activity(if direction > 0 { "Like" } else { "Dislike" }, id);
        }
        self.events.emit(ev);
        Ok(updated)
    }

    /// `direction = None` retracts whatever vote the actor has.
    pub fn retract(&self, object_id: i64, actor_id: i64, direction: Option<i8>) -> FedResult<bool> {
        let removed = self.db.remove_vote(object_id, actor_id, direction)?;
        if removed {
            self.events.emit(
                EngineEvent::new(EventKind::VoteChanged)
                    .object(object_id)
                    .actor(actor_id),
            );
        }
        Ok(removed)
    }
}
