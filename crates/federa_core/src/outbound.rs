/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activities::{mentioned_actors, ActivityFactory};
use crate::batch::{BatchBuffer, BatchKey, ReadyBatch};
use crate::delivery_queue::{DeliveryQueue, NewJob};
use crate::error::{FedResult, FederationError};
use crate::store::{domain_of, now_ms, Actor, FederationDb};
use federa_protocol::{ActivityKind, ActivityOutcome, Direction};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

/// Where an outbound activity is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Local community: announced to its followers. Remote community: sent to its inbox.
    Community(i64),
    /// A single remote actor.
    Actor(i64),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    /// Jobs written to the delivery queue.
    pub queued: usize,
    /// Items appended to per-instance batches.
    pub batched: usize,
    /// Recipients skipped because of blocks, health or locality.
    pub suppressed: usize,
}

impl DeliveryPlan {
    fn absorb(&mut self, other: DeliveryPlan) {
        self.queued += other.queued;
        self.batched += other.batched;
        self.suppressed += other.suppressed;
    }
}

#[derive(Clone)]
pub struct Outbound {
    db: FederationDb,
    queue: DeliveryQueue,
    batches: Arc<BatchBuffer>,
    factory: ActivityFactory,
    batching_software: Vec<String>,
    local_domain: String,
}

impl Outbound {
    pub fn new(
        db: FederationDb,
        queue: DeliveryQueue,
        batches: Arc<BatchBuffer>,
        factory: ActivityFactory,
        batching_software: Vec<String>,
    ) -> Self {
        let local_domain = domain_of(factory.base_url()).unwrap_or_default();
        Self {
            db,
            queue,
            batches,
            factory,
            batching_software,
            local_domain,
        }
    }

    pub fn factory(&self) -> &ActivityFactory {
        &self.factory
    }

    /// Deliver `activity`, performed by the local `actor`, to `destination`.
    pub async fn deliver(&self, activity: &Value, actor: &Actor, destination: Destination) -> FedResult<DeliveryPlan> {
        if !actor.local || !actor.owns_keypair() {
            return Err(FederationError::malformed(format!(
                "{} cannot sign outbound activities",
                actor.ap_id
            )));
        }
        self.record_out(activity)?;

        let mut plan = match destination {
            Destination::Community(id) => {
                let community = self
                    .db
                    .get_actor(id)?
                    .ok_or_else(|| FederationError::not_found(format!("community {id}")))?;
                if community.local {
                    self.relay_to_followers(&community, activity, None).await?
                } else {
                    self.direct(activity, actor, &community).await?
                }
            }
            Destination::Actor(id) => {
                let target = self
                    .db
                    .get_actor(id)?
                    .ok_or_else(|| FederationError::not_found(format!("actor {id}")))?;
                self.direct(activity, actor, &target).await?
            }
        };

        for uri in mentioned_actors(activity) {
            let Some(target) = self.db.find_actor_by_ap_id(&uri)? else {
                debug!(mention = uri, "mentioned actor unknown, no direct copy");
                continue;
            };
            if target.local {
                continue;
            }
            if let Destination::Actor(id) = destination {
                if id == target.id {
                    continue;
                }
            }
            plan.absorb(self.direct(activity, actor, &target).await?);
        }
        Ok(plan)
    }

    /// Announce `inner` from a local community to every follower instance, except the
    /// instance it came from.
    pub async fn relay_to_followers(
        &self,
        community: &Actor,
        inner: &Value,
        origin_domain: Option<&str>,
    ) -> FedResult<DeliveryPlan> {
        if !community.local || !community.owns_keypair() {
            return Err(FederationError::malformed(format!(
                "{} is not a local community",
                community.ap_id
            )));
        }
        let announce = self.factory.announce(community, inner.clone());
        let body = serde_json::to_vec(&announce).map_err(anyhow::Error::from)?;
        let announce_id = announce.get("id").and_then(Value::as_str).map(str::to_string);

        let now = now_ms();
        let mut plan = DeliveryPlan::default();
        let mut jobs = Vec::new();
        for f in self.db.list_follower_inboxes(community.id)? {
            let domain = f.instance.domain.clone();
            if domain == self.local_domain || Some(domain.as_str()) == origin_domain {
                plan.suppressed += 1;
                continue;
            }
            if self.db.is_instance_blocked(&domain)? || !f.instance.health.is_deliverable(now) {
                debug!(domain, "follower instance skipped");
                plan.suppressed += 1;
                continue;
            }
            if f.instance.software_is(&self.batching_software) {
                let key = BatchKey {
                    domain,
                    community_id: community.id,
                };
                plan.batched += 1;
                if let Some(ready) = self.batches.push(key, &f.inbox, inner.clone()) {
                    self.flush_batch(ready).await?;
                }
                continue;
            }
            jobs.push(NewJob {
                inbox: f.inbox,
                domain,
                signer_actor_id: community.id,
                activity_json: body.clone(),
                activity_id: announce_id.clone(),
                activity_type: Some(ActivityKind::Announce.as_str().to_string()),
            });
        }
        plan.queued += jobs.len();
        if !jobs.is_empty() {
            self.queue.enqueue(jobs).await?;
            // Batched copies are logged under the batch id when it flushes.
            if let Some(id) = announce_id.as_deref() {
                self.db
                    .record_activity(id, ActivityKind::Announce, Direction::Out, ActivityOutcome::Success, None)?;
            }
        }
        info!(
            community = community.ap_id,
            queued = plan.queued,
            batched = plan.batched,
            suppressed = plan.suppressed,
            "announce fan-out"
        );
        Ok(plan)
    }

    async fn direct(&self, activity: &Value, actor: &Actor, target: &Actor) -> FedResult<DeliveryPlan> {
        let mut plan = DeliveryPlan::default();
        let Some(inbox) = target.delivery_inbox().map(str::to_string) else {
            warn!(recipient = target.ap_id, "no inbox, activity not delivered");
            plan.suppressed += 1;
            return Ok(plan);
        };
        if target.local || target.domain == self.local_domain {
            plan.suppressed += 1;
            return Ok(plan);
        }
        let blocked = self.db.is_instance_blocked(&target.domain)?
            || self.db.actors_block_each_other(actor.id, target.id)?;
        let deliverable = self
            .db
            .get_instance(&target.domain)?
            .map(|i| i.health.is_deliverable(now_ms()))
            .unwrap_or(true);
        if blocked || !deliverable {
            debug!(recipient = target.ap_id, blocked, deliverable, "direct delivery suppressed");
            plan.suppressed += 1;
            return Ok(plan);
        }
        let body = serde_json::to_vec(activity).map_err(anyhow::Error::from)?;
        self.queue
            .enqueue(vec![NewJob {
                inbox,
                domain: target.domain.clone(),
                signer_actor_id: actor.id,
                activity_json: body,
                activity_id: activity.get("id").and_then(Value::as_str).map(str::to_string),
                activity_type: activity.get("type").and_then(Value::as_str).map(str::to_string),
            }])
            .await?;
        plan.queued += 1;
        Ok(plan)
    }

    fn record_out(&self, activity: &Value) -> FedResult<()> {
        let Some(id) = activity.get("id").and_then(Value::as_str) else {
            return Err(FederationError::malformed("outbound activity without id"));
        };
        let kind = ActivityKind::parse(activity.get("type").and_then(Value::as_str).unwrap_or(""));
        self.db
            .record_activity(id, kind, Direction::Out, ActivityOutcome::Success, None)?;
        Ok(())
    }

    async fn flush_batch(&self, ready: ReadyBatch) -> FedResult<()> {
        let Some(community) = self.db.get_actor(ready.key.community_id)? else {
            warn!(community_id = ready.key.community_id, "batch for vanished community dropped");
            return Ok(());
        };
        let count = ready.items.len();
        let payload = self.factory.announce_batch(&community, ready.items);
        let body = serde_json::to_vec(&payload).map_err(anyhow::Error::from)?;
        let id = payload.get("id").and_then(Value::as_str).map(str::to_string);
        self.queue
            .enqueue(vec![NewJob {
                inbox: ready.inbox,
                domain: ready.key.domain.clone(),
                signer_actor_id: community.id,
                activity_json: body,
                activity_id: id.clone(),
                activity_type: Some(ActivityKind::Announce.as_str().to_string()),
            }])
            .await?;
        if let Some(id) = id.as_deref() {
            self.db
                .record_activity(id, ActivityKind::Announce, Direction::Out, ActivityOutcome::Success, None)?;
        }
        debug!(domain = ready.key.domain, items = count, "batch flushed");
        Ok(())
    }

    /// Flush batches whose interval elapsed.
    pub async fn flush_due_batches(&self) -> FedResult<usize> {
        let due = self.batches.take_due(Instant::now());
        let n = due.len();
        for ready in due {
            self.flush_batch(ready).await?;
        }
        Ok(n)
    }

    pub async fn flush_all_batches(&self) -> FedResult<usize> {
        let all = self.batches.take_all();
        let n = all.len();
        for ready in all {
            self.flush_batch(ready).await?;
        }
        Ok(n)
    }
}
