/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound activity routing.
//!
//! Every activity id is claimed in the activity log before anything else happens, so a
//! redelivery of the same activity (retries, shared-inbox fan-in, batch replays) is reported
//! as `duplicate` without side effects. Handler errors never escape: they become the
//! activity's terminal `failure` together with the error text.

use crate::error::{FedResult, FederationError};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::outbound::{Destination, Outbound};
use crate::resolver::{id_of, into_object, type_of, uris, Entity, ExpectedType, ResolveContext, Resolver};
use crate::store::{domain_of, Actor, FederationDb, RemoteFollowState};
use crate::suspense::{SuspendedVote, VoteSuspense};
use crate::votes::{VoteLedger, DOWNVOTE, UPVOTE};
use federa_protocol::{ActivityKind, ActivityOutcome, Direction};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Who vouches for an activity.
#[derive(Clone, Copy)]
enum Authority<'a> {
    /// HTTP-signed by this actor.
    Signed(&'a Actor),
    /// Wrapped in an Announce by this community.
    Announced(&'a Actor),
    /// Handed over in-process by the CRUD layer.
    Local,
}

#[derive(Clone)]
pub struct Dispatcher {
    db: FederationDb,
    resolver: Resolver,
    suspense: Arc<VoteSuspense>,
    votes: VoteLedger,
    outbound: Outbound,
    events: EventBus,
    accept_object_by_id_software: Vec<String>,
    allow_fetch: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: FederationDb,
        resolver: Resolver,
        suspense: Arc<VoteSuspense>,
        votes: VoteLedger,
        outbound: Outbound,
        events: EventBus,
        accept_object_by_id_software: Vec<String>,
        allow_fetch: bool,
    ) -> Self {
        Self {
            db,
            resolver,
            suspense,
            votes,
            outbound,
            events,
            accept_object_by_id_software,
            allow_fetch,
        }
    }

    /// Process one inbound activity. `signer` is the actor that signed the HTTP request, if
    /// the activity arrived over the wire.
    pub async fn dispatch(&self, activity: &Value, signer: Option<&Actor>) -> ActivityOutcome {
        let auth = match signer {
            Some(a) => Authority::Signed(a),
            None => Authority::Local,
        };
        self.process(activity, auth).await
    }

    fn process<'a>(&'a self, activity: &'a Value, auth: Authority<'a>) -> BoxFuture<'a, ActivityOutcome> {
        async move {
            let Some(id) = activity.get("id").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()) else {
                warn!("activity without id rejected");
                return ActivityOutcome::Failure;
            };
            let ty = activity.get("type").and_then(Value::as_str).unwrap_or_default();
            let kind = ActivityKind::parse(ty);

            match self.db.claim_activity(id, kind, Direction::In) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(activity_id = id, "duplicate activity");
                    return ActivityOutcome::Duplicate;
                }
                Err(e) => {
                    warn!(activity_id = id, "claim failed: {e:#}");
                    return ActivityOutcome::Failure;
                }
            }

            let mut ctx = ResolveContext::new(self.allow_fetch);
            let res = self.route(activity, kind, auth, &mut ctx).await;
            let (outcome, exception) = match res {
                Ok(()) => (ActivityOutcome::Success, None),
                Err(e @ (FederationError::Ignored(_) | FederationError::Blocked(_))) => {
                    debug!(activity_id = id, activity_type = ty, "ignored: {e}");
                    (ActivityOutcome::Ignored, Some(e.to_string()))
                }
                Err(e) => {
                    warn!(activity_id = id, activity_type = ty, "activity failed: {e:#}");
                    (ActivityOutcome::Failure, Some(format!("{e:#}")))
                }
            };
            if let Err(e) = self.db.finish_activity(id, outcome, exception.as_deref()) {
                warn!(activity_id = id, "finish activity failed: {e:#}");
            }
            outcome
        }
        .boxed()
    }

    async fn route(
        &self,
        activity: &Value,
        kind: ActivityKind,
        auth: Authority<'_>,
        ctx: &mut ResolveContext,
    ) -> FedResult<()> {
        if activity.get("type").and_then(Value::as_str).is_none() {
            return Err(FederationError::malformed("missing type"));
        }
        let actor_uri = activity
            .get("actor")
            .and_then(id_of)
            .ok_or_else(|| FederationError::malformed("missing actor"))?;
        match activity.get("object") {
            None | Some(Value::Null) => return Err(FederationError::malformed("missing object")),
            Some(_) => {}
        }
        if kind == ActivityKind::Other {
            return Err(FederationError::Ignored(format!(
                "unsupported activity type {}",
                activity.get("type").and_then(Value::as_str).unwrap_or_default()
            )));
        }

        let actor = match auth {
            Authority::Signed(signer) => {
                if signer.ap_id != actor_uri {
                    return Err(FederationError::signature(format!(
                        "signed by {} but performed by {actor_uri}",
                        signer.ap_id
                    )));
                }
                signer.clone()
            }
            Authority::Announced(community) => {
                if !vouched_by(activity, &actor_uri, community) {
                    return Err(FederationError::Ignored(format!(
                        "{} announced an activity of {actor_uri} it does not host",
                        community.ap_id
                    )));
                }
                self.resolver.resolve_actor(&actor_uri, ctx).await?
            }
            Authority::Local => self.resolver.resolve_actor(&actor_uri, ctx).await?,
        };
        if self.db.is_instance_blocked(&actor.domain)? {
            return Err(FederationError::Blocked(actor.domain.clone()));
        }
        if actor.deleted {
            return Err(FederationError::Ignored(format!("{} is deleted", actor.ap_id)));
        }

        match kind {
            ActivityKind::Create | ActivityKind::Update => self.on_create_or_update(activity, kind, &actor, ctx).await,
            ActivityKind::Delete => self.on_delete(activity, &actor).await,
            ActivityKind::Like | ActivityKind::Dislike => self.on_vote(activity, kind, &actor, ctx).await,
            ActivityKind::Undo => self.on_undo(activity, &actor).await,
            ActivityKind::Follow => self.on_follow(activity, &actor).await,
            ActivityKind::Accept | ActivityKind::Reject => self.on_follow_response(activity, kind, &actor),
            ActivityKind::Announce => self.on_announce(activity, &actor, auth, ctx).await,
            ActivityKind::Other => Err(FederationError::Ignored("unsupported activity".into())),
        }
    }

    /// Re-announce to our followers when the activity touches a local community.
    async fn relay_if_local(&self, community_id: i64, activity: &Value, origin_domain: &str) -> FedResult<()> {
        let Some(community) = self.db.get_actor(community_id)? else {
            return Ok(());
        };
        if !community.local {
            return Ok(());
        }
        self.outbound
            .relay_to_followers(&community, activity, Some(origin_domain))
            .await?;
        Ok(())
    }

    async fn on_create_or_update(
        &self,
        activity: &Value,
        kind: ActivityKind,
        actor: &Actor,
        ctx: &mut ResolveContext,
    ) -> FedResult<()> {
        let object = &activity["object"];
        let object_id = id_of(object).ok_or_else(|| FederationError::malformed("object without id"))?;
        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or_default();

        if kind == ActivityKind::Update {
            if object_id == actor.ap_id {
                return self.update_actor_profile(actor, object);
            }
            if let Some(Entity::Object(existing)) = self.resolver.lookup_local(&object_id)? {
                if existing.author_id != actor.id {
                    return Err(FederationError::malformed(format!(
                        "{} is not the author of {object_id}",
                        actor.ap_id
                    )));
                }
                if existing.deleted {
                    return Err(FederationError::Ignored(format!("{object_id} is deleted")));
                }
                let title = object.get("name").and_then(Value::as_str);
                let body = object.get("content").and_then(Value::as_str);
                if title.is_none() && body.is_none() {
                    return Err(FederationError::Ignored("update without content".into()));
                }
                self.db.update_object_content(existing.id, title, body)?;
                self.events.emit(
                    EngineEvent::new(EventKind::ObjectUpdated)
                        .object(existing.id)
                        .actor(actor.id)
                        .activity(kind.as_str(), activity_id),
                );
                return self.relay_if_local(existing.community_id, activity, &actor.domain).await;
            }
        }

        let entity = self
            .resolver
            .resolve_embedded(object, &actor.ap_id, ExpectedType::Object, ctx)
            .await?;
        let object = into_object(entity)?;
        if object.author_id != actor.id {
            return Err(FederationError::malformed(format!(
                "{} is not the author of {object_id}",
                actor.ap_id
            )));
        }
        self.relay_if_local(object.community_id, activity, &actor.domain).await
    }

    fn update_actor_profile(&self, actor: &Actor, doc: &Value) -> FedResult<()> {
        if actor.local {
            return Err(FederationError::Ignored("remote update of a local actor".into()));
        }
        let name = doc
            .get("preferredUsername")
            .or_else(|| doc.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(&actor.name);
        let inbox = doc.get("inbox").and_then(Value::as_str);
        let shared_inbox = doc
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(Value::as_str);
        self.db.update_actor_profile(actor.id, name, inbox, shared_inbox)?;
        debug!(actor = actor.ap_id, "actor profile refreshed");
        Ok(())
    }

    async fn on_delete(&self, activity: &Value, actor: &Actor) -> FedResult<()> {
        let target = id_of(&activity["object"]).ok_or_else(|| FederationError::malformed("object without id"))?;
        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or_default();

        if target == actor.ap_id {
            self.db.mark_actor_deleted(actor.id)?;
            info!(actor = actor.ap_id, "remote actor deleted");
            self.events.emit(
                EngineEvent::new(EventKind::ActorDeleted)
                    .actor(actor.id)
                    .activity("Delete", activity_id),
            );
            return Ok(());
        }

        let object = match self.resolver.lookup_local(&target)? {
            Some(Entity::Object(o)) => o,
            Some(Entity::Actor(_)) => {
                return Err(FederationError::Ignored(format!("{} cannot delete actor {target}", actor.ap_id)));
            }
            None => return Err(FederationError::Ignored(format!("delete of unknown object {target}"))),
        };
        if object.deleted {
            return Err(FederationError::Ignored(format!("{target} already deleted")));
        }
        if object.author_id != actor.id && object.community_id != actor.id {
            return Err(FederationError::malformed(format!("{} may not delete {target}", actor.ap_id)));
        }
        self.db.mark_object_deleted(object.id)?;
        self.events.emit(
            EngineEvent::new(EventKind::ObjectDeleted)
                .object(object.id)
                .actor(actor.id)
                .activity("Delete", activity_id),
        );
        self.relay_if_local(object.community_id, activity, &actor.domain).await
    }

    async fn on_vote(
        &self,
        activity: &Value,
        kind: ActivityKind,
        actor: &Actor,
        ctx: &mut ResolveContext,
    ) -> FedResult<()> {
        let target = id_of(&activity["object"]).ok_or_else(|| FederationError::malformed("object without id"))?;
        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or_default();
        let direction = if kind == ActivityKind::Like { UPVOTE } else { DOWNVOTE };

        match self.resolver.resolve(&target, ExpectedType::Object, ctx).await {
            Ok(entity) => {
                let object = into_object(entity)?;
                self.votes.apply(&object, actor, direction, Some(activity_id))?;
                self.relay_if_local(object.community_id, activity, &actor.domain).await
            }
            Err(e) if e.is_not_found() => {
                let fresh = self
                    .suspense
                    .suspend(SuspendedVote::new(&target, &actor.ap_id, direction, activity_id));
                info!(object = target.as_str(), activity_id, fresh, "vote suspended until its target arrives");
                // The target may have landed between the failed lookup and the suspend.
                if let Some(object) = self.resolver.apply_if_arrived(&target, ctx).await? {
                    debug!(object = target.as_str(), upvotes = object.upvotes, "suspended vote target arrived meanwhile");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_undo(&self, activity: &Value, actor: &Actor) -> FedResult<()> {
        let inner = &activity["object"];
        if let Some(inner_actor) = inner.get("actor").and_then(id_of) {
            if inner_actor != actor.ap_id {
                return Err(FederationError::malformed(format!(
                    "{} cannot undo an activity of {inner_actor}",
                    actor.ap_id
                )));
            }
        }
        let inner_id = id_of(inner);

        match type_of(inner).map(|t| ActivityKind::parse(&t)) {
            Some(k @ (ActivityKind::Like | ActivityKind::Dislike)) => {
                self.undo_vote(activity, inner, inner_id.as_deref(), k, actor).await
            }
            Some(ActivityKind::Follow) => self.undo_follow(inner, actor),
            Some(other) => Err(FederationError::Ignored(format!("undo of {} not supported", other.as_str()))),
            None => {
                let id = inner_id.ok_or_else(|| FederationError::malformed("undo without inner activity"))?;
                if self.suspense.cancel(&id).is_some() {
                    debug!(inner = id, "suspended vote cancelled");
                    return Ok(());
                }
                if let Some(vote) = self.db.find_vote_by_activity(&id)? {
                    if vote.actor_id != actor.id {
                        return Err(FederationError::malformed(format!("{} does not own {id}", actor.ap_id)));
                    }
                    self.votes.retract(vote.object_id, actor.id, Some(vote.direction))?;
                    if let Some(object) = self.db.get_object(vote.object_id)? {
                        self.relay_if_local(object.community_id, activity, &actor.domain).await?;
                    }
                    return Ok(());
                }
                if self.db.remove_follower_by_activity(actor.id, &id)? {
                    self.events
                        .emit(EngineEvent::new(EventKind::FollowerRemoved).actor(actor.id).activity("Undo", &id));
                    return Ok(());
                }
                Err(FederationError::Ignored(format!("undo of unknown activity {id}")))
            }
        }
    }

    async fn undo_vote(
        &self,
        activity: &Value,
        inner: &Value,
        inner_id: Option<&str>,
        kind: ActivityKind,
        actor: &Actor,
    ) -> FedResult<()> {
        let direction = if kind == ActivityKind::Like { UPVOTE } else { DOWNVOTE };
        if let Some(id) = inner_id {
            if self.suspense.cancel(id).is_some() {
                debug!(inner = id, "suspended vote cancelled");
                return Ok(());
            }
        }
        let target = inner
            .get("object")
            .and_then(id_of)
            .ok_or_else(|| FederationError::malformed("undone vote without object"))?;
        let object = match self.resolver.lookup_local(&target)? {
            Some(Entity::Object(o)) => o,
            _ => {
                if self.suspense.cancel_by_actor(&target, &actor.ap_id).is_some() {
                    return Ok(());
                }
                return Err(FederationError::Ignored(format!("undo of vote on unknown {target}")));
            }
        };
        if !self.votes.retract(object.id, actor.id, Some(direction))? {
            return Err(FederationError::Ignored(format!("no matching {} on {target}", kind.as_str())));
        }
        self.relay_if_local(object.community_id, activity, &actor.domain).await
    }

    fn undo_follow(&self, inner: &Value, actor: &Actor) -> FedResult<()> {
        let target = inner
            .get("object")
            .and_then(id_of)
            .ok_or_else(|| FederationError::malformed("undone follow without object"))?;
        let community = match self.resolver.lookup_local(&target)? {
            Some(Entity::Actor(c)) if c.local && c.can_be_followed() => c,
            _ => return Err(FederationError::Ignored(format!("{target} is not a local community"))),
        };
        if !self.db.remove_community_follower(community.id, actor.id)? {
            return Err(FederationError::Ignored(format!("{} was not following {target}", actor.ap_id)));
        }
        info!(community = community.ap_id, follower = actor.ap_id, "follower removed");
        self.events.emit(
            EngineEvent::new(EventKind::FollowerRemoved)
                .actor(actor.id)
                .object(community.id),
        );
        Ok(())
    }

    async fn on_follow(&self, activity: &Value, actor: &Actor) -> FedResult<()> {
        let target = id_of(&activity["object"]).ok_or_else(|| FederationError::malformed("object without id"))?;
        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or_default();
        let community = match self.resolver.lookup_local(&target)? {
            Some(Entity::Actor(c)) if c.local && c.can_be_followed() => c,
            _ => return Err(FederationError::Ignored(format!("{target} is not a local community"))),
        };

        let accept = !community.deleted && !self.db.actors_block_each_other(community.id, actor.id)?;
        if accept {
            self.db
                .add_community_follower(community.id, actor.id, Some(activity_id))?;
            info!(community = community.ap_id, follower = actor.ap_id, "follower added");
            self.events.emit(
                EngineEvent::new(EventKind::FollowerAdded)
                    .actor(actor.id)
                    .object(community.id)
                    .activity("Follow", activity_id),
            );
        }

        let by_id = self
            .db
            .get_instance(&actor.domain)?
            .is_some_and(|i| i.software_is(&self.accept_object_by_id_software));
        let follow_ref = if by_id { json!(activity_id) } else { activity.clone() };
        let response = self
            .outbound
            .factory()
            .follow_response(accept, &community, &actor.ap_id, follow_ref);
        self.outbound
            .deliver(&response, &community, Destination::Actor(actor.id))
            .await?;
        Ok(())
    }

    fn on_follow_response(&self, activity: &Value, kind: ActivityKind, actor: &Actor) -> FedResult<()> {
        let inner = &activity["object"];
        let mut found = match id_of(inner) {
            Some(id) => self.db.find_remote_follow_by_activity(&id)?,
            None => None,
        };
        if found.is_none() {
            // Some peers echo the Follow with a fresh id, so match on its actor/object pair.
            let follower = inner.get("actor").and_then(id_of);
            let target = inner.get("object").and_then(id_of);
            if let (Some(follower), Some(target)) = (follower, target) {
                if target == actor.ap_id {
                    if let Some(local) = self.db.find_actor_by_ap_id(&follower)?.filter(|a| a.local) {
                        if self.db.get_remote_follow(local.id, actor.id)?.is_some() {
                            found = Some((local.id, actor.id));
                        }
                    }
                }
            }
        }
        let Some((local_id, community_id)) = found else {
            return Err(FederationError::Ignored("no matching pending follow".into()));
        };
        if community_id != actor.id {
            return Err(FederationError::malformed(format!(
                "{} answered a follow addressed to another community",
                actor.ap_id
            )));
        }
        let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or_default();
        if kind == ActivityKind::Accept {
            self.db
                .set_remote_follow(local_id, community_id, RemoteFollowState::Accepted, None)?;
            info!(community = actor.ap_id, "follow accepted");
            self.events.emit(
                EngineEvent::new(EventKind::FollowAccepted)
                    .actor(local_id)
                    .object(community_id)
                    .activity("Accept", activity_id),
            );
        } else {
            self.db.remove_remote_follow(local_id, community_id)?;
            info!(community = actor.ap_id, "follow rejected");
            self.events.emit(
                EngineEvent::new(EventKind::FollowRejected)
                    .actor(local_id)
                    .object(community_id)
                    .activity("Reject", activity_id),
            );
        }
        Ok(())
    }

    async fn on_announce(
        &self,
        activity: &Value,
        actor: &Actor,
        auth: Authority<'_>,
        ctx: &mut ResolveContext,
    ) -> FedResult<()> {
        if matches!(auth, Authority::Announced(_)) {
            return Err(FederationError::Ignored("nested announce".into()));
        }
        if !actor.can_be_followed() {
            return Err(FederationError::Ignored(format!("announce by non-community {}", actor.ap_id)));
        }
        let items: Vec<&Value> = match &activity["object"] {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let batch = items.len();
        for item in items {
            if is_activity(item) {
                let outcome = self.process(item, Authority::Announced(actor)).await;
                debug!(
                    inner = item.get("id").and_then(serde_json::Value::as_str).unwrap_or_default(),
                    outcome = outcome.as_str(),
                    "announced activity processed"
                );
                continue;
            }
            // A bare post reference or an embedded post shared by the community.
            if let Err(e) = self
                .resolver
                .resolve_embedded(item, &actor.ap_id, ExpectedType::Object, ctx)
                .await
            {
                debug!(community = actor.ap_id, "announced object not materialized: {e}");
            }
        }
        if batch > 1 {
            debug!(community = actor.ap_id, items = batch, "batched announce unpacked");
        }
        Ok(())
    }
}

fn is_activity(v: &Value) -> bool {
    v.is_object()
        && v.get("actor").is_some()
        && type_of(v).is_some_and(|t| ActivityKind::parse(&t) != ActivityKind::Other)
}

/// A community may relay activities of its own instance's users, and activities addressed to it.
fn vouched_by(activity: &Value, actor_uri: &str, community: &Actor) -> bool {
    if domain_of(actor_uri).as_deref() == Some(community.domain.as_str()) {
        return true;
    }
    let object = activity.get("object");
    ["audience", "to", "cc"].iter().any(|field| {
        uris(activity.get(*field)).iter().any(|u| u == &community.ap_id)
            || uris(object.and_then(|o| o.get(*field)))
                .iter()
                .any(|u| u == &community.ap_id)
    })
}
