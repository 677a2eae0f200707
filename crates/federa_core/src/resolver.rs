/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! On-demand materialization of remote actors, posts and replies.
//!
//! A URI is looked up locally first; otherwise the document is fetched (signed), classified,
//! its required parents are resolved recursively, and the row is inserted-or-fetched so that
//! racing resolvers converge on one row. Recursion is bounded by depth and by an in-progress
//! set; both limits surface as `NotFound`.

use crate::error::{FedResult, FederationError};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::object_fetch::RemoteFetch;
use crate::store::{
    domain_of, now_ms, Actor, ActorKind, FederatedObject, FederationDb, NewActor, NewObject, ObjectKind,
};
use crate::suspense::VoteSuspense;
use crate::votes::VoteLedger;
use federa_protocol::AS_PUBLIC;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

const POST_TYPES: &[&str] = &["Page", "Article", "Note", "Question", "Video"];
const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group"];

#[derive(Debug, Clone)]
pub enum Entity {
    Object(FederatedObject),
    Actor(Actor),
}

impl Entity {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Object(o) => o.kind.as_str(),
            Self::Actor(a) if a.kind == ActorKind::Group => "community",
            Self::Actor(_) => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedType {
    Any,
    /// Post or reply.
    Object,
    Actor,
    Community,
}

impl ExpectedType {
    fn accepts(&self, e: &Entity) -> bool {
        match (self, e) {
            (Self::Any, _) => true,
            (Self::Object, Entity::Object(_)) => true,
            (Self::Actor, Entity::Actor(_)) => true,
            (Self::Community, Entity::Actor(a)) => a.can_be_followed(),
            _ => false,
        }
    }
}

/// Request-scoped memo of resolved URIs. Created per inbound activity and dropped with it.
pub struct ResolveContext {
    cache: HashMap<String, Entity>,
    in_progress: HashSet<String>,
    allow_fetch: bool,
}

impl ResolveContext {
    pub fn new(allow_fetch: bool) -> Self {
        Self {
            cache: HashMap::new(),
            in_progress: HashSet::new(),
            allow_fetch,
        }
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn allows_fetch(&self) -> bool {
        self.allow_fetch
    }
}

#[derive(Clone)]
pub struct Resolver {
    db: FederationDb,
    fetcher: Arc<dyn RemoteFetch>,
    suspense: Arc<VoteSuspense>,
    votes: VoteLedger,
    events: EventBus,
    base_url: String,
    local_domain: String,
    max_depth: usize,
}

impl Resolver {
    pub fn new(
        db: FederationDb,
        fetcher: Arc<dyn RemoteFetch>,
        suspense: Arc<VoteSuspense>,
        votes: VoteLedger,
        events: EventBus,
        base_url: &str,
        max_depth: usize,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let local_domain = domain_of(&base_url).unwrap_or_default();
        Self {
            db,
            fetcher,
            suspense,
            votes,
            events,
            base_url,
            local_domain,
            max_depth,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_local(&self, uri: &str) -> bool {
        domain_of(uri).is_some_and(|d| d == self.local_domain)
    }

    /// Store-only lookup by canonical id.
    pub fn lookup_local(&self, uri: &str) -> FedResult<Option<Entity>> {
        let uri = uri.trim();
        if let Some(a) = self.db.find_actor_by_ap_id(uri)? {
            return Ok(Some(Entity::Actor(a)));
        }
        if let Some(o) = self.db.find_object_by_ap_id(uri)? {
            return Ok(Some(Entity::Object(o)));
        }
        if let Some(id) = self.local_object_id(uri) {
            if let Some(o) = self.db.get_object(id)? {
                return Ok(Some(Entity::Object(o)));
            }
        }
        Ok(None)
    }

    /// `{base}/post/{id}` and `{base}/comment/{id}`.
    fn local_object_id(&self, uri: &str) -> Option<i64> {
        let rest = uri.strip_prefix(&self.base_url)?;
        let rest = rest
            .strip_prefix("/post/")
            .or_else(|| rest.strip_prefix("/comment/"))?;
        rest.parse().ok()
    }

    pub async fn resolve(&self, uri: &str, expected: ExpectedType, ctx: &mut ResolveContext) -> FedResult<Entity> {
        self.resolve_in(uri.trim().to_string(), expected, ctx, 0).await
    }

    pub async fn resolve_actor(&self, uri: &str, ctx: &mut ResolveContext) -> FedResult<Actor> {
        into_actor(self.resolve(uri, ExpectedType::Actor, ctx).await?)
    }

    pub async fn resolve_object(&self, uri: &str, ctx: &mut ResolveContext) -> FedResult<FederatedObject> {
        into_object(self.resolve(uri, ExpectedType::Object, ctx).await?)
    }

    fn resolve_in<'a>(
        &'a self,
        uri: String,
        expected: ExpectedType,
        ctx: &'a mut ResolveContext,
        depth: usize,
    ) -> BoxFuture<'a, FedResult<Entity>> {
        async move {
            if uri.is_empty() {
                return Err(FederationError::malformed("empty reference"));
            }
            if let Some(hit) = ctx.cache.get(&uri) {
                return check_expected(&uri, hit.clone(), expected);
            }
            if let Some(found) = self.lookup_local(&uri)? {
                ctx.cache.insert(uri.clone(), found.clone());
                return check_expected(&uri, found, expected);
            }
            if self.is_local(&uri) {
                return Err(FederationError::not_found(format!("no local entity {uri}")));
            }
            if !ctx.allow_fetch {
                return Err(FederationError::not_found(format!("{uri} unknown and fetching disabled")));
            }
            if depth > self.max_depth {
                return Err(FederationError::not_found(format!("resolution depth exceeded at {uri}")));
            }
            if !ctx.in_progress.insert(uri.clone()) {
                return Err(FederationError::not_found(format!("reference cycle through {uri}")));
            }

            let res = async {
                let doc = self.fetcher.fetch_json(&uri).await?;
                self.materialize(&uri, doc, ctx, depth).await
            }
            .await;
            ctx.in_progress.remove(&uri);
            let entity = res?;
            ctx.cache.insert(uri.clone(), entity.clone());
            check_expected(&uri, entity, expected)
        }
        .boxed()
    }

    /// An object embedded in an activity. Trusted as-is when it shares the activity actor's
    /// origin, otherwise re-fetched from where its id points.
    pub async fn resolve_embedded(
        &self,
        value: &Value,
        activity_actor: &str,
        expected: ExpectedType,
        ctx: &mut ResolveContext,
    ) -> FedResult<Entity> {
        let Some(id) = id_of(value) else {
            return Err(FederationError::malformed("object without id"));
        };
        if value.is_string() || domain_of(&id) != domain_of(activity_actor) {
            return self.resolve(&id, expected, ctx).await;
        }
        if let Some(found) = self.lookup_local(&id)? {
            ctx.cache.insert(id.clone(), found.clone());
            return check_expected(&id, found, expected);
        }
        if !ctx.in_progress.insert(id.clone()) {
            return Err(FederationError::not_found(format!("reference cycle through {id}")));
        }
        let res = self.materialize(&id, value.clone(), ctx, 0).await;
        ctx.in_progress.remove(&id);
        let entity = res?;
        ctx.cache.insert(id.clone(), entity.clone());
        check_expected(&id, entity, expected)
    }

    async fn materialize(&self, fetched_uri: &str, doc: Value, ctx: &mut ResolveContext, depth: usize) -> FedResult<Entity> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or(fetched_uri)
            .to_string();
        if domain_of(&id) != domain_of(fetched_uri) {
            return Err(FederationError::malformed(format!(
                "document id {id} does not share the origin of {fetched_uri}"
            )));
        }
        if id != fetched_uri {
            if let Some(found) = self.lookup_local(&id)? {
                return Ok(found);
            }
        }
        let ty = type_of(&doc).unwrap_or_default();
        if ty == "Tombstone" {
            return Err(FederationError::not_found(format!("{id} is a tombstone")));
        }
        if ACTOR_TYPES.contains(&ty.as_str()) {
            return Ok(Entity::Actor(self.materialize_actor(&id, &doc).await?));
        }
        if POST_TYPES.contains(&ty.as_str()) {
            return Ok(Entity::Object(self.materialize_object(&id, &doc, ctx, depth).await?));
        }
        Err(FederationError::not_found(format!("{id} has unsupported type {ty:?}")))
    }

    async fn materialize_actor(&self, id: &str, doc: &Value) -> FedResult<Actor> {
        let parsed: ActorDoc = serde_json::from_value(doc.clone())
            .map_err(|e| FederationError::malformed(format!("actor {id}: {e}")))?;
        let kind = ActorKind::from_ap_type(&parsed.kind)
            .ok_or_else(|| FederationError::malformed(format!("actor {id}: type {}", parsed.kind)))?;
        let domain = domain_of(id).ok_or_else(|| FederationError::malformed(format!("actor id {id}")))?;

        let (public_key_id, public_key_pem) = match parsed.public_key {
            Some(pk) => {
                let owner = pk.owner.as_deref().unwrap_or(id);
                if owner != id || domain_of(&pk.id).as_deref() != Some(domain.as_str()) {
                    return Err(FederationError::malformed(format!("actor {id}: key {} not owned", pk.id)));
                }
                (Some(pk.id), Some(pk.public_key_pem))
            }
            None => (None, None),
        };
        let name = parsed
            .preferred_username
            .or(parsed.name)
            .unwrap_or_else(|| id.rsplit('/').next().unwrap_or(id).to_string());
        let shared_inbox = parsed.endpoints.and_then(|e| e.shared_inbox);
        let new = NewActor {
            ap_id: id.to_string(),
            kind,
            name,
            inbox: parsed.inbox,
            shared_inbox,
            followers_url: parsed.followers,
            public_key_id,
            public_key_pem,
            private_key_pem: None,
            domain: domain.clone(),
            local: false,
        };

        let known_software = self.db.get_instance(&domain)?.and_then(|i| i.software).is_some();
        let (actor, created) = self
            .db
            .call(move |db| {
                let (actor, created) = db.insert_or_fetch_actor(&new)?;
                if !created {
                    db.update_actor_profile(actor.id, &new.name, new.inbox.as_deref(), new.shared_inbox.as_deref())?;
                } else if let Some(shared) = new.shared_inbox.as_deref() {
                    db.set_instance_inboxes(&new.domain, None, Some(shared))?;
                }
                Ok((actor, created))
            })
            .await?;
        if created {
            debug!(actor = id, kind = kind.as_str(), "materialized remote actor");
            if !known_software {
                self.discover_software(id, &domain).await;
            }
        }
        Ok(actor)
    }

    /// Best effort; instances without NodeInfo simply stay unclassified.
    async fn discover_software(&self, uri: &str, domain: &str) {
        let Some(origin) = origin_of(uri) else { return };
        match self.fetcher.fetch_software(&origin).await {
            Ok(Some(sw)) => {
                info!(domain, software = sw.name, "instance software discovered");
                if let Err(e) = self.db.set_instance_software(domain, &sw.name, sw.version.as_deref()) {
                    warn!(domain, "store software failed: {e:#}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(domain, "nodeinfo unavailable: {e}"),
        }
    }

    async fn materialize_object(
        &self,
        id: &str,
        doc: &Value,
        ctx: &mut ResolveContext,
        depth: usize,
    ) -> FedResult<FederatedObject> {
        let author_uri = attributed_to(doc)
            .ok_or_else(|| FederationError::malformed(format!("{id}: missing attributedTo")))?;
        if domain_of(&author_uri) != domain_of(id) {
            return Err(FederationError::malformed(format!("{id}: author {author_uri} is cross-origin")));
        }
        let author = into_actor(self.resolve_in(author_uri, ExpectedType::Actor, ctx, depth + 1).await?)?;

        let (kind, parent_id, community_id) = match doc.get("inReplyTo").and_then(id_of) {
            Some(parent_uri) => {
                let parent = into_object(self.resolve_in(parent_uri, ExpectedType::Object, ctx, depth + 1).await?)?;
                (ObjectKind::Reply, Some(parent.id), parent.community_id)
            }
            None => {
                let community = self.find_community(doc, ctx, depth).await?;
                (ObjectKind::Post, None, community.id)
            }
        };

        let new = NewObject {
            ap_id: Some(id.to_string()),
            kind,
            author_id: author.id,
            community_id,
            parent_id,
            title: doc.get("name").and_then(Value::as_str).map(str::to_string),
            body: doc.get("content").and_then(Value::as_str).map(str::to_string),
            local: false,
            published_ms: None,
        };
        let (object, created) = self.db.call(move |db| db.insert_or_fetch_object(&new)).await?;
        if created {
            debug!(object = id, kind = kind.as_str(), "materialized remote object");
            self.events
                .emit(EngineEvent::new(EventKind::ObjectCreated).object(object.id).actor(author.id));
            return self.apply_suspended(object, id, ctx, depth).await;
        }
        Ok(object)
    }

    /// Community of a top-level post: `audience` first, then the `to`/`cc` addressees.
    async fn find_community(&self, doc: &Value, ctx: &mut ResolveContext, depth: usize) -> FedResult<Actor> {
        let mut candidates: Vec<String> = Vec::new();
        for field in ["audience", "to", "cc"] {
            for uri in uris(doc.get(field)) {
                if uri == AS_PUBLIC || uri.ends_with("/followers") || candidates.contains(&uri) {
                    continue;
                }
                candidates.push(uri);
            }
        }
        for uri in candidates {
            match self.resolve_in(uri.clone(), ExpectedType::Community, ctx, depth + 1).await {
                Ok(Entity::Actor(a)) => return Ok(a),
                Ok(Entity::Object(_)) => {}
                Err(e @ FederationError::Internal(_)) => return Err(e),
                Err(e) => debug!(candidate = uri, "not a community: {e}"),
            }
        }
        Err(FederationError::not_found("post has no resolvable community"))
    }

    /// Votes that arrived before their target, applied in arrival order.
    /// Apply votes waiting on `uri` if the object was stored after the caller missed it.
    pub async fn apply_if_arrived(&self, uri: &str, ctx: &mut ResolveContext) -> FedResult<Option<FederatedObject>> {
        match self.lookup_local(uri)? {
            Some(Entity::Object(object)) => Ok(Some(self.apply_suspended(object, uri, ctx, 0).await?)),
            _ => Ok(None),
        }
    }

    async fn apply_suspended(
        &self,
        mut object: FederatedObject,
        uri: &str,
        ctx: &mut ResolveContext,
        depth: usize,
    ) -> FedResult<FederatedObject> {
        let pending = self.suspense.drain(uri, now_ms());
        for vote in pending {
            let voter = match self.resolve_in(vote.actor_uri.clone(), ExpectedType::Actor, ctx, depth + 1).await {
                Ok(Entity::Actor(a)) => a,
                Ok(Entity::Object(_)) => continue,
                Err(e) => {
                    warn!(activity_id = vote.activity_id, "suspended vote dropped: {e}");
                    continue;
                }
            };
            match self.votes.apply(&object, &voter, vote.direction, Some(&vote.activity_id)) {
                Ok(updated) => object = updated,
                Err(e) => warn!(activity_id = vote.activity_id, "suspended vote failed: {e}"),
            }
        }
        Ok(object)
    }
}

pub fn into_actor(e: Entity) -> FedResult<Actor> {
    match e {
        Entity::Actor(a) => Ok(a),
        Entity::Object(o) => Err(FederationError::Ignored(format!("object {} is not an actor", o.id))),
    }
}

pub fn into_object(e: Entity) -> FedResult<FederatedObject> {
    match e {
        Entity::Object(o) => Ok(o),
        Entity::Actor(a) => Err(FederationError::Ignored(format!("{} is not a post or reply", a.ap_id))),
    }
}

fn check_expected(uri: &str, e: Entity, expected: ExpectedType) -> FedResult<Entity> {
    if expected.accepts(&e) {
        Ok(e)
    } else {
        Err(FederationError::Ignored(format!(
            "{uri} is a {}, expected {expected:?}",
            e.kind_name()
        )))
    }
}

pub fn type_of(v: &Value) -> Option<String> {
    match v.get("type")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(a) => a.iter().find_map(|t| t.as_str().map(str::to_string)),
        _ => None,
    }
}

/// Id of a reference that is either a bare URI or an object with an `id`.
pub fn id_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(m) => m.get("id").and_then(Value::as_str).map(|s| s.trim().to_string()),
        _ => None,
    }
}

/// All URIs in an addressing field (string, object or array of either).
pub fn uris(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(a)) => a.iter().filter_map(id_of).collect(),
        Some(other) => id_of(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// First actor in `attributedTo`; Lemmy-style arrays may also list the community.
fn attributed_to(doc: &Value) -> Option<String> {
    match doc.get("attributedTo")? {
        Value::Array(items) => items
            .iter()
            .find(|i| i.get("type").and_then(Value::as_str) != Some("Group"))
            .and_then(id_of),
        other => id_of(other),
    }
}

pub fn origin_of(uri: &str) -> Option<String> {
    let parsed: http::Uri = uri.parse().ok()?;
    Some(format!("{}://{}", parsed.scheme_str()?, parsed.authority()?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorDoc {
    #[serde(rename = "type")]
    kind: String,
    preferred_username: Option<String>,
    name: Option<String>,
    inbox: Option<String>,
    followers: Option<String>,
    endpoints: Option<ActorEndpoints>,
    public_key: Option<ActorPublicKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorEndpoints {
    shared_inbox: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorPublicKey {
    id: String,
    owner: Option<String>,
    public_key_pem: String,
}
