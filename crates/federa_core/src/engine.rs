/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wiring of the federation components behind the calls the CRUD layer makes.

use crate::activities::ActivityFactory;
use crate::actors::RequestVerifier;
use crate::archivist::Archivist;
use crate::batch::BatchBuffer;
use crate::config::EngineConfig;
use crate::delivery::Transport;
use crate::delivery_queue::{DeliveryQueue, QueueStats};
use crate::dispatcher::Dispatcher;
use crate::error::{FedResult, FederationError};
use crate::events::{EngineEvent, EventBus};
use crate::health::HealthTracker;
use crate::keys::{generate_keypair, KeyPair, KEY_BITS};
use crate::maintenance::Maintenance;
use crate::object_fetch::RemoteFetch;
use crate::outbound::{DeliveryPlan, Destination, Outbound};
use crate::resolver::{into_actor, Entity, ExpectedType, ResolveContext, Resolver};
use crate::store::{domain_of, Actor, ActorKind, FederationDb, NewActor, RemoteFollowState};
use crate::suspense::VoteSuspense;
use crate::votes::VoteLedger;
use anyhow::{anyhow, Context, Result};
use federa_protocol::{ActivityKind, ActivityOutcome, ActivityResultResponse};
use http::{HeaderMap, Method, Uri};
use serde_json::{json, Value};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};
use tracing::info;

const EVENT_CAPACITY: usize = 1024;

/// Name of the instance actor, served at `{base}/actor` and used to sign fetches.
pub const INSTANCE_ACTOR_NAME: &str = "actor";

#[derive(Clone)]
pub struct FederationEngine {
    cfg: EngineConfig,
    db: FederationDb,
    local_domain: String,
    events: EventBus,
    health: HealthTracker,
    archivist: Archivist,
    queue: DeliveryQueue,
    votes: VoteLedger,
    resolver: Resolver,
    outbound: Outbound,
    dispatcher: Dispatcher,
    verifier: RequestVerifier,
    maintenance: Maintenance,
    suspense: Arc<VoteSuspense>,
}

impl FederationEngine {
    pub fn open(
        cfg: EngineConfig,
        db_path: impl AsRef<Path>,
        fetcher: Arc<dyn RemoteFetch>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let base_url = cfg.base_url();
        let local_domain = domain_of(&base_url).ok_or_else(|| anyhow!("invalid public base url {base_url}"))?;
        let db = FederationDb::open(db_path)?;
        for pattern in &cfg.blocked_domains {
            db.block_instance(pattern)?;
        }

        let events = EventBus::new(EVENT_CAPACITY);
        let health = HealthTracker::new(db.clone(), cfg.health.clone()).with_events(events.clone());
        let archivist = Archivist::new(db.clone());
        let queue = DeliveryQueue::open(
            db.clone(),
            cfg.queue.clone(),
            health.clone(),
            archivist.clone(),
            transport,
        )?;
        let suspense = Arc::new(VoteSuspense::new(Duration::from_secs(cfg.suspense.ttl_secs)));
        let votes = VoteLedger::new(db.clone(), events.clone());
        let resolver = Resolver::new(
            db.clone(),
            fetcher,
            suspense.clone(),
            votes.clone(),
            events.clone(),
            &base_url,
            cfg.resolve_max_depth,
        );
        let factory = ActivityFactory::new(&base_url);
        let outbound = Outbound::new(
            db.clone(),
            queue.clone(),
            Arc::new(BatchBuffer::new(&cfg.batch)),
            factory,
            cfg.batching_software.clone(),
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            resolver.clone(),
            suspense.clone(),
            votes.clone(),
            outbound.clone(),
            events.clone(),
            cfg.accept_object_by_id_software.clone(),
            cfg.allow_remote_fetch,
        );
        let verifier = RequestVerifier::new(db.clone(), resolver.clone(), health.clone(), cfg.max_date_skew());
        let maintenance = Maintenance::new(
            cfg.retention.clone(),
            suspense.clone(),
            outbound.clone(),
            queue.clone(),
            archivist.clone(),
        );

        info!(domain = local_domain, db = %db.path().display(), "federation engine ready");
        Ok(Self {
            cfg,
            db,
            local_domain,
            events,
            health,
            archivist,
            queue,
            votes,
            resolver,
            outbound,
            dispatcher,
            verifier,
            maintenance,
            suspense,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn db(&self) -> &FederationDb {
        &self.db
    }

    pub fn archivist(&self) -> &Archivist {
        &self.archivist
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }

    pub fn suspense(&self) -> &VoteSuspense {
        &self.suspense
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn factory(&self) -> &ActivityFactory {
        self.outbound.factory()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Delivery worker and maintenance worker; both stop when `shutdown` turns true.
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.queue.start_worker(shutdown.clone()),
            self.maintenance.start_worker(shutdown),
        ]
    }

    // ---- collaborator calls ----------------------------------------------------------------

    pub async fn resolve(&self, uri: &str) -> FedResult<Entity> {
        let mut ctx = ResolveContext::new(self.cfg.allow_remote_fetch);
        self.resolver.resolve(uri, ExpectedType::Any, &mut ctx).await
    }

    pub async fn resolve_as(&self, uri: &str, expected: ExpectedType) -> FedResult<Entity> {
        let mut ctx = ResolveContext::new(self.cfg.allow_remote_fetch);
        self.resolver.resolve(uri, expected, &mut ctx).await
    }

    /// In-process hand-over of an activity that needs no signature check.
    pub async fn dispatch(&self, activity: &Value) -> ActivityOutcome {
        self.dispatcher.dispatch(activity, None).await
    }

    /// Activity received over HTTP and signed by `signer`.
    pub async fn dispatch_signed(&self, activity: &Value, signer: &Actor) -> ActivityOutcome {
        self.dispatcher.dispatch(activity, Some(signer)).await
    }

    pub async fn deliver(&self, activity: &Value, actor: &Actor, destination: Destination) -> FedResult<DeliveryPlan> {
        self.outbound.deliver(activity, actor, destination).await
    }

    pub async fn verify_request(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> FedResult<Actor> {
        self.verifier.verify_request(method, uri, headers, body).await
    }

    /// Terminal result of an activity; `None` while unknown or still being processed.
    pub fn activity_result(&self, activity_id: &str) -> Result<Option<ActivityResultResponse>> {
        Ok(self.db.get_activity(activity_id)?.and_then(|e| {
            e.result.map(|result| ActivityResultResponse {
                id: e.activity_id,
                result,
                exception: e.exception,
            })
        }))
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats()
    }

    // ---- local actors ----------------------------------------------------------------------

    /// Local user (`/u/{name}`), community (`/c/{name}`) or the instance actor (`/actor`).
    /// Returns the existing actor when the name is taken. A keypair is generated when none
    /// is given.
    pub async fn create_local_actor(&self, kind: ActorKind, name: &str, keys: Option<KeyPair>) -> Result<Actor> {
        if let Some(existing) = self.db.find_local_actor(kind, name)? {
            return Ok(existing);
        }
        let keys = match keys {
            Some(k) => k,
            None => tokio::task::spawn_blocking(|| generate_keypair(KEY_BITS))
                .await
                .context("keygen task panicked")??,
        };
        let base = self.cfg.base_url();
        let ap_id = match kind {
            ActorKind::Person => format!("{base}/u/{name}"),
            ActorKind::Group => format!("{base}/c/{name}"),
            ActorKind::Application => format!("{base}/actor"),
        };
        let new = NewActor {
            inbox: Some(format!("{ap_id}/inbox")),
            shared_inbox: Some(format!("{base}/inbox")),
            followers_url: (kind == ActorKind::Group).then(|| format!("{ap_id}/followers")),
            public_key_id: Some(format!("{ap_id}#main-key")),
            public_key_pem: Some(keys.public_key_pem),
            private_key_pem: Some(keys.private_key_pem),
            ap_id,
            kind,
            name: name.to_string(),
            domain: self.local_domain.clone(),
            local: true,
        };
        let (actor, created) = self.db.call(move |db| db.insert_or_fetch_actor(&new)).await?;
        if created {
            info!(actor = actor.ap_id, kind = kind.as_str(), "local actor created");
        }
        Ok(actor)
    }

    /// The instance actor with the key that also signs resolver fetches.
    pub async fn ensure_instance_actor(&self, keys: KeyPair) -> Result<Actor> {
        self.create_local_actor(ActorKind::Application, INSTANCE_ACTOR_NAME, Some(keys))
            .await
    }

    fn local_actor(&self, id: i64) -> FedResult<Actor> {
        self.db
            .get_actor(id)?
            .filter(|a| a.local)
            .ok_or_else(|| FederationError::not_found(format!("local actor {id}")))
    }

    // ---- outbound convenience --------------------------------------------------------------

    /// Federate a local post or reply (`Create` or `Update`) through its community.
    pub async fn publish_object(&self, object_id: i64, kind: ActivityKind) -> FedResult<DeliveryPlan> {
        if !matches!(kind, ActivityKind::Create | ActivityKind::Update) {
            return Err(FederationError::malformed(format!("cannot publish with {}", kind.as_str())));
        }
        let object = self
            .db
            .get_object(object_id)?
            .ok_or_else(|| FederationError::not_found(format!("object {object_id}")))?;
        let author = self.local_actor(object.author_id)?;
        let community = self
            .db
            .get_actor(object.community_id)?
            .ok_or_else(|| FederationError::not_found(format!("community {}", object.community_id)))?;
        let parent_uri = match object.parent_id {
            Some(pid) => self.db.get_object(pid)?.map(|p| self.factory().object_uri(&p)),
            None => None,
        };
        let factory = self.factory();
        let doc = factory.object_document(&object, &author, &community, parent_uri.as_deref());
        let activity = factory.create_or_update(kind, &author, &community, doc);
        self.deliver(&activity, &author, Destination::Community(community.id)).await
    }

    pub async fn delete_object(&self, object_id: i64, actor_id: i64) -> FedResult<DeliveryPlan> {
        let actor = self.local_actor(actor_id)?;
        let object = self
            .db
            .get_object(object_id)?
            .ok_or_else(|| FederationError::not_found(format!("object {object_id}")))?;
        let community = self.db.get_actor(object.community_id)?;
        self.db.mark_object_deleted(object.id)?;
        let activity = self
            .factory()
            .delete(&actor, &self.factory().object_uri(&object), community.as_ref());
        self.deliver(&activity, &actor, Destination::Community(object.community_id))
            .await
    }

    /// Local vote. `direction` 0 retracts the current vote with an `Undo`.
    pub async fn vote(&self, actor_id: i64, object_id: i64, direction: i8) -> FedResult<DeliveryPlan> {
        let actor = self.local_actor(actor_id)?;
        let object = self
            .db
            .get_object(object_id)?
            .ok_or_else(|| FederationError::not_found(format!("object {object_id}")))?;
        let community = self.db.get_actor(object.community_id)?;
        let object_uri = self.factory().object_uri(&object);
        let destination = Destination::Community(object.community_id);

        if direction == 0 {
            let Some(previous) = self.db.get_vote(object.id, actor.id)? else {
                return Ok(DeliveryPlan::default());
            };
            self.votes.retract(object.id, actor.id, None)?;
            let mut inner = self
                .factory()
                .vote(previous.direction, &actor, &object_uri, community.as_ref());
            if let Some(id) = previous.activity_id {
                inner["id"] = json!(id);
            }
            let undo = self.factory().undo(&actor, inner);
            return self.deliver(&undo, &actor, destination).await;
        }

        let activity = self
            .factory()
            .vote(direction, &actor, &object_uri, community.as_ref());
        let activity_id = activity.get("id").and_then(Value::as_str).map(str::to_string);
        self.votes.apply(&object, &actor, direction, activity_id.as_deref())?;
        self.deliver(&activity, &actor, destination).await
    }

    /// Follow a community. Remote communities get a `Follow` and stay pending until they answer.
    pub async fn follow_community(&self, actor_id: i64, community_uri: &str) -> FedResult<Actor> {
        let actor = self.local_actor(actor_id)?;
        let community = into_actor(self.resolve_as(community_uri, ExpectedType::Community).await?)?;
        if community.local {
            self.db.add_community_follower(community.id, actor.id, None)?;
            return Ok(community);
        }
        let follow = self.factory().follow(&actor, &community.ap_id);
        let follow_id = follow.get("id").and_then(Value::as_str).map(str::to_string);
        self.db
            .set_remote_follow(actor.id, community.id, RemoteFollowState::Pending, follow_id.as_deref())?;
        self.deliver(&follow, &actor, Destination::Community(community.id))
            .await?;
        Ok(community)
    }

    pub async fn unfollow_community(&self, actor_id: i64, community_id: i64) -> FedResult<()> {
        let actor = self.local_actor(actor_id)?;
        let community = self
            .db
            .get_actor(community_id)?
            .ok_or_else(|| FederationError::not_found(format!("community {community_id}")))?;
        if community.local {
            self.db.remove_community_follower(community.id, actor.id)?;
            return Ok(());
        }
        if !self.db.remove_remote_follow(actor.id, community.id)? {
            return Ok(());
        }
        let follow = self.factory().follow(&actor, &community.ap_id);
        let undo = self.factory().undo(&actor, follow);
        self.deliver(&undo, &actor, Destination::Community(community.id))
            .await?;
        Ok(())
    }

    // ---- operator actions ------------------------------------------------------------------

    pub fn block_instance(&self, domain: &str) -> Result<()> {
        self.db.block_instance(domain)?;
        info!(domain, "instance blocked");
        Ok(())
    }

    pub fn unblock_instance(&self, domain: &str) -> Result<()> {
        self.db.unblock_instance(domain)?;
        info!(domain, "instance unblocked");
        Ok(())
    }

    /// Put an instance back into rotation and retry its pending deliveries now.
    pub fn mark_online(&self, domain: &str) -> Result<()> {
        self.health.mark_online(domain)?;
        self.queue.make_all_due()?;
        Ok(())
    }
}
