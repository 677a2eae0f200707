/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use federa_core::config::EngineConfig;
use federa_core::delivery::{AttemptOutcome, Signer, Transport};
use federa_core::engine::FederationEngine;
use federa_core::error::{FedResult, FederationError};
use federa_core::keys::{generate_keypair, KeyPair};
use federa_core::object_fetch::{RemoteFetch, SoftwareInfo};
use federa_core::resolver::into_actor;
use federa_core::store::{domain_of, Actor, ActorKind, FederatedObject, NewObject, ObjectKind};
use federa_protocol::AS_PUBLIC;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

pub const LOCAL_DOMAIN: &str = "l.example";

/// One small key shared by every actor in the tests; generation dominates otherwise.
pub fn keys() -> KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(1024).unwrap()).clone()
}

/// Serves documents from memory, like a set of well-behaved remote instances.
#[derive(Default)]
pub struct FakeFetch {
    docs: Mutex<HashMap<String, Value>>,
    software: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeFetch {
    pub fn put(&self, doc: Value) {
        let id = doc["id"].as_str().unwrap().to_string();
        self.docs.lock().unwrap().insert(id, doc);
    }

    pub fn set_software(&self, origin: &str, name: &str) {
        self.software
            .lock()
            .unwrap()
            .insert(origin.to_string(), name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self, uri: &str) -> usize {
        self.fetched.lock().unwrap().iter().filter(|u| *u == uri).count()
    }
}

#[async_trait]
impl RemoteFetch for FakeFetch {
    async fn fetch_json(&self, uri: &str) -> FedResult<Value> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.fetched.lock().unwrap().push(uri.to_string());
        self.docs
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| FederationError::not_found(format!("{uri} not served")))
    }

    async fn fetch_software(&self, origin: &str) -> FedResult<Option<SoftwareInfo>> {
        Ok(self.software.lock().unwrap().get(origin).map(|name| SoftwareInfo {
            name: name.clone(),
            version: None,
        }))
    }
}

/// Records every POST; domains in `failing` answer like an unreachable host.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Value)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn fail_domain(&self, domain: &str) {
        self.failing.lock().unwrap().insert(domain.to_string());
    }

    pub fn heal_domain(&self, domain: &str) {
        self.failing.lock().unwrap().remove(domain);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post_activity(&self, _signer: &Signer, inbox: &str, body: Bytes) -> AttemptOutcome {
        let domain = domain_of(inbox).unwrap_or_default();
        if self.failing.lock().unwrap().contains(&domain) {
            return AttemptOutcome::Transient("connection refused".into());
        }
        let doc = serde_json::from_slice(&body).unwrap_or(Value::Null);
        self.sent.lock().unwrap().push((inbox.to_string(), doc));
        AttemptOutcome::Delivered
    }
}

pub fn config() -> EngineConfig {
    let mut cfg = EngineConfig {
        domain: LOCAL_DOMAIN.to_string(),
        ..EngineConfig::default()
    };
    cfg.queue.base_backoff_secs = 0;
    cfg.queue.max_backoff_secs = 0;
    cfg
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: FederationEngine,
    pub fetch: Arc<FakeFetch>,
    pub transport: Arc<RecordingTransport>,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(cfg: EngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let fetch = Arc::new(FakeFetch::default());
    let transport = Arc::new(RecordingTransport::default());
    let engine = open_engine(cfg, dir.path(), fetch.clone(), transport.clone());
    Harness {
        dir,
        engine,
        fetch,
        transport,
    }
}

pub fn open_engine(
    cfg: EngineConfig,
    dir: &Path,
    fetch: Arc<FakeFetch>,
    transport: Arc<RecordingTransport>,
) -> FederationEngine {
    FederationEngine::open(cfg, dir.join("federa.db"), fetch, transport).unwrap()
}

impl Harness {
    pub async fn community(&self, name: &str) -> Actor {
        self.engine
            .create_local_actor(ActorKind::Group, name, Some(keys()))
            .await
            .unwrap()
    }

    pub async fn user(&self, name: &str) -> Actor {
        self.engine
            .create_local_actor(ActorKind::Person, name, Some(keys()))
            .await
            .unwrap()
    }

    /// Serve a remote person and materialize it.
    pub async fn remote_person(&self, domain: &str, name: &str) -> Actor {
        let doc = person(domain, name);
        let uri = doc["id"].as_str().unwrap().to_string();
        self.fetch.put(doc);
        into_actor(self.engine.resolve(&uri).await.unwrap()).unwrap()
    }

    pub fn local_post(&self, author: &Actor, community: &Actor) -> FederatedObject {
        let (post, _) = self
            .engine
            .db()
            .insert_or_fetch_object(&NewObject {
                ap_id: None,
                kind: ObjectKind::Post,
                author_id: author.id,
                community_id: community.id,
                parent_id: None,
                title: Some("Release notes".into()),
                body: Some("<p>what changed</p>".into()),
                local: true,
                published_ms: None,
            })
            .unwrap();
        post
    }
}

pub fn person(domain: &str, name: &str) -> Value {
    actor_doc("Person", &format!("https://{domain}/u/{name}"), domain, name)
}

pub fn group(domain: &str, name: &str) -> Value {
    let mut doc = actor_doc("Group", &format!("https://{domain}/c/{name}"), domain, name);
    doc["followers"] = json!(format!("https://{domain}/c/{name}/followers"));
    doc
}

fn actor_doc(kind: &str, id: &str, domain: &str, name: &str) -> Value {
    json!({
        "id": id,
        "type": kind,
        "preferredUsername": name,
        "inbox": format!("{id}/inbox"),
        "endpoints": { "sharedInbox": format!("https://{domain}/inbox") },
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": keys().public_key_pem,
        }
    })
}

pub fn page(domain: &str, n: u32, author: &str, community: &str) -> Value {
    json!({
        "id": format!("https://{domain}/post/{n}"),
        "type": "Page",
        "attributedTo": author,
        "name": format!("Post {n}"),
        "content": "<p>hello</p>",
        "to": [AS_PUBLIC],
        "cc": [community],
        "audience": community,
    })
}

pub fn activity(ty: &str, id: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": ty,
        "actor": actor,
        "object": object,
    })
}
