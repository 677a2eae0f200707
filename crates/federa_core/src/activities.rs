/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound ActivityStreams payloads.

use crate::store::{new_activity_id, Actor, FederatedObject, ObjectKind};
use federa_protocol::{ActivityKind, AS_CONTEXT, AS_PUBLIC};
use serde_json::{json, Map, Value};

/// Mints ids under our public origin.
#[derive(Clone)]
pub struct ActivityFactory {
    base_url: String,
}

impl ActivityFactory {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn new_id(&self, kind: ActivityKind) -> String {
        new_activity_id(&self.base_url, kind)
    }

    fn envelope(&self, kind: ActivityKind, actor: &str, object: Value) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("@context".into(), json!(AS_CONTEXT));
        m.insert("id".into(), json!(self.new_id(kind)));
        m.insert("type".into(), json!(kind.as_str()));
        m.insert("actor".into(), json!(actor));
        m.insert("object".into(), object);
        m
    }

    /// `Create`/`Update` of a post or reply, addressed publicly and to its community.
    pub fn create_or_update(
        &self,
        kind: ActivityKind,
        author: &Actor,
        community: &Actor,
        object_doc: Value,
    ) -> Value {
        let mut m = self.envelope(kind, &author.ap_id, object_doc);
        m.insert("to".into(), json!([AS_PUBLIC]));
        m.insert("cc".into(), json!([community.ap_id]));
        m.insert("audience".into(), json!(community.ap_id));
        Value::Object(m)
    }

    pub fn vote(&self, direction: i8, voter: &Actor, object_uri: &str, community: Option<&Actor>) -> Value {
        let kind = if direction > 0 {
            ActivityKind::Like
        } else {
            ActivityKind::Dislike
        };
        let mut m = self.envelope(kind, &voter.ap_id, json!(object_uri));
        if let Some(c) = community {
            m.insert("audience".into(), json!(c.ap_id));
        }
        Value::Object(m)
    }

    pub fn delete(&self, actor: &Actor, object_uri: &str, community: Option<&Actor>) -> Value {
        let mut m = self.envelope(ActivityKind::Delete, &actor.ap_id, json!(object_uri));
        m.insert("to".into(), json!([AS_PUBLIC]));
        if let Some(c) = community {
            m.insert("cc".into(), json!([c.ap_id]));
            m.insert("audience".into(), json!(c.ap_id));
        }
        Value::Object(m)
    }

    /// `Undo` embedding the full activity being undone.
    pub fn undo(&self, actor: &Actor, inner: Value) -> Value {
        Value::Object(self.envelope(ActivityKind::Undo, &actor.ap_id, inner))
    }

    pub fn follow(&self, follower: &Actor, community_uri: &str) -> Value {
        let mut m = self.envelope(ActivityKind::Follow, &follower.ap_id, json!(community_uri));
        m.insert("to".into(), json!([community_uri]));
        Value::Object(m)
    }

    /// `Accept`/`Reject` of a Follow. `follow` is either the embedded Follow or its id,
    /// depending on what the peer software expects.
    pub fn follow_response(&self, accept: bool, community: &Actor, follower_uri: &str, follow: Value) -> Value {
        let kind = if accept {
            ActivityKind::Accept
        } else {
            ActivityKind::Reject
        };
        let mut m = self.envelope(kind, &community.ap_id, follow);
        m.insert("to".into(), json!([follower_uri]));
        Value::Object(m)
    }

    /// Community relay of an activity to its followers.
    pub fn announce(&self, community: &Actor, inner: Value) -> Value {
        let mut m = self.envelope(ActivityKind::Announce, &community.ap_id, inner);
        m.insert("to".into(), json!([AS_PUBLIC]));
        if let Some(f) = community.followers_url.as_deref() {
            m.insert("cc".into(), json!([f]));
        }
        Value::Object(m)
    }

    /// Several announced activities in one envelope. A single item is a plain Announce.
    pub fn announce_batch(&self, community: &Actor, mut items: Vec<Value>) -> Value {
        if items.len() == 1 {
            let only = items.remove(0);
            return self.announce(community, only);
        }
        self.announce(community, Value::Array(items))
    }

    /// Public document of a local actor, as fetched by peers verifying our signatures.
    pub fn actor_document(&self, actor: &Actor) -> Value {
        let mut m = Map::new();
        m.insert(
            "@context".into(),
            json!([AS_CONTEXT, "https://w3id.org/security/v1"]),
        );
        m.insert("id".into(), json!(actor.ap_id));
        m.insert("type".into(), json!(actor.kind.as_str()));
        m.insert("preferredUsername".into(), json!(actor.name));
        if let Some(inbox) = &actor.inbox {
            m.insert("inbox".into(), json!(inbox));
        }
        m.insert("outbox".into(), json!(format!("{}/outbox", actor.ap_id)));
        if let Some(f) = &actor.followers_url {
            m.insert("followers".into(), json!(f));
        }
        if let Some(shared) = &actor.shared_inbox {
            m.insert("endpoints".into(), json!({ "sharedInbox": shared }));
        }
        if let Some(pem) = &actor.public_key_pem {
            m.insert(
                "publicKey".into(),
                json!({
                    "id": actor.key_id(),
                    "owner": actor.ap_id,
                    "publicKeyPem": pem,
                }),
            );
        }
        Value::Object(m)
    }

    pub fn object_uri(&self, obj: &FederatedObject) -> String {
        obj.canonical_uri(&self.base_url)
    }

    /// Page/Note document of a local post or reply.
    pub fn object_document(
        &self,
        obj: &FederatedObject,
        author: &Actor,
        community: &Actor,
        parent_uri: Option<&str>,
    ) -> Value {
        let mut m = Map::new();
        m.insert("id".into(), json!(self.object_uri(obj)));
        m.insert("attributedTo".into(), json!(author.ap_id));
        m.insert("to".into(), json!([AS_PUBLIC]));
        m.insert("cc".into(), json!([community.ap_id]));
        m.insert("audience".into(), json!(community.ap_id));
        match obj.kind {
            ObjectKind::Post => {
                m.insert("type".into(), json!("Page"));
                if let Some(t) = &obj.title {
                    m.insert("name".into(), json!(t));
                }
            }
            ObjectKind::Reply => {
                m.insert("type".into(), json!("Note"));
                if let Some(p) = parent_uri {
                    m.insert("inReplyTo".into(), json!(p));
                }
            }
        }
        if let Some(b) = &obj.body {
            m.insert("content".into(), json!(b));
            m.insert("mediaType".into(), json!("text/html"));
        }
        Value::Object(m)
    }
}

/// Remote actors tagged as `Mention` in an activity or its object.
pub fn mentioned_actors(activity: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let tags = [activity.get("tag"), activity.get("object").and_then(|o| o.get("tag"))];
    for tag in tags.into_iter().flatten() {
        let items: Vec<&Value> = match tag {
            Value::Array(a) => a.iter().collect(),
            other => vec![other],
        };
        for t in items {
            if t.get("type").and_then(Value::as_str) != Some("Mention") {
                continue;
            }
            if let Some(href) = t.get("href").and_then(Value::as_str) {
                if !out.iter().any(|h| h == href) {
                    out.push(href.to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ActorKind;

    fn actor(ap_id: &str, kind: ActorKind) -> Actor {
        Actor {
            id: 1,
            ap_id: ap_id.into(),
            kind,
            name: "x".into(),
            inbox: None,
            shared_inbox: None,
            followers_url: Some(format!("{ap_id}/followers")),
            public_key_id: None,
            public_key_pem: None,
            private_key_pem: None,
            instance_id: 1,
            domain: "l.example".into(),
            local: true,
            deleted: false,
        }
    }

    #[test]
    fn batch_of_one_is_plain_announce() {
        let f = ActivityFactory::new("https://l.example/");
        let c = actor("https://l.example/c/rust", ActorKind::Group);
        let one = f.announce_batch(&c, vec![json!({"id": "a", "type": "Like"})]);
        assert_eq!(one["type"], "Announce");
        assert_eq!(one["object"]["id"], "a");
        assert!(one["id"].as_str().unwrap().starts_with("https://l.example/activities/announce/"));

        let many = f.announce_batch(&c, vec![json!({"id": "a"}), json!({"id": "b"})]);
        assert_eq!(many["object"].as_array().unwrap().len(), 2);
        assert_eq!(many["cc"][0], "https://l.example/c/rust/followers");
    }

    #[test]
    fn mentions_are_collected_once() {
        let a = json!({
            "tag": {"type": "Mention", "href": "https://r.example/u/bob"},
            "object": {"tag": [
                {"type": "Mention", "href": "https://r.example/u/bob"},
                {"type": "Hashtag", "href": "https://r.example/tags/rust"},
                {"type": "Mention", "href": "https://s.example/u/eve"}
            ]}
        });
        assert_eq!(
            mentioned_actors(&a),
            vec!["https://r.example/u/bob", "https://s.example/u/eve"]
        );
    }
}
