/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::*;
use federa_core::archivist::ArchiveCategory;
use federa_core::health::{AttemptResult, HealthState};
use federa_core::resolver::into_object;
use federa_core::store::{ActorKind, NewObject, ObjectKind, RemoteFollowState};
use federa_core::EventKind;
use federa_protocol::{ActivityKind, ActivityOutcome, Direction};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn duplicate_activity_is_processed_once() {
    let h = harness();
    let community = h.community("rust").await;
    h.fetch.put(person("r.example", "bob"));
    let bob = "https://r.example/u/bob";
    let create = activity(
        "Create",
        "https://r.example/activities/create/1",
        bob,
        page("r.example", 1, bob, &community.ap_id),
    );

    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Duplicate);
    assert_eq!(
        h.engine
            .db()
            .count_objects_with_ap_id("https://r.example/post/1")
            .unwrap(),
        1
    );

    let result = h
        .engine
        .activity_result("https://r.example/activities/create/1")
        .unwrap()
        .unwrap();
    assert_eq!(result.result, ActivityOutcome::Success);
    assert!(result.exception.is_none());
}

#[tokio::test]
async fn concurrent_resolution_creates_one_row() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    h.fetch.put(page("r.example", 2, bob, &community.ap_id));
    h.fetch.set_delay(Duration::from_millis(20));

    let uri = "https://r.example/post/2";
    let (a, b) = tokio::join!(h.engine.resolve(uri), h.engine.resolve(uri));
    let a = into_object(a.unwrap()).unwrap();
    let b = into_object(b.unwrap()).unwrap();

    assert_eq!(a.id, b.id);
    assert_eq!(a.community_id, community.id);
    assert_eq!(h.engine.db().count_objects_with_ap_id(uri).unwrap(), 1);
}

#[tokio::test]
async fn unsupported_and_malformed_activities_are_reported() {
    let h = harness();
    h.fetch.put(person("r.example", "bob"));
    let bob = "https://r.example/u/bob";

    let odd = activity("Flag", "https://r.example/activities/flag/1", bob, json!("https://r.example/post/1"));
    assert_eq!(h.engine.dispatch(&odd).await, ActivityOutcome::Ignored);

    let no_object = json!({
        "id": "https://r.example/activities/like/9",
        "type": "Like",
        "actor": bob,
    });
    assert_eq!(h.engine.dispatch(&no_object).await, ActivityOutcome::Failure);
    let result = h
        .engine
        .activity_result("https://r.example/activities/like/9")
        .unwrap()
        .unwrap();
    assert!(result.exception.unwrap().contains("missing object"));

    assert_eq!(h.engine.dispatch(&json!({"type": "Like"})).await, ActivityOutcome::Failure);
}

#[tokio::test]
async fn vote_waits_for_its_target() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    let eve = "https://s.example/u/eve";
    h.fetch.put(person("r.example", "bob"));
    h.fetch.put(person("s.example", "eve"));

    let post_uri = "https://r.example/post/7";
    let like = activity("Like", "https://s.example/activities/like/1", eve, json!(post_uri));
    assert_eq!(h.engine.dispatch(&like).await, ActivityOutcome::Success);
    assert_eq!(h.engine.db().count_objects_with_ap_id(post_uri).unwrap(), 0);

    let create = activity(
        "Create",
        "https://r.example/activities/create/7",
        bob,
        page("r.example", 7, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);

    let post = h.engine.db().find_object_by_ap_id(post_uri).unwrap().unwrap();
    assert_eq!(post.upvotes, 1);
    assert_eq!(h.engine.db().count_votes(post.id).unwrap(), 1);
}

#[tokio::test]
async fn expired_suspended_vote_is_archived() {
    let mut cfg = config();
    cfg.suspense.ttl_secs = 0;
    let h = harness_with(cfg);
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));

    let like = activity(
        "Like",
        "https://r.example/activities/like/3",
        bob,
        json!("https://r.example/post/3"),
    );
    assert_eq!(h.engine.dispatch(&like).await, ActivityOutcome::Success);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = h.engine.maintenance().run_once().await.unwrap();
    assert_eq!(report.expired_votes, 1);
    let archived = h
        .engine
        .archivist()
        .list(Some(ArchiveCategory::DeadLettered), 10)
        .unwrap();
    assert_eq!(archived.len(), 1);

    // The target showing up later no longer carries the vote.
    let create = activity(
        "Create",
        "https://r.example/activities/create/3",
        bob,
        page("r.example", 3, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);
    let post = h
        .engine
        .db()
        .find_object_by_ap_id("https://r.example/post/3")
        .unwrap()
        .unwrap();
    assert_eq!(post.upvotes, 0);
}

#[tokio::test]
async fn undo_retracts_only_the_matching_vote() {
    let h = harness();
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    let post = h.local_post(&alice, &community);
    let post_uri = h.engine.factory().object_uri(&post);
    let bob = h.remote_person("r.example", "bob").await;

    let like = activity("Like", "https://r.example/activities/like/5", &bob.ap_id, json!(post_uri));
    assert_eq!(h.engine.dispatch(&like).await, ActivityOutcome::Success);
    assert!(h.engine.db().get_vote(post.id, bob.id).unwrap().is_some());

    // Undoing a Dislike that was never cast leaves the Like alone.
    let wrong = activity(
        "Undo",
        "https://r.example/activities/undo/4",
        &bob.ap_id,
        json!({
            "id": "https://r.example/activities/dislike/4",
            "type": "Dislike",
            "actor": bob.ap_id,
            "object": post_uri,
        }),
    );
    assert_eq!(h.engine.dispatch(&wrong).await, ActivityOutcome::Ignored);
    assert!(h.engine.db().get_vote(post.id, bob.id).unwrap().is_some());

    let undo = activity("Undo", "https://r.example/activities/undo/5", &bob.ap_id, like.clone());
    assert_eq!(h.engine.dispatch(&undo).await, ActivityOutcome::Success);
    assert!(h.engine.db().get_vote(post.id, bob.id).unwrap().is_none());
    let post = h.engine.db().get_object(post.id).unwrap().unwrap();
    assert_eq!(post.upvotes, 0);
}

#[tokio::test]
async fn undo_by_someone_else_is_refused() {
    let h = harness();
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    let post = h.local_post(&alice, &community);
    let post_uri = h.engine.factory().object_uri(&post);
    let bob = h.remote_person("r.example", "bob").await;
    let mallory = h.remote_person("m.example", "mallory").await;

    let like = activity("Like", "https://r.example/activities/like/6", &bob.ap_id, json!(post_uri));
    assert_eq!(h.engine.dispatch(&like).await, ActivityOutcome::Success);

    let undo = activity("Undo", "https://m.example/activities/undo/6", &mallory.ap_id, like);
    assert_eq!(h.engine.dispatch(&undo).await, ActivityOutcome::Failure);
    assert!(h.engine.db().get_vote(post.id, bob.id).unwrap().is_some());
}

#[tokio::test]
async fn announce_reaches_live_followers_only() {
    let h = harness();
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    for domain in ["r1.example", "r2.example", "r3.example"] {
        let follower = h.remote_person(domain, "reader").await;
        h.engine
            .db()
            .add_community_follower(community.id, follower.id, None)
            .unwrap();
    }
    for _ in 0..11 {
        h.engine
            .health()
            .record_attempt("r3.example", AttemptResult::Failure)
            .unwrap();
    }
    assert_eq!(h.engine.health().state("r3.example").unwrap(), HealthState::GoneForever);

    let post = h.local_post(&alice, &community);
    let plan = h.engine.publish_object(post.id, ActivityKind::Create).await.unwrap();
    assert_eq!(plan.queued, 2);
    assert_eq!(plan.suppressed, 1);

    assert_eq!(h.engine.queue().process_due_once().await.unwrap(), 2);
    let sent = h.transport.sent();
    let inboxes: HashSet<&str> = sent.iter().map(|(inbox, _)| inbox.as_str()).collect();
    assert_eq!(
        inboxes,
        HashSet::from(["https://r1.example/inbox", "https://r2.example/inbox"])
    );
    for (_, doc) in &sent {
        assert_eq!(doc["type"], "Announce");
        assert_eq!(doc["actor"], community.ap_id.as_str());
        assert_eq!(doc["object"]["type"], "Create");
        assert_eq!(doc["object"]["object"]["id"], h.engine.factory().object_uri(&post).as_str());
    }
}

#[tokio::test]
async fn relayed_activity_skips_its_origin() {
    let h = harness();
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    let post = h.local_post(&alice, &community);
    let bob = h.remote_person("r.example", "bob").await;
    let carol = h.remote_person("c.example", "carol").await;
    for f in [&bob, &carol] {
        h.engine.db().add_community_follower(community.id, f.id, None).unwrap();
    }

    let like = activity(
        "Like",
        "https://r.example/activities/like/8",
        &bob.ap_id,
        json!(h.engine.factory().object_uri(&post)),
    );
    assert_eq!(h.engine.dispatch(&like).await, ActivityOutcome::Success);
    h.engine.queue().process_due_once().await.unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://c.example/inbox");
    assert_eq!(sent[0].1["object"]["id"], "https://r.example/activities/like/8");
}

#[tokio::test]
async fn dormant_instance_waits_until_marked_online() {
    let h = harness();
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    let bob = h.remote_person("r.example", "bob").await;
    h.engine.db().add_community_follower(community.id, bob.id, None).unwrap();
    h.transport.fail_domain("r.example");

    let post = h.local_post(&alice, &community);
    h.engine.publish_object(post.id, ActivityKind::Create).await.unwrap();
    for _ in 0..3 {
        h.engine.queue().make_all_due().unwrap();
        h.engine.queue().process_due_once().await.unwrap();
    }
    assert_eq!(h.engine.health().state("r.example").unwrap(), HealthState::Dormant);

    // Still backing off: the job waits without another attempt.
    h.transport.heal_domain("r.example");
    h.engine.queue().make_all_due().unwrap();
    h.engine.queue().process_due_once().await.unwrap();
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.engine.queue_stats().unwrap().pending, 1);

    h.engine.mark_online("r.example").unwrap();
    assert_eq!(h.engine.health().state("r.example").unwrap(), HealthState::Online);
    h.engine.queue().process_due_once().await.unwrap();
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.engine.queue_stats().unwrap().delivered, 1);
}

#[tokio::test]
async fn remote_follow_is_accepted_and_undone() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = h.remote_person("r.example", "bob").await;
    let mut events = h.engine.subscribe();

    let follow = activity(
        "Follow",
        "https://r.example/activities/follow/1",
        &bob.ap_id,
        json!(community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&follow).await, ActivityOutcome::Success);
    assert!(h.engine.db().is_community_follower(community.id, bob.id).unwrap());
    let ev = events.recv().await.unwrap();
    assert_eq!(ev.kind, EventKind::FollowerAdded);

    h.engine.queue().process_due_once().await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://r.example/inbox");
    assert_eq!(sent[0].1["type"], "Accept");
    assert_eq!(sent[0].1["object"]["id"], "https://r.example/activities/follow/1");

    let undo = activity("Undo", "https://r.example/activities/undo/1", &bob.ap_id, follow);
    assert_eq!(h.engine.dispatch(&undo).await, ActivityOutcome::Success);
    assert!(!h.engine.db().is_community_follower(community.id, bob.id).unwrap());
}

#[tokio::test]
async fn accept_references_follow_by_id_for_configured_software() {
    let mut cfg = config();
    cfg.accept_object_by_id_software = vec!["mbin".into()];
    let h = harness_with(cfg);
    let community = h.community("rust").await;
    h.fetch.set_software("https://r.example", "mbin");
    let bob = h.remote_person("r.example", "bob").await;

    let follow = activity(
        "Follow",
        "https://r.example/activities/follow/2",
        &bob.ap_id,
        json!(community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&follow).await, ActivityOutcome::Success);
    h.engine.queue().process_due_once().await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent[0].1["object"], "https://r.example/activities/follow/2");
}

#[tokio::test]
async fn following_a_remote_community_waits_for_accept() {
    let h = harness();
    let alice = h.user("alice").await;
    h.fetch.put(group("r.example", "news"));

    let community = h
        .engine
        .follow_community(alice.id, "https://r.example/c/news")
        .await
        .unwrap();
    assert_eq!(community.kind, ActorKind::Group);
    assert_eq!(
        h.engine.db().get_remote_follow(alice.id, community.id).unwrap(),
        Some(RemoteFollowState::Pending)
    );

    h.engine.queue().process_due_once().await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1["type"], "Follow");
    let follow_id = sent[0].1["id"].as_str().unwrap().to_string();

    let accept = activity(
        "Accept",
        "https://r.example/activities/accept/1",
        &community.ap_id,
        json!(follow_id),
    );
    assert_eq!(h.engine.dispatch(&accept).await, ActivityOutcome::Success);
    assert_eq!(
        h.engine.db().get_remote_follow(alice.id, community.id).unwrap(),
        Some(RemoteFollowState::Accepted)
    );
}

#[tokio::test]
async fn blocked_instance_activities_are_ignored() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    h.engine.block_instance("r.example").unwrap();

    let create = activity(
        "Create",
        "https://r.example/activities/create/11",
        bob,
        page("r.example", 11, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Ignored);
    assert_eq!(
        h.engine
            .db()
            .count_objects_with_ap_id("https://r.example/post/11")
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn announced_create_from_remote_community_is_materialized() {
    let h = harness();
    h.fetch.put(group("r.example", "news"));
    h.fetch.put(person("r.example", "bob"));
    let news = "https://r.example/c/news";
    let bob = "https://r.example/u/bob";

    let create = activity(
        "Create",
        "https://r.example/activities/create/21",
        bob,
        page("r.example", 21, bob, news),
    );
    let announce = activity("Announce", "https://r.example/activities/announce/21", news, create);
    assert_eq!(h.engine.dispatch(&announce).await, ActivityOutcome::Success);

    let post = h
        .engine
        .db()
        .find_object_by_ap_id("https://r.example/post/21")
        .unwrap()
        .unwrap();
    let community = h.engine.db().get_actor(post.community_id).unwrap().unwrap();
    assert_eq!(community.ap_id, news);
    assert_eq!(
        h.engine
            .activity_result("https://r.example/activities/create/21")
            .unwrap()
            .unwrap()
            .result,
        ActivityOutcome::Success
    );
}

#[tokio::test]
async fn state_survives_restart() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    let create = activity(
        "Create",
        "https://r.example/activities/create/31",
        bob,
        page("r.example", 31, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);

    let reopened = open_engine(
        config(),
        h.dir.path(),
        Arc::new(FakeFetch::default()),
        Arc::new(RecordingTransport::default()),
    );
    let again = reopened
        .db()
        .find_local_actor(ActorKind::Group, "rust")
        .unwrap()
        .unwrap();
    assert_eq!(again.id, community.id);
    assert!(again.owns_keypair());
    assert_eq!(reopened.dispatch(&create).await, ActivityOutcome::Duplicate);

    let post = reopened
        .db()
        .find_object_by_ap_id("https://r.example/post/31")
        .unwrap()
        .unwrap();
    assert_eq!(post.community_id, community.id);
    let entity = reopened.resolve("https://r.example/post/31").await.unwrap();
    assert_eq!(into_object(entity).unwrap().id, post.id);
}

#[tokio::test]
async fn local_vote_and_retraction_are_federated() {
    let h = harness();
    let bob = "https://r.example/u/bob";
    let news = "https://r.example/c/news";
    h.fetch.put(group("r.example", "news"));
    h.fetch.put(person("r.example", "bob"));
    h.fetch.put(page("r.example", 41, bob, news));
    let alice = h.user("alice").await;
    let post = into_object(h.engine.resolve("https://r.example/post/41").await.unwrap()).unwrap();

    h.engine.vote(alice.id, post.id, 1).await.unwrap();
    assert_eq!(h.engine.db().get_object(post.id).unwrap().unwrap().upvotes, 1);
    h.engine.vote(alice.id, post.id, 0).await.unwrap();
    assert!(h.engine.db().get_vote(post.id, alice.id).unwrap().is_none());

    h.engine.queue().process_due_once().await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(inbox, _)| inbox == "https://r.example/inbox"));
    let like = sent.iter().map(|(_, d)| d).find(|d| d["type"] == "Like").unwrap();
    let undo = sent.iter().map(|(_, d)| d).find(|d| d["type"] == "Undo").unwrap();
    assert_eq!(like["object"], "https://r.example/post/41");
    assert_eq!(undo["object"]["id"], like["id"]);
    assert_eq!(undo["object"]["type"], "Like");
}

#[tokio::test]
async fn community_can_remove_posts_it_hosts() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    let create = activity(
        "Create",
        "https://r.example/activities/create/51",
        bob,
        page("r.example", 51, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);
    let post = h
        .engine
        .db()
        .find_object_by_ap_id("https://r.example/post/51")
        .unwrap()
        .unwrap();

    // Someone unrelated cannot delete it.
    let eve = h.remote_person("s.example", "eve").await;
    let forged = activity(
        "Delete",
        "https://s.example/activities/delete/51",
        &eve.ap_id,
        json!("https://r.example/post/51"),
    );
    assert_ne!(h.engine.dispatch(&forged).await, ActivityOutcome::Success);
    assert!(!h.engine.db().get_object(post.id).unwrap().unwrap().deleted);

    let plan = h.engine.delete_object(post.id, community.id).await.unwrap();
    assert_eq!(plan.queued, 0);
    assert!(h.engine.db().get_object(post.id).unwrap().unwrap().deleted);
}

#[tokio::test]
async fn author_delete_removes_the_post() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    let create = activity(
        "Create",
        "https://r.example/activities/create/61",
        bob,
        page("r.example", 61, bob, &community.ap_id),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);

    let delete = activity(
        "Delete",
        "https://r.example/activities/delete/61",
        bob,
        json!("https://r.example/post/61"),
    );
    assert_eq!(h.engine.dispatch(&delete).await, ActivityOutcome::Success);
    let post = h
        .engine
        .db()
        .find_object_by_ap_id("https://r.example/post/61")
        .unwrap()
        .unwrap();
    assert!(post.deleted);
}

#[tokio::test]
async fn vote_survives_target_arriving_mid_lookup() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = h.remote_person("r.example", "bob").await;
    h.remote_person("s.example", "eve").await;
    h.fetch.set_delay(Duration::from_millis(150));

    let post_uri = "https://r.example/post/70";
    let like = activity(
        "Like",
        "https://s.example/activities/like/70",
        "https://s.example/u/eve",
        json!(post_uri),
    );
    let engine = h.engine.clone();
    let vote = tokio::spawn(async move { engine.dispatch(&like).await });

    // The post lands (and finds nothing suspended) while the vote's fetch is in flight.
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.engine
        .db()
        .insert_or_fetch_object(&NewObject {
            ap_id: Some(post_uri.to_string()),
            kind: ObjectKind::Post,
            author_id: bob.id,
            community_id: community.id,
            parent_id: None,
            title: Some("Late".into()),
            body: None,
            local: false,
            published_ms: None,
        })
        .unwrap();

    assert_eq!(vote.await.unwrap(), ActivityOutcome::Success);
    let post = h.engine.db().find_object_by_ap_id(post_uri).unwrap().unwrap();
    assert_eq!(post.upvotes, 1);
    assert!(h.engine.suspense().is_empty());
}

#[tokio::test]
async fn batching_peers_get_one_announce_array() {
    let mut cfg = config();
    cfg.batch.batch_max_items = 2;
    cfg.batch.batch_flush_secs = 3600;
    let h = harness_with(cfg);
    let community = h.community("rust").await;
    let alice = h.user("alice").await;
    h.fetch.set_software("https://p.example", "PieFed");
    let reader = h.remote_person("p.example", "reader").await;
    h.engine.db().add_community_follower(community.id, reader.id, None).unwrap();

    let first = h.local_post(&alice, &community);
    let plan = h.engine.publish_object(first.id, ActivityKind::Create).await.unwrap();
    assert_eq!((plan.queued, plan.batched), (0, 1));
    assert_eq!(
        h.engine.db().count_activities(ActivityKind::Announce, Direction::Out).unwrap(),
        0
    );

    let second = h.local_post(&alice, &community);
    let plan = h.engine.publish_object(second.id, ActivityKind::Create).await.unwrap();
    assert_eq!(plan.batched, 1);

    h.engine.queue().make_all_due().unwrap();
    assert_eq!(h.engine.queue().process_due_once().await.unwrap(), 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    let (inbox, doc) = &sent[0];
    assert!(inbox.starts_with("https://p.example/"));
    assert_eq!(doc["type"], "Announce");
    let items = doc["object"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|a| a["type"] == "Create"));
    assert_eq!(
        h.engine.db().count_activities(ActivityKind::Announce, Direction::Out).unwrap(),
        1
    );
}

fn note(id: &str, author: &str, in_reply_to: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "Note",
        "attributedTo": author,
        "content": "<p>reply</p>",
        "inReplyTo": in_reply_to,
        "to": [federa_protocol::AS_PUBLIC],
    })
}

#[tokio::test]
async fn reply_pulls_in_its_parent_first() {
    let h = harness();
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    h.fetch.put(page("r.example", 80, bob, &community.ap_id));

    let post_uri = "https://r.example/post/80";
    let reply_uri = "https://r.example/comment/81";
    let create = activity(
        "Create",
        "https://r.example/activities/create/81",
        bob,
        note(reply_uri, bob, post_uri),
    );
    assert_eq!(h.engine.dispatch(&create).await, ActivityOutcome::Success);

    let post = h.engine.db().find_object_by_ap_id(post_uri).unwrap().unwrap();
    let reply = h.engine.db().find_object_by_ap_id(reply_uri).unwrap().unwrap();
    assert_eq!(post.kind, ObjectKind::Post);
    assert_eq!(reply.kind, ObjectKind::Reply);
    assert_eq!(reply.parent_id, Some(post.id));
    assert_eq!(reply.community_id, community.id);
    assert_eq!(h.fetch.fetch_count(post_uri), 1);
}

#[tokio::test]
async fn reply_cycle_ends_in_not_found() {
    let h = harness();
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    let a = "https://r.example/comment/90";
    let b = "https://r.example/comment/91";
    h.fetch.put(note(a, bob, b));
    h.fetch.put(note(b, bob, a));

    let err = h.engine.resolve(a).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(h.engine.db().count_objects_with_ap_id(a).unwrap(), 0);
    assert_eq!(h.engine.db().count_objects_with_ap_id(b).unwrap(), 0);
    assert_eq!(h.fetch.fetch_count(a), 1);
    assert_eq!(h.fetch.fetch_count(b), 1);
}

#[tokio::test]
async fn reply_chain_deeper_than_the_limit_is_not_found() {
    let mut cfg = config();
    cfg.resolve_max_depth = 3;
    let h = harness_with(cfg);
    let community = h.community("rust").await;
    let bob = "https://r.example/u/bob";
    h.fetch.put(person("r.example", "bob"));
    h.fetch.put(page("r.example", 100, bob, &community.ap_id));
    let mut parent = "https://r.example/post/100".to_string();
    for n in 101..=106 {
        let id = format!("https://r.example/comment/{n}");
        h.fetch.put(note(&id, bob, &parent));
        parent = id;
    }

    let err = h.engine.resolve(&parent).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(h.engine.db().count_objects_with_ap_id(&parent).unwrap(), 0);
    assert_eq!(h.fetch.fetch_count("https://r.example/post/100"), 0);
}
