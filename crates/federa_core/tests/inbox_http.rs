/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use common::*;
use federa_core::ap::{self, ApState};
use federa_core::http_sig::{sign_request_rsa_sha256, POST_SIGNED_HEADERS};
use federa_protocol::{ActivityOutcome, ActivityResultResponse, ACTIVITY_JSON};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

fn app(h: &Harness) -> axum::Router {
    ap::router(ApState::new(h.engine.clone()))
}

fn signed_post(path: &str, key_id: &str, body: &Value) -> Request<Body> {
    signed_post_covering(path, key_id, body, POST_SIGNED_HEADERS)
}

fn signed_post_covering(path: &str, key_id: &str, body: &Value, covered: &[&str]) -> Request<Body> {
    let body = serde_json::to_vec(body).unwrap();
    let uri: Uri = format!("https://{LOCAL_DOMAIN}{path}").parse().unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", ACTIVITY_JSON.parse().unwrap());
    sign_request_rsa_sha256(
        &keys().private_key_pem,
        key_id,
        &Method::POST,
        &uri,
        &mut headers,
        &body,
        covered,
    )
    .unwrap();
    let mut req = Request::post(path).body(Body::from(body)).unwrap();
    *req.headers_mut() = headers;
    req
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_result(h: &Harness, id: &str) -> ActivityResultResponse {
    for _ in 0..200 {
        if let Some(r) = h.engine.activity_result(id).unwrap() {
            return r;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} was never processed");
}

#[tokio::test]
async fn actor_document_is_served() {
    let h = harness();
    let community = h.community("rust").await;

    let resp = app(&h)
        .oneshot(Request::get("/c/rust").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["X-Content-Type-Options"], "nosniff");
    let doc = body_json(resp).await;
    assert_eq!(doc["type"], "Group");
    assert_eq!(doc["id"], community.ap_id.as_str());
    assert_eq!(doc["publicKey"]["id"], format!("{}#main-key", community.ap_id));
    assert_eq!(doc["endpoints"]["sharedInbox"], "https://l.example/inbox");

    let missing = app(&h)
        .oneshot(Request::get("/c/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unsigned_post_is_rejected() {
    let h = harness();
    h.community("rust").await;
    let follow = activity(
        "Follow",
        "https://r.example/activities/follow/1",
        "https://r.example/u/bob",
        json!("https://l.example/c/rust"),
    );
    let req = Request::post("/c/rust/inbox")
        .header("Content-Type", ACTIVITY_JSON)
        .body(Body::from(serde_json::to_vec(&follow).unwrap()))
        .unwrap();
    let resp = app(&h).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(h
        .engine
        .activity_result("https://r.example/activities/follow/1")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn signed_follow_is_accepted_and_queryable() {
    let h = harness();
    let community = h.community("rust").await;
    h.fetch.put(person("r.example", "bob"));
    let bob = "https://r.example/u/bob";
    let follow_id = "https://r.example/activities/follow/2";
    let follow = activity("Follow", follow_id, bob, json!(community.ap_id));

    let resp = app(&h)
        .oneshot(signed_post("/c/rust/inbox", &format!("{bob}#main-key"), &follow))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let result = wait_for_result(&h, follow_id).await;
    assert_eq!(result.result, ActivityOutcome::Success);
    let bob = h.engine.db().find_actor_by_ap_id(bob).unwrap().unwrap();
    assert!(h.engine.db().is_community_follower(community.id, bob.id).unwrap());

    let query = format!("/activities/result?id={}", urlencoding::encode(follow_id));
    let resp = app(&h)
        .oneshot(Request::get(query.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = body_json(resp).await;
    assert_eq!(doc["id"], follow_id);
    assert_eq!(doc["result"], "success");
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let h = harness();
    h.community("rust").await;
    h.fetch.put(person("r.example", "bob"));
    let bob = "https://r.example/u/bob";
    let follow = activity(
        "Follow",
        "https://r.example/activities/follow/3",
        bob,
        json!("https://l.example/c/rust"),
    );
    let signed = signed_post("/c/rust/inbox", &format!("{bob}#main-key"), &follow);
    let (parts, _) = signed.into_parts();
    let mut other = follow.clone();
    other["object"] = json!("https://l.example/c/other");
    let req = Request::from_parts(parts, Body::from(serde_json::to_vec(&other).unwrap()));

    let resp = app(&h).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signature_must_cover_target_and_digest() {
    let h = harness();
    h.community("rust").await;
    h.fetch.put(person("r.example", "bob"));
    let bob = "https://r.example/u/bob";
    let key_id = format!("{bob}#main-key");

    // Valid over `date` alone; the Digest header matches the forged body but is not signed.
    let forged = activity(
        "Follow",
        "https://r.example/activities/follow/5",
        bob,
        json!("https://l.example/c/rust"),
    );
    let resp = app(&h)
        .oneshot(signed_post_covering("/c/rust/inbox", &key_id, &forged, &["date"]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let no_digest = activity(
        "Follow",
        "https://r.example/activities/follow/6",
        bob,
        json!("https://l.example/c/rust"),
    );
    let resp = app(&h)
        .oneshot(signed_post_covering(
            "/c/rust/inbox",
            &key_id,
            &no_digest,
            &["(request-target)", "host", "date"],
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h
        .engine
        .activity_result("https://r.example/activities/follow/5")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn blocked_instance_gets_forbidden() {
    let h = harness();
    h.community("rust").await;
    h.fetch.put(person("r.example", "bob"));
    h.engine.block_instance("r.example").unwrap();
    let bob = "https://r.example/u/bob";
    let follow = activity(
        "Follow",
        "https://r.example/activities/follow/4",
        bob,
        json!("https://l.example/c/rust"),
    );

    let resp = app(&h)
        .oneshot(signed_post("/inbox", &format!("{bob}#main-key"), &follow))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn inbox_routes() {
    let h = harness();
    let resp = app(&h)
        .oneshot(Request::get("/inbox").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let resp = app(&h)
        .oneshot(Request::post("/c/nope/inbox").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app(&h)
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app(&h)
        .oneshot(
            Request::get("/activities/result?id=https%3A%2F%2Fr.example%2Funknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
