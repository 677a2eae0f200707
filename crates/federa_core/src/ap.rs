/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! HTTP surface: inboxes, local actor documents and the activity result query.

use crate::engine::{FederationEngine, INSTANCE_ACTOR_NAME};
use crate::error::FederationError;
use crate::store::ActorKind;
use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};
use federa_protocol::ACTIVITY_JSON;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ApState {
    pub engine: FederationEngine,
    pub max_body_bytes: usize,
}

impl ApState {
    pub fn new(engine: FederationEngine) -> Self {
        let max_body_bytes = engine.config().max_body_bytes;
        Self { engine, max_body_bytes }
    }
}

pub fn router(state: ApState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

enum ActorRoute<'a> {
    Document(ActorKind, &'a str),
    Inbox(ActorKind, &'a str),
}

/// `/u/{name}`, `/c/{name}` and their `/inbox`.
fn actor_route(path: &str) -> Option<ActorRoute<'_>> {
    let (kind, rest) = if let Some(rest) = path.strip_prefix("/u/") {
        (ActorKind::Person, rest)
    } else if let Some(rest) = path.strip_prefix("/c/") {
        (ActorKind::Group, rest)
    } else {
        return None;
    };
    match rest.split_once('/') {
        None if !rest.is_empty() => Some(ActorRoute::Document(kind, rest)),
        Some((name, "inbox")) if !name.is_empty() => Some(ActorRoute::Inbox(kind, name)),
        _ => None,
    }
}

pub async fn handle_request(state: &ApState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let resp = match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => simple(StatusCode::OK, "ok"),
        ("GET", "/readyz") => readyz_get(state),
        ("GET", "/activities/result") => activity_result_get(state, &req),
        ("GET", "/actor") => actor_get(state, ActorKind::Application, INSTANCE_ACTOR_NAME),
        ("GET", "/inbox") => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        ("POST", "/inbox") => inbox(state, req, None).await,
        (method, p) => match (method, actor_route(p)) {
            ("GET", Some(ActorRoute::Document(kind, name))) => actor_get(state, kind, name),
            ("POST", Some(ActorRoute::Inbox(kind, name))) => inbox(state, req, Some((kind, name))).await,
            ("GET", Some(ActorRoute::Inbox(..))) => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            _ => simple(StatusCode::NOT_FOUND, "not found"),
        },
    };
    add_security_headers(resp)
}

fn readyz_get(state: &ApState) -> Response<Body> {
    if state.engine.db().health_check().is_ok() {
        simple(StatusCode::OK, "ready")
    } else {
        simple(StatusCode::SERVICE_UNAVAILABLE, "db not ready")
    }
}

fn add_security_headers(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers.entry("X-Content-Type-Options").or_insert(HeaderValue::from_static("nosniff"));
    headers.entry("X-Frame-Options").or_insert(HeaderValue::from_static("DENY"));
    headers.entry("Referrer-Policy").or_insert(HeaderValue::from_static("no-referrer"));
    resp
}

async fn inbox(state: &ApState, req: Request<Body>, target: Option<(ActorKind, &str)>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::PAYLOAD_TOO_LARGE, "body too large"),
    };

    if let Some((kind, name)) = target {
        match state.engine.db().find_local_actor(kind, name) {
            Ok(Some(a)) if !a.deleted => {}
            Ok(_) => return simple(StatusCode::NOT_FOUND, "not found"),
            Err(e) => {
                debug!("inbox actor lookup failed: {e:#}");
                return simple(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }
    }

    let signer = match state
        .engine
        .verify_request(&parts.method, &parts.uri, &parts.headers, &body_bytes)
        .await
    {
        Ok(a) => a,
        Err(FederationError::Blocked(domain)) => {
            info!(domain, "inbox request from blocked instance");
            return simple(StatusCode::FORBIDDEN, "blocked");
        }
        Err(FederationError::Internal(e)) => {
            debug!("inbox verification failed internally: {e:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
        Err(e) => {
            debug!("inbox signature rejected: {e}");
            return simple(StatusCode::UNAUTHORIZED, &e.to_string());
        }
    };

    let activity: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };

    // Processing may fetch from other instances; the sender only needs to know we have it.
    let engine = state.engine.clone();
    tokio::spawn(async move {
        let outcome = engine.dispatch_signed(&activity, &signer).await;
        debug!(
            activity_id = activity.get("id").and_then(serde_json::Value::as_str).unwrap_or_default(),
            outcome = outcome.as_str(),
            "inbox activity processed"
        );
    });
    simple(StatusCode::NO_CONTENT, "")
}

fn activity_result_get(state: &ApState, req: &Request<Body>) -> Response<Body> {
    let Some(id) = query_param(req.uri().query().unwrap_or(""), "id") else {
        return simple(StatusCode::BAD_REQUEST, "missing id");
    };
    match state.engine.activity_result(&id) {
        Ok(Some(result)) => axum::Json(result).into_response(),
        Ok(None) => simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            debug!("activity result lookup failed: {e:#}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn actor_get(state: &ApState, kind: ActorKind, name: &str) -> Response<Body> {
    match state.engine.db().find_local_actor(kind, name) {
        Ok(Some(actor)) if !actor.deleted => {
            let doc = state.engine.factory().actor_document(&actor);
            let body = serde_json::to_vec(&doc).unwrap_or_default();
            let mut resp = Response::new(Body::from(body));
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
            resp
        }
        Ok(_) => simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            debug!("actor lookup failed: {e:#}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k != key {
            return None;
        }
        let v = v.replace('+', " ");
        urlencoding::decode(&v)
            .ok()
            .map(|s| s.into_owned())
            .filter(|s| !s.trim().is_empty())
    })
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}
