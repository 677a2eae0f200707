/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::FederationError;
use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, POST_SIGNED_HEADERS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use federa_protocol::ACTIVITY_JSON;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::time::Duration;
use tracing::debug;

/// Key material an outgoing POST is signed with.
#[derive(Clone)]
pub struct Signer {
    pub key_id: String,
    pub private_key_pem: String,
}

/// Result of one completed delivery attempt, as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// 429, 5xx, timeouts, connection failures. Worth retrying later.
    Transient(String),
    /// Any other 4xx. The peer understood and refused; never retried.
    Rejected { status: u16, reason: String },
}

impl AttemptOutcome {
    /// The error a failed attempt stands for; `None` once delivered.
    pub fn to_error(&self) -> Option<FederationError> {
        match self {
            Self::Delivered => None,
            Self::Transient(why) => Some(FederationError::TransientDelivery(why.clone())),
            Self::Rejected { status, reason } => Some(FederationError::PermanentRejection {
                status: *status,
                reason: reason.clone(),
            }),
        }
    }
}

pub fn classify_status(status: StatusCode, body_hint: &str) -> AttemptOutcome {
    if status.is_success() {
        return AttemptOutcome::Delivered;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return AttemptOutcome::Transient(format!("status {status}"));
    }
    let mut reason: String = body_hint.trim().chars().take(256).collect();
    if reason.is_empty() {
        reason = status.canonical_reason().unwrap_or("rejected").to_string();
    }
    AttemptOutcome::Rejected {
        status: status.as_u16(),
        reason,
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_activity(&self, signer: &Signer, inbox: &str, body: Bytes) -> AttemptOutcome;
}

/// Signed HTTP POST to ActivityPub inboxes.
#[derive(Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
    attempts: u32,
}

impl HttpDelivery {
    pub fn new(timeout: Duration, attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("federa/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build delivery client")?;
        Ok(Self { client, attempts })
    }

    async fn deliver_json(&self, signer: &Signer, inbox_url: &str, body: Bytes) -> Result<reqwest::Response> {
        let uri: Uri = inbox_url.parse().context("parse inbox url")?;

        let mut headers = HeaderMap::new();
        headers.insert("Accept", ACTIVITY_JSON.parse().context("accept header")?);
        headers.insert("Content-Type", ACTIVITY_JSON.parse().context("content-type header")?);

        sign_request_rsa_sha256(
            &signer.private_key_pem,
            &signer.key_id,
            &Method::POST,
            &uri,
            &mut headers,
            &body,
            POST_SIGNED_HEADERS,
        )?;

        send_with_retry(
            || {
                self.client
                    .post(inbox_url)
                    .headers(headers.clone())
                    .body(body.clone())
            },
            self.attempts,
        )
        .await
    }
}

#[async_trait]
impl Transport for HttpDelivery {
    async fn post_activity(&self, signer: &Signer, inbox: &str, body: Bytes) -> AttemptOutcome {
        match self.deliver_json(signer, inbox, body).await {
            Ok(resp) => {
                let status = resp.status();
                let hint = if status.is_client_error() {
                    resp.text().await.unwrap_or_default()
                } else {
                    String::new()
                };
                let outcome = classify_status(status, &hint);
                debug!(inbox, %status, "delivery attempt");
                outcome
            }
            Err(e) => AttemptOutcome::Transient(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_sig::tests::test_keypair;
    use wiremock::{
        matchers::{header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn signer() -> Signer {
        Signer {
            key_id: "https://local.example/c/rust#main-key".to_string(),
            private_key_pem: test_keypair().0.clone(),
        }
    }

    #[test]
    fn long_rejection_body_is_cut_on_char_boundary() {
        let body = format!("a{}", "é".repeat(300));
        match classify_status(StatusCode::BAD_REQUEST, &body) {
            AttemptOutcome::Rejected { status, reason } => {
                assert_eq!(status, 400);
                assert_eq!(reason.chars().count(), 256);
                assert!(reason.starts_with("aé"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn rejection_maps_to_permanent_error() {
        let rejected = classify_status(StatusCode::GONE, "account suspended");
        match rejected.to_error() {
            Some(FederationError::PermanentRejection { status, reason }) => {
                assert_eq!(status, 410);
                assert_eq!(reason, "account suspended");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            AttemptOutcome::Transient("timeout".into()).to_error(),
            Some(FederationError::TransientDelivery(_))
        ));
        assert!(AttemptOutcome::Delivered.to_error().is_none());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::ACCEPTED, ""), AttemptOutcome::Delivered);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            AttemptOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            AttemptOutcome::Transient(_)
        ));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, ""),
            AttemptOutcome::Rejected {
                status: 403,
                reason: "Forbidden".to_string()
            }
        );
    }

    #[tokio::test]
    async fn posts_signed_activity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inbox"))
            .and(header("Content-Type", ACTIVITY_JSON))
            .and(header_exists("Digest"))
            .and(header_exists("Signature"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let d = HttpDelivery::new(Duration::from_secs(5), 1).unwrap();
        let out = d
            .post_activity(&signer(), &format!("{}/inbox", server.uri()), Bytes::from_static(b"{}"))
            .await;
        assert_eq!(out, AttemptOutcome::Delivered);
    }

    #[tokio::test]
    async fn rejection_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inbox"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown community"))
            .mount(&server)
            .await;

        let d = HttpDelivery::new(Duration::from_secs(5), 1).unwrap();
        let out = d
            .post_activity(&signer(), &format!("{}/inbox", server.uri()), Bytes::from_static(b"{}"))
            .await;
        assert_eq!(
            out,
            AttemptOutcome::Rejected {
                status: 400,
                reason: "unknown community".to_string()
            }
        );
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let d = HttpDelivery::new(Duration::from_millis(100), 1).unwrap();
        let out = d
            .post_activity(&signer(), &format!("{}/inbox", server.uri()), Bytes::from_static(b"{}"))
            .await;
        assert!(matches!(out, AttemptOutcome::Transient(_)));
    }
}
