/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound request authentication.

use crate::error::{FedResult, FederationError};
use crate::health::HealthTracker;
use crate::http_sig::{
    build_signing_string, parse_signature_header, require_covered_headers, verify_date, verify_digest, verify_signature_rsa_sha256,
};
use crate::resolver::{ResolveContext, Resolver};
use crate::store::{domain_of, Actor, FederationDb};
use http::{HeaderMap, Method, Uri};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RequestVerifier {
    db: FederationDb,
    resolver: Resolver,
    health: HealthTracker,
    max_skew: Duration,
}

impl RequestVerifier {
    pub fn new(db: FederationDb, resolver: Resolver, health: HealthTracker, max_skew: Duration) -> Self {
        Self {
            db,
            resolver,
            health,
            max_skew,
        }
    }

    /// Authenticate an inbound POST and return the signing actor.
    ///
    /// The signer's instance is marked alive on success, which revives dormant instances.
    pub async fn verify_request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> FedResult<Actor> {
        verify_digest(headers, body).map_err(|e| FederationError::signature(format!("digest invalid: {e}")))?;
        verify_date(headers, self.max_skew).map_err(|e| FederationError::signature(format!("date invalid: {e}")))?;

        let sig_header = headers
            .get("Signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FederationError::signature("missing Signature header"))?;
        let sig = parse_signature_header(sig_header)
            .map_err(|e| FederationError::signature(format!("bad Signature: {e}")))?;
        require_covered_headers(&sig.headers, !body.is_empty())
            .map_err(|e| FederationError::signature(e.to_string()))?;
        let signing_string = build_signing_string(method, uri, headers, &sig.headers)
            .map_err(|e| FederationError::signature(format!("bad signed headers: {e}")))?;

        let owner = sig.actor_uri().to_string();
        let domain = domain_of(&owner).ok_or_else(|| FederationError::signature(format!("bad keyId {}", sig.key_id)))?;
        if self.db.is_instance_blocked(&domain)? {
            return Err(FederationError::Blocked(domain));
        }

        let actor = match self.db.find_actor_by_ap_id(&owner)? {
            Some(a) => a,
            None => {
                let mut ctx = ResolveContext::new(true);
                self.resolver
                    .resolve_actor(&owner, &mut ctx)
                    .await
                    .map_err(|e| FederationError::signature(format!("key resolve failed: {e}")))?
            }
        };
        if actor.deleted {
            return Err(FederationError::signature(format!("{} is deleted", actor.ap_id)));
        }
        if actor.key_id() != sig.key_id {
            return Err(FederationError::signature(format!(
                "keyId {} does not belong to {}",
                sig.key_id, actor.ap_id
            )));
        }
        let pem = actor
            .public_key_pem
            .as_deref()
            .ok_or_else(|| FederationError::signature(format!("{} has no public key", actor.ap_id)))?;
        verify_signature_rsa_sha256(pem, &signing_string, &sig.signature)
            .map_err(|e| FederationError::signature(format!("signature invalid: {e}")))?;

        debug!(actor = actor.ap_id, "request signature verified");
        if let Err(e) = self.health.record_inbound_success(&actor.domain) {
            warn!(domain = actor.domain, "record inbound health failed: {e:#}");
        }
        Ok(actor)
    }
}
