/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{FedResult, FederationError};
use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, GET_SIGNED_HEADERS};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use federa_protocol::ACCEPT_ACTIVITY;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Remote documents larger than this are refused.
const MAX_DOCUMENT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareInfo {
    pub name: String,
    pub version: Option<String>,
}

/// Network side of resolution. 404/410 surface as [`FederationError::NotFound`].
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    async fn fetch_json(&self, uri: &str) -> FedResult<Value>;

    /// NodeInfo software of the instance serving `origin` (`scheme://authority`).
    async fn fetch_software(&self, origin: &str) -> FedResult<Option<SoftwareInfo>>;
}

#[derive(Clone)]
pub struct SignedFetchConfig {
    pub private_key_pem: String,
    pub key_id: String,
}

/// Authorized-fetch capable GET client, signing with the instance actor key.
#[derive(Clone)]
pub struct SignedFetcher {
    http: reqwest::Client,
    signed: SignedFetchConfig,
    attempts: u32,
}

impl SignedFetcher {
    pub fn new(http: reqwest::Client, signed: SignedFetchConfig) -> Self {
        Self {
            http,
            signed,
            attempts: 2,
        }
    }

    pub fn with_timeout(signed: SignedFetchConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("federa/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self::new(http, signed))
    }

    async fn get(&self, url: &str, accept: &str) -> FedResult<reqwest::Response> {
        let uri: Uri = url
            .parse()
            .map_err(|_| FederationError::malformed(format!("bad uri: {url}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            accept.parse().map_err(|_| anyhow!("bad accept header"))?,
        );
        sign_request_rsa_sha256(
            &self.signed.private_key_pem,
            &self.signed.key_id,
            &Method::GET,
            &uri,
            &mut headers,
            &[],
            GET_SIGNED_HEADERS,
        )?;
        let resp = send_with_retry(|| self.http.get(url).headers(headers.clone()), self.attempts)
            .await
            .map_err(|e| FederationError::TransientDelivery(format!("fetch {url}: {e:#}")))?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(FederationError::not_found(format!("{url} answered {}", resp.status())))
            }
            s => Err(anyhow!("fetch {url}: status {s}").into()),
        }
    }

    async fn get_json(&self, url: &str, accept: &str) -> FedResult<Value> {
        let resp = self.get(url, accept).await?;
        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_DOCUMENT_BYTES)
        {
            return Err(anyhow!("document too large: {url}").into());
        }
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("read body of {url}"))?;
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(anyhow!("document too large: {url}").into());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| FederationError::malformed(format!("{url}: invalid json: {e}")))
    }
}

#[async_trait]
impl RemoteFetch for SignedFetcher {
    async fn fetch_json(&self, uri: &str) -> FedResult<Value> {
        debug!(uri, "signed fetch");
        self.get_json(uri, ACCEPT_ACTIVITY).await
    }

    async fn fetch_software(&self, origin: &str) -> FedResult<Option<SoftwareInfo>> {
        let origin = origin.trim_end_matches('/');
        let index = self
            .get_json(&format!("{origin}/.well-known/nodeinfo"), "application/json")
            .await?;
        let Some(href) = pick_nodeinfo_href(&index) else {
            return Ok(None);
        };
        let doc = self.get_json(&href, "application/json").await?;
        Ok(software_from_nodeinfo(&doc))
    }
}

#[derive(Deserialize)]
struct NodeInfoIndex {
    #[serde(default)]
    links: Vec<NodeInfoLink>,
}

#[derive(Deserialize)]
struct NodeInfoLink {
    rel: String,
    href: String,
}

/// Newest 2.x schema advertised in a `/.well-known/nodeinfo` index.
fn pick_nodeinfo_href(index: &Value) -> Option<String> {
    let index: NodeInfoIndex = serde_json::from_value(index.clone()).ok()?;
    index
        .links
        .into_iter()
        .filter(|l| l.rel.contains("nodeinfo.diaspora.software/ns/schema/2."))
        .max_by(|a, b| a.rel.cmp(&b.rel))
        .map(|l| l.href)
}

fn software_from_nodeinfo(doc: &Value) -> Option<SoftwareInfo> {
    let sw = doc.get("software")?;
    let name = sw.get("name")?.as_str()?.trim().to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    Some(SoftwareInfo {
        name,
        version: sw.get("version").and_then(Value::as_str).map(str::to_string),
    })
}
