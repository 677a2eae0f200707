/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Draft-cavage HTTP signatures (rsa-sha256) as spoken by the fediverse.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};

/// Headers covered by our own signatures on POST.
pub const POST_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date", "digest", "content-type"];
/// Headers covered by our own signatures on GET.
pub const GET_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date"];

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

impl SignatureParams {
    /// Actor URI the key belongs to, by convention the key id without its fragment.
    pub fn actor_uri(&self) -> &str {
        self.key_id.split_once('#').map(|(a, _)| a).unwrap_or(&self.key_id)
    }
}

pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    // keyId="...",headers="(request-target) host date",signature="base64..."
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_string(), v.to_string());
    }

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing signature"))?;
    let algorithm = map.get("algorithm").cloned();
    if let Some(alg) = algorithm.as_deref() {
        if !matches!(alg.to_ascii_lowercase().as_str(), "rsa-sha256" | "hs2019") {
            return Err(anyhow!("unsupported signature algorithm: {alg}"));
        }
    }

    let signature = B64
        .decode(signature_b64.as_bytes())
        .context("decode signature")?;

    Ok(SignatureParams {
        key_id,
        algorithm,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let path = uri.path();
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(path);
            out.push_str(&query);
            continue;
        }

        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

/// A request with a body must carry a matching SHA-256 `Digest`.
pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        if body.is_empty() {
            return Ok(());
        }
        return Err(anyhow!("missing Digest header"));
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    // Several algorithms may be listed; SHA-256 is the one we check.
    for entry in digest.split(',') {
        let Some((alg, value)) = entry.trim().split_once('=') else {
            continue;
        };
        if alg.trim().eq_ignore_ascii_case("SHA-256") {
            let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
            let actual = Sha256::digest(body);
            if expected.as_slice() != actual.as_slice() {
                return Err(anyhow!("digest mismatch"));
            }
            return Ok(());
        }
    }
    Err(anyhow!("unsupported digest: {digest}"))
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

/// Reject signatures that leave the target, host, date or (for a body) digest unsigned.
pub fn require_covered_headers(signed_headers: &[String], has_body: bool) -> Result<()> {
    let covers = |name: &str| signed_headers.iter().any(|h| h.eq_ignore_ascii_case(name));
    for required in ["(request-target)", "host", "date"] {
        if !covers(required) {
            return Err(anyhow!("signature does not cover {required}"));
        }
    }
    if has_body && !covers("digest") {
        return Err(anyhow!("signature does not cover digest"));
    }
    Ok(())
}

/// Peers publish either SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM.
pub fn parse_public_key_pem(public_key_pem: &str) -> Result<RsaPublicKey> {
    let pem = public_key_pem.trim();
    if pem.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(pem).context("parse pkcs1 public key pem");
    }
    RsaPublicKey::from_public_key_pem(pem).context("parse public key pem")
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = parse_public_key_pem(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let signed_headers_lower: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    let want_digest = signed_headers_lower.iter().any(|h| h == "digest") || !body.is_empty();
    if want_digest && !headers.contains_key("Digest") {
        let digest_b64 = B64.encode(Sha256::digest(body));
        headers.insert(
            "Digest",
            format!("SHA-256={digest_b64}")
                .parse()
                .context("set Digest")?,
        );
    }

    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    // Only sign headers that are actually present (a GET has no content-type).
    let signed_headers_lower: Vec<String> = signed_headers_lower
        .into_iter()
        .filter(|h| h == "(request-target)" || headers.contains_key(h.as_str()))
        .collect();
    let signing_string = build_signing_string(method, uri, headers, &signed_headers_lower)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let sig_b64 = B64.encode(signature.to_bytes());

    let headers_list = signed_headers_lower.join(" ");
    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{headers_list}\",signature=\"{sig_b64}\""
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}
