/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::health::HealthConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Our own authority, e.g. `discuss.example` (with port when non-default).
    pub domain: String,
    /// Public origin used to mint ids. Defaults to `https://{domain}`.
    #[serde(alias = "base_url")]
    pub public_base_url: String,
    pub bind: String,
    pub data_dir: Option<String>,
    pub max_date_skew_secs: u64,
    pub max_body_bytes: usize,
    pub resolve_max_depth: usize,
    /// Permit network fetches when a reference is not known locally.
    pub allow_remote_fetch: bool,
    /// Instance-level domain blocks seeded on start (`*.example` wildcards allowed).
    pub blocked_domains: Vec<String>,
    /// Software that accepts several announced activities in one Announce.
    pub batching_software: Vec<String>,
    /// Software that wants `Accept.object` to be the Follow id instead of the embedded Follow.
    pub accept_object_by_id_software: Vec<String>,
    pub health: HealthConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub suspense: SuspenseConfig,
    pub retention: RetentionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: "localhost:8080".to_string(),
            public_base_url: String::new(),
            bind: "127.0.0.1:8080".to_string(),
            data_dir: None,
            max_date_skew_secs: 12 * 3600,
            max_body_bytes: 1024 * 1024,
            resolve_max_depth: 16,
            allow_remote_fetch: true,
            blocked_domains: Vec::new(),
            batching_software: vec!["piefed".to_string()],
            accept_object_by_id_software: Vec::new(),
            health: HealthConfig::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            suspense: SuspenseConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn base_url(&self) -> String {
        let base = self.public_base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            format!("https://{}", self.domain.trim())
        } else {
            base.to_string()
        }
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.max_date_skew_secs)
    }

    pub fn instance_actor_uri(&self) -> String {
        format!("{}/actor", self.base_url())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(d) => Ok(PathBuf::from(d)),
            None => crate::keys::default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub delivery_timeout_secs: u64,
    /// In-request retries for one delivery attempt.
    pub http_attempts: u32,
    pub fetch_batch: u32,
    pub tick_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_secs: 10,
            max_backoff_secs: 6 * 3600,
            delivery_timeout_secs: 10,
            http_attempts: 2,
            fetch_batch: 50,
            tick_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_max_items: usize,
    pub batch_flush_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_max_items: 20,
            batch_flush_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SuspenseConfig {
    pub ttl_secs: u64,
}

impl Default for SuspenseConfig {
    fn default() -> Self {
        Self { ttl_secs: 6 * 3600 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub archive_retention_days: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archive_retention_days: 30,
            maintenance_interval_secs: 60,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_days.saturating_mul(24 * 3600))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEDERA_CONFIG") {
        return Ok(PathBuf::from(v));
    }
    Ok(crate::keys::default_data_dir()?.join("config.json"))
}

/// Missing file means defaults; a present but invalid file is an error.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<EngineConfig> {
    let cfg: EngineConfig = serde_json::from_str(text).context("parse config json")?;
    Ok(cfg)
}
