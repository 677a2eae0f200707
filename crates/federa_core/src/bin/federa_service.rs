/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use federa_core::ap::{self, ApState};
use federa_core::config::{default_config_path, load_config};
use federa_core::delivery::HttpDelivery;
use federa_core::engine::FederationEngine;
use federa_core::keys::load_or_generate_instance_key;
use federa_core::object_fetch::{SignedFetchConfig, SignedFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    default_config_path()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok();

    let cfg_path = parse_config_path()?;
    info!("federa service starting");
    info!("config: {}", cfg_path.display());
    let cfg = load_config(&cfg_path)?;

    let data_dir = cfg.data_dir()?;
    let instance_key = load_or_generate_instance_key(&data_dir)?;
    let timeout = Duration::from_secs(cfg.queue.delivery_timeout_secs.max(1));
    let fetcher = SignedFetcher::with_timeout(
        SignedFetchConfig {
            private_key_pem: instance_key.private_key_pem.clone(),
            key_id: format!("{}#main-key", cfg.instance_actor_uri()),
        },
        timeout,
    )?;
    let transport = HttpDelivery::new(timeout, cfg.queue.http_attempts)?;
    let bind = cfg.bind.clone();

    let engine = FederationEngine::open(
        cfg,
        data_dir.join("federa.db"),
        Arc::new(fetcher),
        Arc::new(transport),
    )?;
    engine.ensure_instance_actor(instance_key).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.start_workers(shutdown_rx.clone());

    let router = ap::router(ApState::new(engine));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!("listening on {bind}");

    let mut server_shutdown = shutdown_rx;
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    });
    let server = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = server.await.context("join server")? {
        warn!("server error: {e}");
    }
    for w in workers {
        if let Err(e) = w.await {
            warn!("worker join failed: {e}");
        }
    }
    info!("federa service stopped");
    Ok(())
}
