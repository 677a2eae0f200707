/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-instance delivery health.
//!
//! [`InstanceHealth`] is a plain value with pure transition functions; [`HealthTracker`] is
//! the only thing that persists transitions. Outbound writes come from the delivery worker
//! after each completed attempt, inbound revivals from signature verification.

use crate::events::{EngineEvent, EventBus, EventKind};
use crate::store::{now_ms, FederationDb};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Online,
    Dormant,
    GoneForever,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before an instance turns dormant.
    pub dormant_after_failures: u32,
    /// Further consecutive failures, counted from dormancy, before it is gone for good.
    pub gone_after_dormant_failures: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dormant_after_failures: 3,
            gone_after_dormant_failures: 8,
            base_backoff_secs: 60,
            max_backoff_secs: 7 * 24 * 3600,
        }
    }
}

impl HealthConfig {
    pub fn backoff(&self, failures: u32) -> Duration {
        let pow = failures.saturating_sub(1).min(30);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << pow)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceHealth {
    pub failures: u32,
    pub dormant: bool,
    pub gone_forever: bool,
    pub last_successful_send_ms: Option<i64>,
    pub last_attempt_ms: Option<i64>,
    pub start_trying_again_ms: Option<i64>,
}

impl InstanceHealth {
    pub fn state(&self) -> HealthState {
        if self.gone_forever {
            HealthState::GoneForever
        } else if self.dormant {
            HealthState::Dormant
        } else {
            HealthState::Online
        }
    }

    fn backoff_elapsed(&self, now_ms: i64) -> bool {
        self.start_trying_again_ms.map(|t| now_ms >= t).unwrap_or(true)
    }

    /// Whether normal fan-out may target this instance right now. No side effects.
    pub fn is_deliverable(&self, now_ms: i64) -> bool {
        match self.state() {
            HealthState::Online => true,
            HealthState::Dormant => self.backoff_elapsed(now_ms),
            HealthState::GoneForever => false,
        }
    }

    pub fn on_failure(&self, now_ms: i64, cfg: &HealthConfig) -> Self {
        let failures = self.failures.saturating_add(1);
        let dormant_at = cfg.dormant_after_failures.max(1);
        let gone_at = dormant_at.saturating_add(cfg.gone_after_dormant_failures.max(1));
        let gone_forever = self.gone_forever || failures >= gone_at;
        let dormant = gone_forever || self.dormant || failures >= dormant_at;
        let backoff_ms = i64::try_from(cfg.backoff(failures).as_millis()).unwrap_or(i64::MAX);
        Self {
            failures,
            dormant,
            gone_forever,
            last_successful_send_ms: self.last_successful_send_ms,
            last_attempt_ms: Some(now_ms),
            start_trying_again_ms: Some(now_ms.saturating_add(backoff_ms)),
        }
    }

    /// A delivery succeeded. Degraded instances only recover once their backoff deadline
    /// has passed; an early success just refreshes the timestamps.
    pub fn on_success(&self, now_ms: i64) -> Self {
        let mut next = self.clone();
        next.last_attempt_ms = Some(now_ms);
        next.last_successful_send_ms = Some(now_ms);
        let recover = match self.state() {
            HealthState::Online => true,
            HealthState::Dormant | HealthState::GoneForever => self.backoff_elapsed(now_ms),
        };
        if recover {
            next.failures = 0;
            next.dormant = false;
            next.gone_forever = false;
            next.start_trying_again_ms = None;
        }
        next
    }

    /// The instance talked to us with a valid signature, or an operator revived it.
    pub fn revived(&self) -> Self {
        Self {
            failures: 0,
            dormant: false,
            gone_forever: false,
            last_successful_send_ms: self.last_successful_send_ms,
            last_attempt_ms: self.last_attempt_ms,
            start_trying_again_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Failure,
}

#[derive(Clone)]
pub struct HealthTracker {
    db: FederationDb,
    cfg: HealthConfig,
    events: Option<EventBus>,
}

impl HealthTracker {
    pub fn new(db: FederationDb, cfg: HealthConfig) -> Self {
        Self {
            db,
            cfg,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn state_changed(&self, domain: &str) {
        if let Some(events) = &self.events {
            events.emit(EngineEvent::new(EventKind::InstanceHealthChanged).instance(domain));
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    /// Unknown instances are deliverable.
    pub fn is_deliverable(&self, domain: &str) -> Result<bool> {
        Ok(self
            .db
            .get_instance(domain)?
            .map(|i| i.health.is_deliverable(now_ms()))
            .unwrap_or(true))
    }

    pub fn state(&self, domain: &str) -> Result<HealthState> {
        Ok(self
            .db
            .get_instance(domain)?
            .map(|i| i.health.state())
            .unwrap_or(HealthState::Online))
    }

    pub fn record_attempt(&self, domain: &str, result: AttemptResult) -> Result<InstanceHealth> {
        self.record_attempt_at(domain, result, now_ms())
    }

    pub fn record_attempt_at(
        &self,
        domain: &str,
        result: AttemptResult,
        now: i64,
    ) -> Result<InstanceHealth> {
        let cfg = self.cfg.clone();
        let (before, after) = self.db.update_instance_health(domain, |h| match result {
            AttemptResult::Success => h.on_success(now),
            AttemptResult::Failure => h.on_failure(now, &cfg),
        })?;
        if before.state() != after.state() {
            info!(
                domain,
                from = ?before.state(),
                to = ?after.state(),
                failures = after.failures,
                "instance health changed"
            );
            self.state_changed(domain);
        }
        Ok(after)
    }

    pub fn record_inbound_success(&self, domain: &str) -> Result<()> {
        let (before, _) = self.db.update_instance_health(domain, |h| {
            if h.state() == HealthState::Online && h.failures == 0 {
                h.clone()
            } else {
                h.revived()
            }
        })?;
        if before.state() != HealthState::Online {
            info!(domain, from = ?before.state(), "instance revived by inbound activity");
            self.state_changed(domain);
        }
        self.db.touch_instance_seen(domain)?;
        Ok(())
    }

    /// Operator action: put an instance back into rotation.
    pub fn mark_online(&self, domain: &str) -> Result<()> {
        self.db.update_instance_health(domain, |h| h.revived())?;
        info!(domain, "instance marked online by operator");
        Ok(())
    }
}
