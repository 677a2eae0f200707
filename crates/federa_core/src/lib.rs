/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Federation engine of a threaded discussion platform speaking ActivityPub.

pub mod activities;
pub mod actors;
pub mod ap;
pub mod archivist;
pub mod batch;
pub mod config;
pub mod delivery;
pub mod delivery_queue;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod http_retry;
pub mod http_sig;
pub mod keys;
pub mod maintenance;
pub mod object_fetch;
pub mod outbound;
pub mod resolver;
pub mod store;
pub mod suspense;
pub mod votes;

pub use config::EngineConfig;
pub use engine::FederationEngine;
pub use error::{FedResult, FederationError};
pub use events::{EngineEvent, EventKind};
pub use outbound::{DeliveryPlan, Destination};
pub use resolver::{Entity, ExpectedType};
