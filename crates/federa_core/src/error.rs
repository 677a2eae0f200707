/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Failure taxonomy of the federation engine.
///
/// Only `Signature` (and `Blocked` at the inbox) ever becomes visible to a peer; everything
/// else is recovered inside the engine and ends up in the activity log or the archive.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("signature error: {0}")]
    Signature(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("ignored: {0}")]
    Ignored(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("malformed activity: {0}")]
    Malformed(String),
    #[error("transient delivery failure: {0}")]
    TransientDelivery(String),
    #[error("permanent rejection ({status}): {reason}")]
    PermanentRejection { status: u16, reason: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type FedResult<T> = std::result::Result<T, FederationError>;

impl FederationError {
    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<rusqlite::Error> for FederationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.into())
    }
}
