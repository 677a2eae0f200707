/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Activity vocabulary understood by the engine. Anything else parses as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Like,
    Dislike,
    Undo,
    Follow,
    Accept,
    Reject,
    Announce,
    Other,
}

impl ActivityKind {
    pub fn parse(ty: &str) -> Self {
        match ty.trim() {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Like" => Self::Like,
            "Dislike" => Self::Dislike,
            "Undo" => Self::Undo,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Announce" => Self::Announce,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Dislike => "Dislike",
            Self::Undo => "Undo",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Announce => "Announce",
            Self::Other => "Other",
        }
    }

    pub fn is_vote(&self) -> bool {
        matches!(self, Self::Like | Self::Dislike)
    }
}

/// Terminal processing result of an activity, as recorded in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityOutcome {
    Success,
    Duplicate,
    Ignored,
    Failure,
}

impl ActivityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Failure => "failure",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "success" => Some(Self::Success),
            "duplicate" => Some(Self::Duplicate),
            "ignored" => Some(Self::Ignored),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Body of the activity result query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityResultResponse {
    pub id: String,
    pub result: ActivityOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}
