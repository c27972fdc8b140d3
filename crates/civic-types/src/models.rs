use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Government,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Citizen => "citizen",
            Self::Government => "government",
        }
    }

    pub fn is_government(self) -> bool {
        matches!(self, Self::Government)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "citizen" => Ok(Self::Citizen),
            "government" => Ok(Self::Government),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Consent of an issue's original reporter to join the merged discussion.
///
/// `None` is the explicit pre-merge state: no record exists and the
/// reporter may write to their own issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    None,
    Pending,
    Granted,
    Denied,
}

impl ConsentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }

    /// `Granted` and `Denied` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Granted | Self::Denied)
    }

    pub fn from_answer(accept: bool) -> Self {
        if accept { Self::Granted } else { Self::Denied }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown consent state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: Uuid,
    pub reporter_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub canonical_issue_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A chat message. `issue_id` is the thread the message lives in, which is
/// the canonical issue when the addressed issue was merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_role: Role,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Why a user may not write to an issue's chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DenialReason {
    ConsentPending,
    ConsentDeclined,
    NotParticipant,
}

impl DenialReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::ConsentPending => "waiting for your consent to join the merged discussion",
            Self::ConsentDeclined => "you declined to join the merged discussion",
            Self::NotParticipant => "you are not a participant of this issue",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Result of a write-permission check, recomputed on every write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Allowed,
    Denied(DenialReason),
}

impl PermissionResult {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(self) -> Option<DenialReason> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(reason),
        }
    }
}
