use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, Role};

/// Events pushed FROM server TO client over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum LiveEvent {
    /// Server confirms the connection is authenticated and registered
    Ready {
        user_id: Uuid,
        username: String,
        role: Role,
    },

    /// An issue reported by the recipient was merged; they must decide
    IssueConsentRequest { issue_id: Uuid },

    /// The recipient's own consent decision was recorded
    IssueConsentUpdated { issue_id: Uuid, consent: bool },

    /// A new message is available in a thread the recipient can read
    IssueChatMessage { issue_id: Uuid, message: ChatMessage },
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::IssueConsentRequest { .. } => "issueConsentRequest",
            Self::IssueConsentUpdated { .. } => "issueConsentUpdated",
            Self::IssueChatMessage { .. } => "issueChatMessage",
        }
    }
}

/// Commands sent FROM client TO server over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum LiveCommand {
    /// Re-associate this connection with the user. Only a correlation hint:
    /// it must match the identity proven by the handshake token.
    RegisterUser(Uuid),
}
