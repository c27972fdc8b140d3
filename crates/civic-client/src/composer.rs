use civic_types::api::PermissionsResponse;
use civic_types::models::{ConsentState, DenialReason, PermissionResult, Role};

/// Whether the message input should be enabled. A display hint only; the
/// server re-checks every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerState {
    Enabled,
    Disabled(DenialReason),
}

impl ComposerState {
    pub fn from_permissions(permissions: &PermissionsResponse) -> Self {
        match (permissions.can_write, permissions.reason) {
            (true, _) => Self::Enabled,
            (false, Some(reason)) => Self::Disabled(reason),
            (false, None) => Self::Disabled(DenialReason::NotParticipant),
        }
    }

    /// Local estimate for the reporter of an issue, from the role and the
    /// cached consent state.
    pub fn for_reporter(role: Role, consent: ConsentState) -> Self {
        if role.is_government() {
            return Self::Enabled;
        }
        match consent {
            ConsentState::None | ConsentState::Granted => Self::Enabled,
            ConsentState::Pending => Self::Disabled(DenialReason::ConsentPending),
            ConsentState::Denied => Self::Disabled(DenialReason::ConsentDeclined),
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }

    /// Text shown in place of the input.
    pub fn placeholder(self) -> &'static str {
        match self {
            Self::Enabled => "Write a message",
            Self::Disabled(reason) => reason.message(),
        }
    }
}

impl From<PermissionResult> for ComposerState {
    fn from(result: PermissionResult) -> Self {
        match result {
            PermissionResult::Allowed => Self::Enabled,
            PermissionResult::Denied(reason) => Self::Disabled(reason),
        }
    }
}
