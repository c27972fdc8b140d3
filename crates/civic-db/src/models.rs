/// Database row types. These map directly to SQLite rows and stay
/// independent of the civic-types wire models.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct IssueRow {
    pub id: String,
    pub reporter_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub canonical_issue_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MergedMemberRow {
    pub issue_id: String,
    pub reporter_id: String,
    pub consent_state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsentRow {
    pub issue_id: String,
    pub state: String,
    pub created_at: String,
    pub responded_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessageRow {
    pub seq: i64,
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub author_username: String,
    pub author_role: String,
    pub body: String,
    pub created_at: String,
}

/// Outcome of a consent check-then-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentUpdate {
    /// `pending` moved to the requested state.
    Applied,
    /// Already in the requested state; nothing written.
    Unchanged,
    /// Already decided the other way; holds the stored state.
    AlreadyDecided(String),
    /// The issue has no consent record.
    Missing,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged; holds the canonical issue the source now points at.
    Merged(String),
    /// The source was already merged; nothing written.
    AlreadyMerged,
    /// The target issue does not exist.
    UnknownTarget,
    /// The target's thread is the source itself.
    Cycle,
}
