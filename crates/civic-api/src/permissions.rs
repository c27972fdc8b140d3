use std::collections::BTreeSet;

use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use uuid::Uuid;

use civic_db::Database;
use civic_types::api::{ApiResponse, Claims, PermissionsResponse};
use civic_types::models::{ConsentState, DenialReason, Issue, PermissionResult, Role};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::PathParam;
use crate::issues::{issue_from_row, parse_consent};
use crate::run_db;

/// Merge targets are flattened on write; the hop limit only guards
/// against corrupt data.
const MAX_MERGE_HOPS: usize = 16;

/// The authenticated caller, as seen by the resolver.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl From<&Claims> for Actor {
    fn from(claims: &Claims) -> Self {
        Self {
            id: claims.sub,
            username: claims.username.clone(),
            role: claims.role,
        }
    }
}

/// One reporter taking part in a thread, with the consent state of the
/// issue they reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub issue_id: Uuid,
    pub reporter_id: Uuid,
    pub consent: ConsentState,
}

/// Everything the resolver needs to decide access to an addressed issue.
#[derive(Debug, Clone)]
pub struct ThreadAccess {
    /// The issue the caller addressed.
    pub issue: Issue,
    /// The canonical issue whose log holds the discussion.
    pub thread_id: Uuid,
    /// The thread's own reporter first, then every merged issue's reporter.
    pub members: Vec<Member>,
    /// The addressed issue's own consent record.
    pub issue_consent: ConsentState,
}

impl ThreadAccess {
    /// Consent state of the addressed issue's reporter, read from the
    /// issue's own record rather than from the member list.
    pub fn addressed_consent(&self) -> ConsentState {
        self.issue_consent
    }

    pub fn member_ids(&self) -> BTreeSet<Uuid> {
        self.members.iter().map(|m| m.reporter_id).collect()
    }
}

pub fn can_read(actor: &Actor, access: &ThreadAccess) -> bool {
    actor.role.is_government()
        || actor.id == access.issue.reporter_id
        || access.members.iter().any(|m| m.reporter_id == actor.id)
}

pub fn can_write(actor: &Actor, access: &ThreadAccess) -> PermissionResult {
    if actor.role.is_government() {
        return PermissionResult::Allowed;
    }

    // The reporter of the addressed issue is decided by that issue alone.
    if actor.id == access.issue.reporter_id {
        return from_consent(access.addressed_consent());
    }

    let mut best: Option<PermissionResult> = None;
    for member in access.members.iter().filter(|m| m.reporter_id == actor.id) {
        let result = from_consent(member.consent);
        if result.is_allowed() {
            return result;
        }
        if best.is_none() || result == PermissionResult::Denied(DenialReason::ConsentPending) {
            best = Some(result);
        }
    }

    best.unwrap_or(PermissionResult::Denied(DenialReason::NotParticipant))
}

fn from_consent(consent: ConsentState) -> PermissionResult {
    match consent {
        ConsentState::None | ConsentState::Granted => PermissionResult::Allowed,
        ConsentState::Pending => PermissionResult::Denied(DenialReason::ConsentPending),
        ConsentState::Denied => PermissionResult::Denied(DenialReason::ConsentDeclined),
    }
}

/// Load the addressed issue, resolve its thread and collect the thread's
/// members. `None` if the issue does not exist.
pub fn load_access(db: &Database, issue_id: Uuid) -> anyhow::Result<Option<ThreadAccess>> {
    let Some(row) = db.get_issue(&issue_id.to_string())? else {
        return Ok(None);
    };
    let issue = issue_from_row(row)?;
    let record = db.get_consent(&issue_id.to_string())?;
    let issue_consent = parse_consent(record.as_ref().map(|r| r.state.as_str()))?;

    let mut thread = issue.clone();
    for _ in 0..MAX_MERGE_HOPS {
        let Some(next) = thread.canonical_issue_id else { break };
        match db.get_issue(&next.to_string())? {
            Some(row) => thread = issue_from_row(row)?,
            None => anyhow::bail!("issue {} points at missing canonical issue {}", thread.id, next),
        }
    }
    if thread.canonical_issue_id.is_some() {
        anyhow::bail!("merge chain from issue {} exceeds {} hops", issue.id, MAX_MERGE_HOPS);
    }

    let mut members = vec![Member {
        issue_id: thread.id,
        reporter_id: thread.reporter_id,
        consent: ConsentState::None,
    }];
    for row in db.get_merged_members(&thread.id.to_string())? {
        members.push(Member {
            issue_id: row.issue_id.parse()?,
            reporter_id: row.reporter_id.parse()?,
            consent: parse_consent(row.consent_state.as_deref())?,
        });
    }

    Ok(Some(ThreadAccess {
        issue,
        thread_id: thread.id,
        members,
        issue_consent,
    }))
}

/// Load access facts or fail with `NotFound`.
pub async fn require_access(state: &AppState, issue_id: Uuid) -> Result<ThreadAccess, ApiError> {
    run_db(state, move |db| load_access(db, issue_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("issue {}", issue_id)))
}

/// GET /issues/{issue_id}/permissions: UI hint only; writes re-check.
pub async fn get_permissions(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = Actor::from(&claims);
    let access = require_access(&state, issue_id).await?;
    let write = can_write(&actor, &access);

    Ok(Json(ApiResponse::ok(PermissionsResponse {
        can_read: can_read(&actor, &access),
        can_write: write.is_allowed(),
        reason: write.reason(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn actor(role: Role) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            username: "someone".into(),
            role,
        }
    }

    fn issue(reporter_id: Uuid, canonical: Option<Uuid>) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            reporter_id,
            title: "Streetlight out".into(),
            description: String::new(),
            status: "open".into(),
            canonical_issue_id: canonical,
            created_at: Utc::now(),
        }
    }

    /// An unmerged issue reported by `reporter`.
    fn standalone(reporter: &Actor) -> ThreadAccess {
        let issue = issue(reporter.id, None);
        ThreadAccess {
            thread_id: issue.id,
            members: vec![Member {
                issue_id: issue.id,
                reporter_id: reporter.id,
                consent: ConsentState::None,
            }],
            issue,
            issue_consent: ConsentState::None,
        }
    }

    /// `reporter`'s issue merged into a canonical issue owned by `owner`.
    fn merged(reporter: &Actor, owner: &Actor, consent: ConsentState) -> ThreadAccess {
        let canonical = issue(owner.id, None);
        let duplicate = issue(reporter.id, Some(canonical.id));
        ThreadAccess {
            thread_id: canonical.id,
            members: vec![
                Member { issue_id: canonical.id, reporter_id: owner.id, consent: ConsentState::None },
                Member { issue_id: duplicate.id, reporter_id: reporter.id, consent },
            ],
            issue: duplicate,
            issue_consent: consent,
        }
    }

    #[test]
    fn unmerged_reporter_reads_and_writes_stranger_cannot_write() {
        let reporter = actor(Role::Citizen);
        let stranger = actor(Role::Citizen);
        let access = standalone(&reporter);

        assert!(can_read(&reporter, &access));
        assert_eq!(can_write(&reporter, &access), PermissionResult::Allowed);
        assert_eq!(
            can_write(&stranger, &access),
            PermissionResult::Denied(DenialReason::NotParticipant)
        );
        assert!(!can_read(&stranger, &access));
    }

    #[test]
    fn government_always_writes() {
        let official = actor(Role::Government);
        let reporter = actor(Role::Citizen);
        let owner = actor(Role::Citizen);
        for consent in [ConsentState::Pending, ConsentState::Granted, ConsentState::Denied] {
            let access = merged(&reporter, &owner, consent);
            assert!(can_read(&official, &access));
            assert_eq!(can_write(&official, &access), PermissionResult::Allowed);
        }
    }

    #[test]
    fn merged_reporter_follows_consent() {
        let reporter = actor(Role::Citizen);
        let owner = actor(Role::Citizen);

        let pending = merged(&reporter, &owner, ConsentState::Pending);
        assert_eq!(
            can_write(&reporter, &pending),
            PermissionResult::Denied(DenialReason::ConsentPending)
        );
        assert!(can_read(&reporter, &pending));

        let granted = merged(&reporter, &owner, ConsentState::Granted);
        assert_eq!(can_write(&reporter, &granted), PermissionResult::Allowed);

        let declined = merged(&reporter, &owner, ConsentState::Denied);
        assert_eq!(
            can_write(&reporter, &declined),
            PermissionResult::Denied(DenialReason::ConsentDeclined)
        );
        assert!(can_read(&reporter, &declined));
    }

    #[test]
    fn canonical_owner_keeps_writing_through_duplicate_address() {
        let reporter = actor(Role::Citizen);
        let owner = actor(Role::Citizen);
        let access = merged(&reporter, &owner, ConsentState::Pending);

        assert!(can_read(&owner, &access));
        assert_eq!(can_write(&owner, &access), PermissionResult::Allowed);
    }

    #[test]
    fn reporter_is_judged_by_own_record_even_if_missing_from_members() {
        let reporter = actor(Role::Citizen);
        let owner = actor(Role::Citizen);
        let mut access = merged(&reporter, &owner, ConsentState::Pending);
        access.members.retain(|m| m.reporter_id != reporter.id);

        assert_eq!(
            can_write(&reporter, &access),
            PermissionResult::Denied(DenialReason::ConsentPending)
        );
        assert!(can_read(&reporter, &access));
    }

    #[test]
    fn addressed_consent_defaults_to_none() {
        let reporter = actor(Role::Citizen);
        let access = standalone(&reporter);
        assert_eq!(access.addressed_consent(), ConsentState::None);
        assert_eq!(access.member_ids().len(), 1);
    }
}
