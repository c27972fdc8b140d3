use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use civic_db::models::{IssueRow, MergeOutcome};
use civic_db::parse_timestamp;
use civic_types::api::{ApiResponse, Claims, CreateIssueRequest, MergeIssueRequest};
use civic_types::models::{ConsentState, Issue, Role};

use crate::auth::AppState;
use crate::consent;
use crate::error::ApiError;
use crate::extract::{JsonBody, PathParam};
use crate::permissions::Actor;
use crate::run_db;

const MAX_TITLE_LEN: usize = 200;

pub fn issue_from_row(row: IssueRow) -> anyhow::Result<Issue> {
    Ok(Issue {
        id: row.id.parse()?,
        reporter_id: row.reporter_id.parse()?,
        title: row.title,
        description: row.description,
        status: row.status,
        canonical_issue_id: row.canonical_issue_id.as_deref().map(str::parse::<Uuid>).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

/// A missing consent record is the explicit `None` state.
pub fn parse_consent(raw: Option<&str>) -> anyhow::Result<ConsentState> {
    match raw {
        None => Ok(ConsentState::None),
        Some(raw) => raw.parse().map_err(anyhow::Error::msg),
    }
}

pub async fn find_issue(state: &AppState, issue_id: Uuid) -> Result<Issue, ApiError> {
    let row = run_db(state, move |db| db.get_issue(&issue_id.to_string()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("issue {}", issue_id)))?;
    Ok(issue_from_row(row)?)
}

pub async fn create(state: &AppState, actor: &Actor, title: &str, description: &str) -> Result<Issue, ApiError> {
    let title = title.trim().to_string();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::Validation(format!("title must be 1-{} characters", MAX_TITLE_LEN)));
    }

    let issue_id = Uuid::new_v4();
    let iid = issue_id.to_string();
    let rid = actor.id.to_string();
    let description = description.trim().to_string();
    run_db(state, move |db| db.create_issue(&iid, &rid, &title, &description)).await?;

    info!("{} ({}) reported issue {}", actor.username, actor.id, issue_id);
    find_issue(state, issue_id).await
}

/// Merge `source_id` into the thread of `target_id`. Government only.
///
/// Opens a pending consent request for a citizen reporter and pushes
/// `issueConsentRequest` to them once the merge is committed.
pub async fn merge(state: &AppState, actor: &Actor, source_id: Uuid, target_id: Uuid) -> Result<Issue, ApiError> {
    if !actor.role.is_government() {
        return Err(ApiError::Authorization("only government users can merge issues".into()));
    }
    if source_id == target_id {
        return Err(ApiError::Validation("an issue cannot be merged into itself".into()));
    }

    let source = find_issue(state, source_id).await?;
    if source.canonical_issue_id.is_some() {
        return Err(ApiError::Conflict(format!("issue {} is already merged", source_id)));
    }

    let reporter_id = source.reporter_id;
    let reporter = run_db(state, move |db| db.get_user_by_id(&reporter_id.to_string()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("issue {} has unknown reporter {}", source_id, reporter_id))?;
    let reporter_role: Role = reporter.role.parse().map_err(anyhow::Error::msg)?;
    let with_consent = !reporter_role.is_government();

    // The target's thread is resolved inside the write, so a merge that
    // lands in between cannot leave a chain or a cycle behind.
    let sid = source_id.to_string();
    let tid = target_id.to_string();
    let canonical_id = match run_db(state, move |db| db.merge_issue(&sid, &tid, with_consent)).await? {
        MergeOutcome::Merged(canonical) => canonical,
        MergeOutcome::AlreadyMerged => {
            return Err(ApiError::Conflict(format!("issue {} is already merged", source_id)));
        }
        MergeOutcome::UnknownTarget => return Err(ApiError::NotFound(format!("issue {}", target_id))),
        MergeOutcome::Cycle => return Err(ApiError::Validation("merge would create a cycle".into())),
    };

    info!(
        "{} ({}) merged issue {} into {}",
        actor.username, actor.id, source_id, canonical_id
    );

    if with_consent {
        consent::notify_request(state, reporter_id, source_id).await;
    }

    find_issue(state, source_id).await
}

pub async fn create_issue(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    JsonBody(req): JsonBody<CreateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = create(&state, &Actor::from(&claims), &req.title, &req.description).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(issue))))
}

pub async fn get_issue(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = find_issue(&state, issue_id).await?;
    Ok(Json(ApiResponse::ok(issue)))
}

pub async fn merge_issue(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(claims): Extension<Claims>,
    JsonBody(req): JsonBody<MergeIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = merge(&state, &Actor::from(&claims), issue_id, req.canonical_issue_id).await?;
    Ok(Json(ApiResponse::ok(issue)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::post_message;
    use crate::permissions::require_access;
    use crate::testing::{TestEnv, citizen, official};

    #[tokio::test]
    async fn create_trims_and_validates_title() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");

        let issue = create(&env.state, &ana, "  Pothole on Main  ", "deep").await.unwrap();
        assert_eq!(issue.title, "Pothole on Main");
        assert_eq!(issue.reporter_id, ana.id);
        assert!(issue.canonical_issue_id.is_none());

        let err = create(&env.state, &ana, "   ", "").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn only_government_merges() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let a = create(&env.state, &ana, "A", "").await.unwrap();
        let b = create(&env.state, &ana, "B", "").await.unwrap();

        let err = merge(&env.state, &ana, a.id, b.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Authorization(_)));
    }

    #[tokio::test]
    async fn merge_rejects_self_cycles_repeats_and_unknown_ids() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let mayor = official(&env, "mayor");
        let a = create(&env.state, &ana, "A", "").await.unwrap();
        let b = create(&env.state, &ana, "B", "").await.unwrap();

        assert!(matches!(merge(&env.state, &mayor, a.id, a.id).await, Err(ApiError::Validation(_))));
        assert!(matches!(
            merge(&env.state, &mayor, a.id, Uuid::new_v4()).await,
            Err(ApiError::NotFound(_))
        ));

        let merged = merge(&env.state, &mayor, a.id, b.id).await.unwrap();
        assert_eq!(merged.canonical_issue_id, Some(b.id));

        assert!(matches!(merge(&env.state, &mayor, a.id, b.id).await, Err(ApiError::Conflict(_))));
        // b's thread is b itself; merging b into a resolves to b again.
        assert!(matches!(merge(&env.state, &mayor, b.id, a.id).await, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn merge_into_duplicate_resolves_to_canonical() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let ben = citizen(&env, "ben");
        let mayor = official(&env, "mayor");
        let a = create(&env.state, &ana, "A", "").await.unwrap();
        let b = create(&env.state, &ana, "B", "").await.unwrap();
        let c = create(&env.state, &ben, "C", "").await.unwrap();

        merge(&env.state, &mayor, a.id, b.id).await.unwrap();
        let merged = merge(&env.state, &mayor, c.id, a.id).await.unwrap();
        assert_eq!(merged.canonical_issue_id, Some(b.id));
    }

    #[tokio::test]
    async fn concurrent_chained_merges_keep_consent_enforced() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let ben = citizen(&env, "ben");
        let cleo = citizen(&env, "cleo");
        let mayor = official(&env, "mayor");
        let a = create(&env.state, &ana, "A", "").await.unwrap();
        let b = create(&env.state, &ben, "B", "").await.unwrap();
        let c = create(&env.state, &cleo, "C", "").await.unwrap();

        let (first, second) = tokio::join!(
            merge(&env.state, &mayor, a.id, b.id),
            merge(&env.state, &mayor, b.id, c.id),
        );
        first.unwrap();
        second.unwrap();

        let a = find_issue(&env.state, a.id).await.unwrap();
        assert_eq!(a.canonical_issue_id, Some(c.id));

        let err = post_message(&env.state, &ana, a.id, "sneaking in").await.unwrap_err();
        assert!(matches!(err, ApiError::Authorization(_)));
        let access = require_access(&env.state, a.id).await.unwrap();
        assert_eq!(access.thread_id, c.id);
        assert!(access.member_ids().contains(&ana.id));
    }

    #[tokio::test]
    async fn crossed_merges_leave_exactly_one() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let ben = citizen(&env, "ben");
        let mayor = official(&env, "mayor");
        let a = create(&env.state, &ana, "A", "").await.unwrap();
        let b = create(&env.state, &ben, "B", "").await.unwrap();

        let (first, second) = tokio::join!(
            merge(&env.state, &mayor, a.id, b.id),
            merge(&env.state, &mayor, b.id, a.id),
        );
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);

        // Both issues still resolve to a thread.
        let thread_a = require_access(&env.state, a.id).await.unwrap().thread_id;
        let thread_b = require_access(&env.state, b.id).await.unwrap().thread_id;
        assert_eq!(thread_a, thread_b);
    }

    #[tokio::test]
    async fn merging_a_government_report_opens_no_consent() {
        let env = TestEnv::new();
        let mayor = official(&env, "mayor");
        let clerk = official(&env, "clerk");
        let a = create(&env.state, &clerk, "A", "").await.unwrap();
        let b = create(&env.state, &mayor, "B", "").await.unwrap();

        merge(&env.state, &mayor, a.id, b.id).await.unwrap();
        let state = consent::status(&env.state, a.id, clerk.id).await.unwrap();
        assert_eq!(state, ConsentState::None);
    }
}
