use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use tracing::{info, warn};
use uuid::Uuid;

use civic_db::models::ConsentUpdate;
use civic_types::api::{ApiResponse, Claims, ConsentRequest, ConsentResponse};
use civic_types::events::LiveEvent;
use civic_types::models::ConsentState;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::{JsonBody, PathParam};
use crate::issues::{find_issue, parse_consent};
use crate::permissions::Actor;
use crate::run_db;

/// Push the `PENDING` request to the reporter's live connections.
/// The record itself is written by the merge transaction.
pub async fn notify_request(state: &AppState, reporter_id: Uuid, issue_id: Uuid) {
    let delivered = state
        .connections
        .emit(reporter_id, LiveEvent::IssueConsentRequest { issue_id })
        .await;
    info!(
        "Consent requested from {} for issue {} ({} live connection(s))",
        reporter_id, issue_id, delivered
    );
}

/// Consent state of `user_id` for `issue_id`. Anyone but the issue's
/// reporter is outside the state machine and reads `None`.
pub async fn status(state: &AppState, issue_id: Uuid, user_id: Uuid) -> Result<ConsentState, ApiError> {
    let issue = find_issue(state, issue_id).await?;
    if issue.reporter_id != user_id {
        return Ok(ConsentState::None);
    }

    let row = run_db(state, move |db| db.get_consent(&issue_id.to_string())).await?;
    Ok(parse_consent(row.as_ref().map(|r| r.state.as_str()))?)
}

/// Answer a pending request. Only the reporter may answer; repeating the
/// same answer is a no-op, answering the other way afterwards conflicts.
pub async fn respond(state: &AppState, actor: &Actor, issue_id: Uuid, accept: bool) -> Result<ConsentState, ApiError> {
    let issue = find_issue(state, issue_id).await?;
    if issue.reporter_id != actor.id {
        warn!(
            "{} ({}) tried to answer consent for issue {} reported by {}",
            actor.username, actor.id, issue_id, issue.reporter_id
        );
        return Err(ApiError::Authorization(
            "only the original reporter can answer this request".into(),
        ));
    }

    let target = ConsentState::from_answer(accept);
    let iid = issue_id.to_string();
    let update = run_db(state, move |db| db.update_consent(&iid, target.as_str())).await?;

    match update {
        ConsentUpdate::Applied => {
            info!("{} ({}) {} consent for issue {}", actor.username, actor.id, target, issue_id);
            state
                .connections
                .emit(actor.id, LiveEvent::IssueConsentUpdated { issue_id, consent: accept })
                .await;
            Ok(target)
        }
        ConsentUpdate::Unchanged => Ok(target),
        ConsentUpdate::AlreadyDecided(current) => Err(ApiError::Conflict(format!(
            "consent for issue {} was already {}",
            issue_id, current
        ))),
        ConsentUpdate::Missing => Err(ApiError::Validation(format!(
            "issue {} has no consent request",
            issue_id
        ))),
    }
}

pub async fn pending_for(state: &AppState, user_id: Uuid) -> Result<Vec<Uuid>, ApiError> {
    let ids = run_db(state, move |db| db.pending_consents_for(&user_id.to_string())).await?;
    let ids = ids
        .iter()
        .map(|id| id.parse::<Uuid>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(anyhow::Error::from)?;
    Ok(ids)
}

/// POST /issues/{issue_id}/consent
pub async fn respond_to_consent(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(claims): Extension<Claims>,
    JsonBody(req): JsonBody<ConsentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let consent = respond(&state, &Actor::from(&claims), issue_id, req.accept).await?;
    Ok(Json(ApiResponse::ok(ConsentResponse { issue_id, state: consent })))
}

/// GET /issues/{issue_id}/consent
pub async fn get_consent(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let consent = status(&state, issue_id, claims.sub).await?;
    Ok(Json(ApiResponse::ok(ConsentResponse { issue_id, state: consent })))
}

/// GET /consent/pending
pub async fn list_pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = pending_for(&state, claims.sub).await?;
    Ok(Json(ApiResponse::ok(ids)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::{create, merge};
    use crate::testing::{TestEnv, citizen, official};

    #[tokio::test]
    async fn merge_opens_pending_and_notifies_reporter() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let mayor = official(&env, "mayor");
        let mut ana_rx = env.connect(&ana).await;

        let i1 = create(&env.state, &ana, "I1", "").await.unwrap();
        let i2 = create(&env.state, &mayor, "I2", "").await.unwrap();
        assert_eq!(status(&env.state, i1.id, ana.id).await.unwrap(), ConsentState::None);

        merge(&env.state, &mayor, i1.id, i2.id).await.unwrap();

        assert_eq!(status(&env.state, i1.id, ana.id).await.unwrap(), ConsentState::Pending);
        assert_eq!(status(&env.state, i1.id, mayor.id).await.unwrap(), ConsentState::None);
        assert_eq!(pending_for(&env.state, ana.id).await.unwrap(), vec![i1.id]);
        assert_eq!(
            ana_rx.try_recv().unwrap(),
            LiveEvent::IssueConsentRequest { issue_id: i1.id }
        );
    }

    #[tokio::test]
    async fn accept_twice_is_idempotent() {
        let env = TestEnv::new();
        let (ana, i1) = env.merged_citizen_issue("ana").await;
        let mut ana_rx = env.connect(&ana).await;

        assert_eq!(respond(&env.state, &ana, i1, true).await.unwrap(), ConsentState::Granted);
        assert_eq!(respond(&env.state, &ana, i1, true).await.unwrap(), ConsentState::Granted);

        assert_eq!(
            ana_rx.try_recv().unwrap(),
            LiveEvent::IssueConsentUpdated { issue_id: i1, consent: true }
        );
        assert!(ana_rx.try_recv().is_err(), "second accept must not re-notify");
        assert!(pending_for(&env.state, ana.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_answer_after_decline_fails() {
        let env = TestEnv::new();
        let (ana, i1) = env.merged_citizen_issue("ana").await;

        assert_eq!(respond(&env.state, &ana, i1, false).await.unwrap(), ConsentState::Denied);
        let err = respond(&env.state, &ana, i1, true).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(status(&env.state, i1, ana.id).await.unwrap(), ConsentState::Denied);
    }

    #[tokio::test]
    async fn only_the_reporter_can_answer() {
        let env = TestEnv::new();
        let (_ana, i1) = env.merged_citizen_issue("ana").await;
        let eve = citizen(&env, "eve");
        let mayor = official(&env, "mayor2");

        assert!(matches!(respond(&env.state, &eve, i1, true).await, Err(ApiError::Authorization(_))));
        assert!(matches!(respond(&env.state, &mayor, i1, true).await, Err(ApiError::Authorization(_))));
    }

    #[tokio::test]
    async fn answering_without_request_or_issue() {
        let env = TestEnv::new();
        let ana = citizen(&env, "ana");
        let issue = create(&env.state, &ana, "Unmerged", "").await.unwrap();

        assert!(matches!(respond(&env.state, &ana, issue.id, true).await, Err(ApiError::Validation(_))));
        assert!(matches!(
            respond(&env.state, &ana, Uuid::new_v4(), true).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_duplicate_accepts_notify_once() {
        let env = TestEnv::new();
        let (ana, i1) = env.merged_citizen_issue("ana").await;
        let mut ana_rx = env.connect(&ana).await;

        let (a, b) = tokio::join!(
            respond(&env.state, &ana, i1, true),
            respond(&env.state, &ana, i1, true)
        );
        assert_eq!(a.unwrap(), ConsentState::Granted);
        assert_eq!(b.unwrap(), ConsentState::Granted);

        assert!(ana_rx.try_recv().is_ok());
        assert!(ana_rx.try_recv().is_err());
    }
}
