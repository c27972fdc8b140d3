use std::collections::BTreeSet;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civic_db::models::ChatMessageRow;
use civic_db::parse_timestamp;
use civic_types::api::{ApiResponse, Claims, Pagination, SendChatRequest};
use civic_types::events::LiveEvent;
use civic_types::models::{ChatMessage, DenialReason, PermissionResult};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::{JsonBody, PathParam, QueryParams};
use crate::permissions::{Actor, can_read, can_write, require_access};
use crate::run_db;

pub const MAX_MESSAGE_LEN: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(rename = "pageSize")]
    pub page_size: Option<u32>,
}

fn default_page() -> u32 {
    1
}

pub fn message_from_row(row: ChatMessageRow) -> anyhow::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.id.parse()?,
        issue_id: row.issue_id.parse()?,
        author_id: row.author_id.parse()?,
        author_name: row.author_username,
        author_role: row.author_role.parse().map_err(anyhow::Error::msg)?,
        body: row.body,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

/// Append a message to the thread of `issue_id` and push it to every
/// government user and every thread member, once per user.
///
/// Nothing is stored or emitted when validation or the write check fails.
pub async fn post_message(
    state: &AppState,
    actor: &Actor,
    issue_id: Uuid,
    body: &str,
) -> Result<ChatMessage, ApiError> {
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(ApiError::Validation("message cannot be empty".into()));
    }
    if body.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::Validation(format!(
            "message exceeds {} characters",
            MAX_MESSAGE_LEN
        )));
    }

    let access = require_access(state, issue_id).await?;
    if let PermissionResult::Denied(reason) = can_write(actor, &access) {
        warn!(
            "{} ({}) denied writing to issue {}: {}",
            actor.username, actor.id, issue_id, reason
        );
        return Err(reason.into());
    }

    let message_id = Uuid::new_v4();
    let thread_id = access.thread_id;
    let mid = message_id.to_string();
    let tid = thread_id.to_string();
    let aid = actor.id.to_string();
    let stored_body = body.clone();
    let (created_at, government) = run_db(state, move |db| {
        let created_at = db.insert_chat_message(&mid, &tid, &aid, &stored_body, Utc::now())?;
        let government = db.government_user_ids()?;
        Ok((created_at, government))
    })
    .await?;

    let message = ChatMessage {
        id: message_id,
        issue_id: thread_id,
        author_id: actor.id,
        author_name: actor.username.clone(),
        author_role: actor.role,
        body,
        created_at: parse_timestamp(&created_at)?,
    };

    let mut recipients: BTreeSet<Uuid> = access.member_ids();
    for id in &government {
        recipients.insert(id.parse().map_err(anyhow::Error::from)?);
    }

    let event = LiveEvent::IssueChatMessage {
        issue_id: thread_id,
        message: message.clone(),
    };
    let mut delivered = 0;
    for user_id in &recipients {
        delivered += state.connections.emit(*user_id, event.clone()).await;
    }

    info!(
        "{} ({}) posted {} to thread {} via issue {}",
        actor.username, actor.id, message_id, thread_id, issue_id
    );
    debug!(
        "Fanned out {} to {} user(s), {} connection(s)",
        message_id,
        recipients.len(),
        delivered
    );

    Ok(message)
}

/// One page of the thread's history. Page 1 holds the newest messages;
/// each page is ordered oldest to newest.
pub async fn get_messages_page(
    state: &AppState,
    actor: &Actor,
    issue_id: Uuid,
    page: u32,
    page_size: Option<u32>,
) -> Result<(Vec<ChatMessage>, Pagination), ApiError> {
    if page == 0 {
        return Err(ApiError::Validation("page starts at 1".into()));
    }
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let access = require_access(state, issue_id).await?;
    if !can_read(actor, &access) {
        return Err(DenialReason::NotParticipant.into());
    }

    let tid = access.thread_id.to_string();
    let offset = u64::from(page - 1) * u64::from(page_size);
    let (total, rows) = run_db(state, move |db| {
        let total = db.count_chat_messages(&tid)?;
        let rows = db.get_chat_page(&tid, page_size, offset)?;
        Ok((total, rows))
    })
    .await?;

    let messages = rows
        .into_iter()
        .map(message_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let total_pages = total.div_ceil(u64::from(page_size));
    let pagination = Pagination {
        page,
        page_size,
        total_pages: u32::try_from(total_pages).unwrap_or(u32::MAX),
    };

    Ok((messages, pagination))
}

/// POST /issues/{issue_id}/chat
pub async fn send_message(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    Extension(claims): Extension<Claims>,
    JsonBody(req): JsonBody<SendChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = post_message(&state, &Actor::from(&claims), issue_id, &req.message).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

/// GET /issues/{issue_id}/chat?page=&pageSize=
pub async fn get_messages(
    State(state): State<AppState>,
    PathParam(issue_id): PathParam<Uuid>,
    QueryParams(query): QueryParams<ChatQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (messages, pagination) =
        get_messages_page(&state, &Actor::from(&claims), issue_id, query.page, query.page_size).await?;
    Ok(Json(ApiResponse::paginated(messages, pagination)))
}
