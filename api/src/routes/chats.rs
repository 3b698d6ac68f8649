use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatguard_core::chat::{Chat, ChatView, Message};
use chatguard_core::healer::HealReport;
use chatguard_core::turn::{ModerationVerdict, TurnInput, TurnReply};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{CallerIdentity, OperatorAuth};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

const MAX_CONTENT_CHARS: usize = 32_000;
const MAX_TITLE_CHARS: usize = 200;
const MAX_TOOL_CALL_ID_CHARS: usize = 128;

/// Routes called on behalf of end users (rate limited as chat writes).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chats", post(create_chat))
        .route("/v1/chats/{id}", get(get_chat))
        .route("/v1/chats/{id}/turns", post(post_turn))
        .route("/v1/chats/{id}/tool-responses", post(post_tool_response))
        .route("/v1/chats/{id}/integrity", post(check_integrity))
}

/// Operator-only chat routes.
pub fn operator_router() -> Router<AppState> {
    Router::new().route("/v1/chats/{id}/repair", post(repair_chat))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TurnRequest {
    pub content: String,
    /// Moderation classification of `content`, when the upstream moderation
    /// service produced one
    #[serde(default)]
    pub moderation: Option<ModerationVerdict>,
}

/// Names the answered call by exactly one of `tool_call_id` (the provider's
/// correlation id) or `call_id` (the call's `id` in chat views).
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ToolResponseRequest {
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<Uuid>,
    pub content: String,
}

fn validate_text(field: &str, value: &str, max_chars: usize) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation {
            message: format!("{field} must not be empty"),
            field: Some(field.to_string()),
            received: None,
            docs_hint: None,
        });
    }
    let chars = value.chars().count();
    if chars > max_chars {
        return Err(AppError::Validation {
            message: format!("{field} exceeds {max_chars} characters"),
            field: Some(field.to_string()),
            received: Some(serde_json::json!({ "length": chars })),
            docs_hint: None,
        });
    }
    Ok(())
}

/// The chat if it exists and belongs to the caller. Someone else's chat is
/// reported as missing.
async fn load_owned(
    state: &AppState,
    chat_id: Uuid,
    caller: CallerIdentity,
) -> Result<Chat, AppError> {
    match state.stores.chats.get(chat_id).await? {
        Some(chat)
            if chat.owner_id == caller.user_id
                && chat.organization_id == caller.organization_id =>
        {
            Ok(chat)
        }
        _ => Err(AppError::NotFound {
            resource: "chat",
            id: chat_id.to_string(),
        }),
    }
}

/// Start a new chat for the caller
#[utoipa::path(
    post,
    path = "/v1/chats",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created", body = ChatView),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "End user, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "chats"
)]
pub async fn create_chat(
    State(state): State<AppState>,
    caller: CallerIdentity,
    AppJson(req): AppJson<CreateChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let title = match req.title {
        Some(title) => {
            validate_text("title", &title, MAX_TITLE_CHARS)?;
            Some(title.trim().to_string())
        }
        None => None,
    };

    let mut chat = Chat::new(caller.user_id, caller.organization_id);
    chat.title = title;
    state.stores.chats.create(&chat).await?;
    tracing::info!(chat_id = %chat.id, user_id = %caller.user_id, "chat created");

    Ok((StatusCode::CREATED, Json(ChatView::from(&chat))))
}

/// Fetch a chat with its messages
#[utoipa::path(
    get,
    path = "/v1/chats/{id}",
    responses(
        (status = 200, description = "The chat", body = ChatView),
        (status = 404, description = "No such chat for this caller", body = chatguard_core::error::ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Chat id"),
        ("x-user-id" = Uuid, Header, description = "End user, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "chats"
)]
pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    caller: CallerIdentity,
) -> Result<Json<ChatView>, AppError> {
    let chat = load_owned(&state, chat_id, caller).await?;
    Ok(Json(ChatView::from(&chat)))
}

/// Process one user turn
///
/// Records the moderation verdict, makes sure the chat is structurally sound
/// (repairing or forking it if needed), calls the provider through the
/// circuit breaker and appends the user and assistant messages together.
/// The `outcome` field says what to show the user.
#[utoipa::path(
    post,
    path = "/v1/chats/{id}/turns",
    request_body = TurnRequest,
    responses(
        (status = 200, description = "Turn outcome", body = TurnReply),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError),
        (status = 404, description = "No such chat for this caller", body = chatguard_core::error::ApiError),
        (status = 409, description = "Conversation changed concurrently", body = chatguard_core::error::ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Chat id"),
        ("x-user-id" = Uuid, Header, description = "End user, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "chats"
)]
pub async fn post_turn(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    caller: CallerIdentity,
    AppJson(req): AppJson<TurnRequest>,
) -> Result<Response, AppError> {
    validate_text("content", &req.content, MAX_CONTENT_CHARS)?;
    if let Some(verdict) = &req.moderation {
        validate_text("moderation.violation_type", &verdict.violation_type, 100)?;
    }
    load_owned(&state, chat_id, caller).await?;

    let reply = state
        .turns
        .process_turn(TurnInput {
            chat_id,
            user_id: caller.user_id,
            content: req.content,
            moderation: req.moderation,
        })
        .await?;

    let retry_after = match &reply {
        TurnReply::RetryLater {
            retry_after_secs, ..
        } => *retry_after_secs,
        _ => None,
    };
    let mut response = Json(reply).into_response();
    if let Some(secs) = retry_after
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        response.headers_mut().insert("retry-after", value);
    }
    Ok(response)
}

/// Append the result of a tool call
///
/// The response must answer a tool call issued earlier in the chat that has
/// not been answered yet and whose turn is still open. Anything else is
/// rejected without being stored.
#[utoipa::path(
    post,
    path = "/v1/chats/{id}/tool-responses",
    request_body = ToolResponseRequest,
    responses(
        (status = 201, description = "Tool response stored", body = Message),
        (status = 400, description = "Unknown, duplicate or late tool response", body = chatguard_core::error::ApiError),
        (status = 404, description = "No such chat for this caller", body = chatguard_core::error::ApiError),
        (status = 409, description = "Chat archived or moved", body = chatguard_core::error::ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Chat id"),
        ("x-user-id" = Uuid, Header, description = "End user, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "chats"
)]
pub async fn post_tool_response(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    caller: CallerIdentity,
    AppJson(req): AppJson<ToolResponseRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation {
            message: format!("content exceeds {MAX_CONTENT_CHARS} characters"),
            field: Some("content".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    let chat = load_owned(&state, chat_id, caller).await?;
    let tool_call_id = match (req.tool_call_id, req.call_id) {
        (Some(tool_call_id), None) => {
            validate_text("tool_call_id", &tool_call_id, MAX_TOOL_CALL_ID_CHARS)?;
            tool_call_id.trim().to_string()
        }
        (None, Some(call_id)) => chat
            .messages
            .iter()
            .flat_map(|m| &m.tool_calls)
            .find(|call| call.id == call_id)
            .map(|call| call.tool_call_id.clone())
            .ok_or_else(|| AppError::Validation {
                message: "call_id does not match a tool call in this chat.".to_string(),
                field: Some("call_id".to_string()),
                received: None,
                docs_hint: None,
            })?,
        _ => {
            return Err(AppError::Validation {
                message: "Exactly one of tool_call_id or call_id is required.".to_string(),
                field: None,
                received: None,
                docs_hint: Some(
                    "Use call_id from the tool call in the turn reply, or the provider's tool_call_id."
                        .to_string(),
                ),
            });
        }
    };

    let message = state
        .turns
        .append_tool_response(chat_id, &tool_call_id, req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Validate the chat and heal it if needed
///
/// Returns `skipped` when another repair is already running for the chat.
#[utoipa::path(
    post,
    path = "/v1/chats/{id}/integrity",
    responses(
        (status = 200, description = "What was done", body = HealReport),
        (status = 404, description = "No such chat for this caller", body = chatguard_core::error::ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Chat id"),
        ("x-user-id" = Uuid, Header, description = "End user, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "chats"
)]
pub async fn check_integrity(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    caller: CallerIdentity,
) -> Result<Json<HealReport>, AppError> {
    load_owned(&state, chat_id, caller).await?;
    Ok(Json(state.healer.validate_and_heal_state(chat_id).await?))
}

/// Force a repair pass on a chat (operator)
///
/// Takes the recovery lock even when the chat currently validates.
#[utoipa::path(
    post,
    path = "/v1/chats/{id}/repair",
    responses(
        (status = 200, description = "What was done", body = HealReport),
        (status = 404, description = "Chat not found", body = chatguard_core::error::ApiError),
        (status = 409, description = "Repair already in progress", body = chatguard_core::error::ApiError)
    ),
    params(("id" = Uuid, Path, description = "Chat id")),
    security(("bearer_auth" = [])),
    tag = "chats"
)]
pub async fn repair_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    _operator: OperatorAuth,
) -> Result<Json<HealReport>, AppError> {
    let report = state.healer.repair_conversation(chat_id).await?;
    tracing::info!(chat_id = %chat_id, status = ?report.status, "operator repair finished");
    Ok(Json(report))
}
