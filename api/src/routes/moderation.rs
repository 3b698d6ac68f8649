use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::post};
use chatguard_core::moderation::{AutoArchiveDecision, ModerationEvent, ModerationLogEntry};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/moderation/events", post(record_moderation_event))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModerationEventResponse {
    pub entry: ModerationLogEntry,
    /// Present for `blocked` events: whether the chat crossed the archive threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_archive: Option<AutoArchiveDecision>,
}

/// Record a moderation outcome for a message
///
/// Every event is appended to the moderation log. A `blocked` event also
/// applies the auto-archive policy: once a chat collects enough blocked
/// messages inside the trailing window it is archived.
#[utoipa::path(
    post,
    path = "/v1/moderation/events",
    request_body = ModerationEvent,
    responses(
        (status = 201, description = "Event recorded", body = ModerationEventResponse),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError),
        (status = 404, description = "Chat not found in the caller's organization", body = chatguard_core::error::ApiError)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "Caller, set by the gateway"),
        ("x-organization-id" = Uuid, Header, description = "Organization, set by the gateway")
    ),
    tag = "moderation"
)]
pub async fn record_moderation_event(
    State(state): State<AppState>,
    caller: CallerIdentity,
    AppJson(event): AppJson<ModerationEvent>,
) -> Result<impl IntoResponse, AppError> {
    if event.violation_type.trim().is_empty() {
        return Err(AppError::Validation {
            message: "violation_type must not be empty".to_string(),
            field: Some("violation_type".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if event.organization_id != caller.organization_id {
        return Err(AppError::Forbidden {
            message: "organization_id does not match the caller's organization".to_string(),
        });
    }
    let chat_in_org = state
        .stores
        .chats
        .get(event.chat_id)
        .await?
        .is_some_and(|chat| chat.organization_id == caller.organization_id);
    if !chat_in_org {
        return Err(AppError::NotFound {
            resource: "chat",
            id: event.chat_id.to_string(),
        });
    }

    let (entry, auto_archive) = state.ledger.record_and_enforce(event).await?;
    Ok((
        StatusCode::CREATED,
        Json(ModerationEventResponse {
            entry,
            auto_archive,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chatguard_core::chat::{Chat, ConversationState};
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::routes::test_support::{CannedProvider, caller_request, json_body, test_app};

    #[tokio::test]
    async fn third_block_archives_the_chat() {
        let app = test_app(CannedProvider {
            reply: Ok("x".to_string()),
        });
        let (user, org) = (Uuid::now_v7(), Uuid::now_v7());
        let chat = Chat::new(user, org);
        app.state.stores.chats.create(&chat).await.expect("create");
        let router = router().with_state(app.state.clone());

        let threshold = app.state.config.auto_archive_violation_threshold;
        let mut last = serde_json::Value::Null;
        for _ in 0..threshold {
            let response = router
                .clone()
                .oneshot(caller_request(
                    "POST",
                    "/v1/moderation/events",
                    user,
                    org,
                    Some(json!({
                        "chat_id": chat.id,
                        "user_id": user,
                        "organization_id": org,
                        "violation_type": "harassment",
                        "action_taken": "blocked"
                    })),
                ))
                .await
                .expect("request should succeed");
            assert_eq!(response.status(), StatusCode::CREATED);
            last = json_body(response).await;
        }
        assert_eq!(last["auto_archive"]["archived"], true);

        let stored = app
            .state
            .stores
            .chats
            .get(chat.id)
            .await
            .expect("load")
            .expect("chat exists");
        assert_eq!(stored.conversation_state, ConversationState::Archived);
    }

    #[tokio::test]
    async fn events_for_another_organization_are_forbidden() {
        let app = test_app(CannedProvider {
            reply: Ok("x".to_string()),
        });
        let (user, org) = (Uuid::now_v7(), Uuid::now_v7());
        let chat = Chat::new(user, org);
        app.state.stores.chats.create(&chat).await.expect("create");

        let response = router()
            .with_state(app.state)
            .oneshot(caller_request(
                "POST",
                "/v1/moderation/events",
                user,
                Uuid::now_v7(),
                Some(json!({
                    "chat_id": chat.id,
                    "user_id": user,
                    "organization_id": org,
                    "violation_type": "spam",
                    "action_taken": "logged"
                })),
            ))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
