use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chatguard_core::chat::ConversationState;
use chatguard_core::error::{self, ApiError, ChatGuardError};
use chatguard_core::provider::ProviderError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not allowed (403)
    Forbidden { message: String },
    /// Resource not found (404)
    NotFound { resource: &'static str, id: String },
    /// State conflict the caller can act on (409)
    Conflict {
        code: &'static str,
        message: String,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Upstream LLM provider unavailable (503)
    ProviderUnavailable {
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    fn api_error(code: &str, message: String, request_id: String) -> ApiError {
        ApiError {
            error: code.to_string(),
            message,
            field: None,
            received: None,
            request_id,
            docs_hint: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();
        let mut retry_after = None;

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..Self::api_error(error::codes::UNAUTHORIZED, message, request_id)
                },
            ),
            AppError::Forbidden { message } => (
                StatusCode::FORBIDDEN,
                Self::api_error(error::codes::FORBIDDEN, message, request_id),
            ),
            AppError::NotFound { resource, id } => (
                StatusCode::NOT_FOUND,
                Self::api_error(
                    error::codes::NOT_FOUND,
                    format!("{resource} '{id}' not found"),
                    request_id,
                ),
            ),
            AppError::Conflict {
                code,
                message,
                received,
                docs_hint,
            } => (
                StatusCode::CONFLICT,
                ApiError {
                    received,
                    docs_hint,
                    ..Self::api_error(code, message, request_id)
                },
            ),
            AppError::ProviderUnavailable {
                message,
                retry_after_secs,
            } => {
                retry_after = retry_after_secs;
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Self::api_error(error::codes::PROVIDER_UNAVAILABLE, message, request_id),
                )
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Self::api_error(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Self::api_error(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
        };

        let mut response = (status, Json(api_error)).into_response();
        if let Some(secs) = retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert("retry-after", value);
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

fn moved(recovery_chat_id: Option<uuid::Uuid>) -> AppError {
    AppError::Conflict {
        code: error::codes::CONVERSATION_MOVED,
        message: "This conversation could not be continued.".to_string(),
        received: recovery_chat_id.map(|id| serde_json::json!({ "recovery_chat_id": id })),
        docs_hint: recovery_chat_id
            .map(|_| "Continue in the chat given by received.recovery_chat_id.".to_string()),
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::ProviderUnavailable {
            message: err.user_message().to_string(),
            retry_after_secs: err.retry_after_secs,
        }
    }
}

/// Classifies core failures. Tool-call ids, checkpoint contents and internal
/// details never reach the response body.
impl From<ChatGuardError> for AppError {
    fn from(err: ChatGuardError) -> Self {
        match err {
            ChatGuardError::ChatNotFound(id) => AppError::NotFound {
                resource: "chat",
                id: id.to_string(),
            },
            ChatGuardError::StructuralViolation { violations, .. } => AppError::Validation {
                message: "The tool response does not match an open tool call in this chat."
                    .to_string(),
                field: Some("tool_call_id".to_string()),
                received: Some(serde_json::json!({
                    "violations": violations.iter().map(|v| v.kind().as_str()).collect::<Vec<_>>()
                })),
                docs_hint: Some(
                    "Each tool call accepts exactly one response, before the next user message."
                        .to_string(),
                ),
            },
            ChatGuardError::AlreadyRecovering { .. } => AppError::Conflict {
                code: error::codes::RECOVERY_IN_PROGRESS,
                message: "This conversation is being repaired. Please retry shortly.".to_string(),
                received: None,
                docs_hint: None,
            },
            ChatGuardError::ConcurrentModification { .. } => AppError::Conflict {
                code: error::codes::CONFLICT,
                message: "The conversation changed while the request was processed. Please retry."
                    .to_string(),
                received: None,
                docs_hint: None,
            },
            ChatGuardError::UnrecoverableCorruption {
                recovery_chat_id, ..
            } => moved(Some(recovery_chat_id)),
            ChatGuardError::ChatClosed {
                state: ConversationState::Archived,
                ..
            } => AppError::Conflict {
                code: error::codes::CONVERSATION_ARCHIVED,
                message: "This conversation has been archived.".to_string(),
                received: None,
                docs_hint: None,
            },
            ChatGuardError::ChatClosed { forked_into, .. } => moved(forked_into),
            ChatGuardError::Provider(err) => err.into(),
            ChatGuardError::Storage(err) => AppError::Internal(format!("storage: {err}")),
            ChatGuardError::ConversationRecovery {
                original_chat_id,
                partial,
                violations,
            } => {
                tracing::error!(
                    chat_id = %original_chat_id,
                    partial_chat_id = %partial.id,
                    partial_messages = partial.messages.len(),
                    violations = violations.len(),
                    "conversation recovery produced an invalid fork"
                );
                AppError::Internal(format!(
                    "conversation {original_chat_id} could not be recovered (conversation_recovery_error)"
                ))
            }
            other @ (ChatGuardError::InvalidTransition { .. }
            | ChatGuardError::RecoveryAttemptsExhausted { .. }) => {
                AppError::Internal(format!("{} ({})", other, other.kind()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatguard_core::provider::ProviderErrorKind;
    use uuid::Uuid;

    #[test]
    fn recovery_lock_maps_to_conflict() {
        let err: AppError = ChatGuardError::AlreadyRecovering {
            chat_id: Uuid::now_v7(),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn provider_errors_carry_retry_after() {
        let err: AppError = ChatGuardError::Provider(ProviderError::circuit_open(12)).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get("retry-after")
                .expect("retry-after header should exist"),
            "12"
        );
        let _ = ProviderErrorKind::CircuitOpen;
    }

    #[test]
    fn internal_failures_hide_details() {
        let err: AppError = ChatGuardError::RecoveryAttemptsExhausted {
            chat_id: Uuid::now_v7(),
            attempts: 3,
        }
        .into();
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn archived_and_moved_chats_are_distinguished() {
        let archived: AppError = ChatGuardError::ChatClosed {
            chat_id: Uuid::now_v7(),
            state: ConversationState::Archived,
            forked_into: None,
        }
        .into();
        assert!(matches!(
            archived,
            AppError::Conflict {
                code: error::codes::CONVERSATION_ARCHIVED,
                ..
            }
        ));

        let fork = Uuid::now_v7();
        let moved: AppError = ChatGuardError::ChatClosed {
            chat_id: Uuid::now_v7(),
            state: ConversationState::Error,
            forked_into: Some(fork),
        }
        .into();
        let AppError::Conflict { code, received, .. } = moved else {
            panic!("expected conflict");
        };
        assert_eq!(code, error::codes::CONVERSATION_MOVED);
        assert_eq!(received, Some(serde_json::json!({ "recovery_chat_id": fork })));
    }
}
