use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Chat, ConversationState};
use crate::provider::ProviderError;
use crate::validator::Violation;

/// Structured error response returned by the HTTP surface.
/// Never carries tool_call_ids, checkpoint contents or internal traces.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found", "conflict")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the caller should do next
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const RECOVERY_IN_PROGRESS: &str = "recovery_in_progress";
    pub const CONVERSATION_MOVED: &str = "conversation_moved";
    pub const CONVERSATION_ARCHIVED: &str = "conversation_archived";
    pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
}

/// Failure taxonomy for integrity checking, repair and provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ChatGuardError {
    /// Detected violations that Trim/Synthesize are expected to fix.
    #[error("chat {chat_id} has {} structural violation(s)", .violations.len())]
    StructuralViolation {
        chat_id: Uuid,
        violations: Vec<Violation>,
    },
    /// In-place repair is impossible; the caller must move to `recovery_chat_id`.
    #[error("chat {chat_id} could not be repaired in place; continued in {recovery_chat_id}")]
    UnrecoverableCorruption {
        chat_id: Uuid,
        recovery_chat_id: Uuid,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Another repair holds the recovery lock for this chat.
    #[error("chat {chat_id} is already being recovered")]
    AlreadyRecovering { chat_id: Uuid },
    /// The fork produced for `original_chat_id` failed its own validation.
    #[error("forked chat for {original_chat_id} failed validation ({} violation(s))", .violations.len())]
    ConversationRecovery {
        original_chat_id: Uuid,
        partial: Box<Chat>,
        violations: Vec<Violation>,
    },
    #[error("chat {0} not found")]
    ChatNotFound(Uuid),
    #[error("chat {chat_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification { chat_id: Uuid, expected_version: i64 },
    #[error("chat {chat_id} cannot move from {from} to {to}")]
    InvalidTransition {
        chat_id: Uuid,
        from: ConversationState,
        to: ConversationState,
    },
    /// The chat is archived or was abandoned for a fork and takes no more writes.
    #[error("chat {chat_id} is {state} and accepts no further messages")]
    ChatClosed {
        chat_id: Uuid,
        state: ConversationState,
        forked_into: Option<Uuid>,
    },
    #[error("recovery attempts exhausted for chat {chat_id} after {attempts} attempt(s)")]
    RecoveryAttemptsExhausted { chat_id: Uuid, attempts: u32 },
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ChatGuardError {
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(err))
    }

    /// Short machine label used in logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StructuralViolation { .. } => "structural_violation",
            Self::UnrecoverableCorruption { .. } => "unrecoverable_corruption",
            Self::Provider(_) => "provider_error",
            Self::AlreadyRecovering { .. } => "already_recovering",
            Self::ConversationRecovery { .. } => "conversation_recovery_error",
            Self::ChatNotFound(_) => "chat_not_found",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ChatClosed { .. } => "chat_closed",
            Self::RecoveryAttemptsExhausted { .. } => "recovery_attempts_exhausted",
            Self::Storage(_) => "storage_error",
        }
    }
}
