//! Operator aggregates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::moderation::ModerationAction;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ChatIntegrityStats {
    pub total: i64,
    /// Chats still accepting turns (stable + needs_cleanup)
    pub active: i64,
    pub stable: i64,
    pub needs_cleanup: i64,
    pub error: i64,
    pub archived: i64,
    /// Tool messages with no or an unmatched `tool_call_id`, across open chats
    pub orphaned_tool_messages: i64,
}

/// Raw outcome counts of recovery contexts opened since a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryTally {
    pub healed: i64,
    pub forked: i64,
    pub failed: i64,
    pub expired: i64,
    pub active: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RecoveryStats {
    pub since: DateTime<Utc>,
    pub healed: i64,
    pub forked: i64,
    pub failed: i64,
    pub expired: i64,
    pub active: i64,
    pub closed: i64,
    /// (healed + forked) / closed. Absent when nothing closed in the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

impl RecoveryStats {
    pub fn from_tally(since: DateTime<Utc>, tally: RecoveryTally) -> Self {
        let closed = tally.healed + tally.forked + tally.failed + tally.expired;
        let success_rate =
            (closed > 0).then(|| (tally.healed + tally.forked) as f64 / closed as f64);
        Self {
            since,
            healed: tally.healed,
            forked: tally.forked,
            failed: tally.failed,
            expired: tally.expired,
            active: tally.active,
            closed,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ViolationSummaryRow {
    pub violation_type: String,
    pub action_taken: ModerationAction,
    pub count: i64,
    pub distinct_users: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OffenderRow {
    pub user_id: Uuid,
    pub blocked_count: i64,
    pub total_count: i64,
    pub last_detected_at: DateTime<Utc>,
}
