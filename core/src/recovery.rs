use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Healed,
    Forked,
    Failed,
    /// Lock outlived its TTL without being closed.
    Expired,
}

impl RecoveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healed => "healed",
            Self::Forked => "forked",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "healed" => Some(Self::Healed),
            "forked" => Some(Self::Forked),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Healed | Self::Forked)
    }
}

/// Bounded-lifetime lock for one in-progress repair. At most one is active per chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RecoveryContext {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RecoveryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl RecoveryContext {
    pub fn open(chat_id: Uuid, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            chat_id,
            opened_at: now,
            expires_at: now + ttl,
            attempt_count: 0,
            outcome: None,
            closed_at: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.outcome.is_none() && now < self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.outcome.is_none() && now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_expires_after_ttl() {
        let now = Utc::now();
        let ctx = RecoveryContext::open(Uuid::now_v7(), now, Duration::seconds(120));
        assert!(ctx.is_active(now + Duration::seconds(119)));
        assert!(!ctx.is_active(now + Duration::seconds(120)));
        assert!(ctx.is_expired(now + Duration::seconds(120)));
    }

    #[test]
    fn closed_context_is_inactive() {
        let now = Utc::now();
        let mut ctx = RecoveryContext::open(Uuid::now_v7(), now, Duration::seconds(120));
        ctx.outcome = Some(RecoveryOutcome::Healed);
        assert!(!ctx.is_active(now));
        assert!(!ctx.is_expired(now + Duration::days(1)));
    }
}
