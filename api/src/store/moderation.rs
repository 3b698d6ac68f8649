use async_trait::async_trait;
use chatguard_core::error::ChatGuardError;
use chatguard_core::moderation::{ModerationAction, ModerationLogEntry};
use chatguard_core::stats::{OffenderRow, ViolationSummaryRow};
use chatguard_core::store::ModerationStore;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{corrupt_row, db_err};

/// Append-only moderation log.
pub struct PgModerationStore {
    pool: PgPool,
}

impl PgModerationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    violation_type: String,
    action_taken: String,
    count: i64,
    distinct_users: i64,
}

#[derive(sqlx::FromRow)]
struct OffenderDbRow {
    user_id: Uuid,
    blocked_count: i64,
    total_count: i64,
    last_detected_at: DateTime<Utc>,
}

#[async_trait]
impl ModerationStore for PgModerationStore {
    async fn append(&self, entry: &ModerationLogEntry) -> Result<(), ChatGuardError> {
        sqlx::query(
            r#"
            INSERT INTO moderation_log
                (id, chat_id, message_id, user_id, organization_id, violation_type,
                 action_taken, detected_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.chat_id)
        .bind(entry.message_id)
        .bind(entry.user_id)
        .bind(entry.organization_id)
        .bind(&entry.violation_type)
        .bind(entry.action_taken.as_str())
        .bind(entry.detected_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn count_blocked(
        &self,
        chat_id: Uuid,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, ChatGuardError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM moderation_log
            WHERE chat_id = $1
              AND organization_id = $2
              AND action_taken = 'blocked'
              AND detected_at >= $3
            "#,
        )
        .bind(chat_id)
        .bind(organization_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn violation_summary(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ViolationSummaryRow>, ChatGuardError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT violation_type,
                   action_taken,
                   COUNT(*) AS count,
                   COUNT(DISTINCT user_id) AS distinct_users
            FROM moderation_log
            WHERE organization_id = $1 AND created_at >= $2 AND created_at < $3
            GROUP BY violation_type, action_taken
            ORDER BY count DESC, violation_type
            "#,
        )
        .bind(organization_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                let action_taken = ModerationAction::parse(&r.action_taken).ok_or_else(|| {
                    corrupt_row(format!("unknown moderation action '{}'", r.action_taken))
                })?;
                Ok(ViolationSummaryRow {
                    violation_type: r.violation_type,
                    action_taken,
                    count: r.count,
                    distinct_users: r.distinct_users,
                })
            })
            .collect()
    }

    async fn repeat_offenders(
        &self,
        organization_id: Option<Uuid>,
        since: DateTime<Utc>,
        min_blocked: i64,
    ) -> Result<Vec<OffenderRow>, ChatGuardError> {
        let rows = sqlx::query_as::<_, OffenderDbRow>(
            r#"
            SELECT user_id,
                   COUNT(*) FILTER (WHERE action_taken = 'blocked') AS blocked_count,
                   COUNT(*) AS total_count,
                   MAX(detected_at) AS last_detected_at
            FROM moderation_log
            WHERE created_at >= $1
              AND ($2::uuid IS NULL OR organization_id = $2)
            GROUP BY user_id
            HAVING COUNT(*) FILTER (WHERE action_taken = 'blocked') >= $3
            ORDER BY blocked_count DESC, last_detected_at DESC
            "#,
        )
        .bind(since)
        .bind(organization_id)
        .bind(min_blocked)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| OffenderRow {
                user_id: r.user_id,
                blocked_count: r.blocked_count,
                total_count: r.total_count,
                last_detected_at: r.last_detected_at,
            })
            .collect())
    }
}
