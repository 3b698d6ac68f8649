use async_trait::async_trait;
use chatguard_core::error::ChatGuardError;
use chatguard_core::recovery::{RecoveryContext, RecoveryOutcome};
use chatguard_core::stats::RecoveryTally;
use chatguard_core::store::RecoveryContextStore;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{corrupt_row, db_err};

/// Recovery locks. The partial unique index on `chat_id WHERE outcome IS NULL`
/// is what guarantees a single live context per chat.
pub struct PgRecoveryStore {
    pool: PgPool,
}

impl PgRecoveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TallyRow {
    healed: i64,
    forked: i64,
    failed: i64,
    expired: i64,
    active: i64,
}

#[async_trait]
impl RecoveryContextStore for PgRecoveryStore {
    async fn open(
        &self,
        chat_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<RecoveryContext, ChatGuardError> {
        let ctx = RecoveryContext::open(chat_id, now, ttl);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let expired = sqlx::query(
            r#"
            UPDATE recovery_contexts
            SET outcome = 'expired', closed_at = $2
            WHERE chat_id = $1 AND outcome IS NULL AND expires_at <= $2
            "#,
        )
        .bind(chat_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if expired.rows_affected() > 0 {
            tracing::warn!(chat_id = %chat_id, "closed expired recovery context");
        }

        sqlx::query(
            r#"
            INSERT INTO recovery_contexts (id, chat_id, opened_at, expires_at, attempt_count)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(ctx.id)
        .bind(ctx.chat_id)
        .bind(ctx.opened_at)
        .bind(ctx.expires_at)
        .bind(ctx.attempt_count)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db) = e
                && db.code().as_deref() == Some("23505")
            {
                return ChatGuardError::AlreadyRecovering { chat_id };
            }
            db_err(e)
        })?;

        tx.commit().await.map_err(db_err)?;
        Ok(ctx)
    }

    async fn record_attempt(&self, context_id: Uuid) -> Result<i32, ChatGuardError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE recovery_contexts
            SET attempt_count = attempt_count + 1
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| corrupt_row(format!("recovery context {context_id} not found")))
    }

    async fn close(
        &self,
        context_id: Uuid,
        outcome: RecoveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), ChatGuardError> {
        sqlx::query(
            r#"
            UPDATE recovery_contexts
            SET outcome = $2, closed_at = $3
            WHERE id = $1 AND outcome IS NULL
            "#,
        )
        .bind(context_id)
        .bind(outcome.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, ChatGuardError> {
        let result = sqlx::query(
            r#"
            UPDATE recovery_contexts
            SET outcome = 'expired', closed_at = $1
            WHERE outcome IS NULL AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn tally_since(&self, since: DateTime<Utc>) -> Result<RecoveryTally, ChatGuardError> {
        let row = sqlx::query_as::<_, TallyRow>(
            r#"
            SELECT COUNT(*) FILTER (WHERE outcome = 'healed') AS healed,
                   COUNT(*) FILTER (WHERE outcome = 'forked') AS forked,
                   COUNT(*) FILTER (WHERE outcome = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE outcome = 'expired') AS expired,
                   COUNT(*) FILTER (WHERE outcome IS NULL) AS active
            FROM recovery_contexts
            WHERE opened_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(RecoveryTally {
            healed: row.healed,
            forked: row.forked,
            failed: row.failed,
            expired: row.expired,
            active: row.active,
        })
    }
}
