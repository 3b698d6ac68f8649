use async_trait::async_trait;
use chatguard_core::checkpoint::Checkpoint;
use chatguard_core::error::ChatGuardError;
use chatguard_core::store::CheckpointStore;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::db_err;

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: Uuid,
    chat_id: Uuid,
    snapshot: serde_json::Value,
    message_count: i32,
    digest: String,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ChatGuardError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_checkpoints
                (id, chat_id, snapshot, message_count, digest, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(checkpoint.id)
        .bind(checkpoint.chat_id)
        .bind(&checkpoint.snapshot)
        .bind(checkpoint.message_count)
        .bind(&checkpoint.digest)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Checkpoint>, ChatGuardError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT id, chat_id, snapshot, message_count, digest, created_at
            FROM conversation_checkpoints
            WHERE chat_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Checkpoint {
            id: r.id,
            chat_id: r.chat_id,
            snapshot: r.snapshot,
            message_count: r.message_count,
            digest: r.digest,
            created_at: r.created_at,
        }))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ChatGuardError> {
        let result = sqlx::query("DELETE FROM conversation_checkpoints WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
