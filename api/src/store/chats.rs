use std::collections::HashMap;

use async_trait::async_trait;
use chatguard_core::chat::{Chat, ConversationState, Message, MessageRole, ToolCall};
use chatguard_core::error::ChatGuardError;
use chatguard_core::stats::ChatIntegrityStats;
use chatguard_core::store::{ChatStore, StateUpdate};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{corrupt_row, db_err};

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: Uuid,
    owner_id: Uuid,
    organization_id: Uuid,
    title: Option<String>,
    conversation_state: String,
    last_stable_at: Option<DateTime<Utc>>,
    state_reason: Option<String>,
    forked_from: Option<Uuid>,
    forked_into: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    role: String,
    content: String,
    tool_call_id: Option<String>,
    synthetic: bool,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ToolCallRow {
    id: Uuid,
    message_id: Uuid,
    tool_call_id: String,
    name: String,
    arguments: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total: i64,
    stable: i64,
    needs_cleanup: i64,
    error: i64,
    archived: i64,
}

fn parse_state(raw: &str) -> Result<ConversationState, ChatGuardError> {
    ConversationState::parse(raw)
        .ok_or_else(|| corrupt_row(format!("unknown conversation_state '{raw}'")))
}

impl MessageRow {
    fn into_message(self, tool_calls: Vec<ToolCall>) -> Result<Message, ChatGuardError> {
        let role = MessageRole::parse(&self.role)
            .ok_or_else(|| corrupt_row(format!("unknown message role '{}'", self.role)))?;
        Ok(Message {
            id: self.id,
            chat_id: self.chat_id,
            role,
            content: self.content,
            tool_call_id: self.tool_call_id,
            tool_calls,
            synthetic: self.synthetic,
            created_at: self.created_at,
        })
    }
}

impl ChatRow {
    fn into_chat(self, messages: Vec<Message>) -> Result<Chat, ChatGuardError> {
        Ok(Chat {
            id: self.id,
            owner_id: self.owner_id,
            organization_id: self.organization_id,
            title: self.title,
            messages,
            conversation_state: parse_state(&self.conversation_state)?,
            last_stable_at: self.last_stable_at,
            state_reason: self.state_reason,
            forked_from: self.forked_from,
            forked_into: self.forked_into,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Insert `messages` at consecutive positions starting at `first_position`.
async fn insert_messages(
    conn: &mut PgConnection,
    chat_id: Uuid,
    first_position: i32,
    messages: &[Message],
) -> Result<(), sqlx::Error> {
    for (offset, message) in messages.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chat_messages
                (id, chat_id, position, role, content, tool_call_id, synthetic, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(chat_id)
        .bind(first_position + offset as i32)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.tool_call_id)
        .bind(message.synthetic)
        .bind(message.created_at)
        .execute(&mut *conn)
        .await?;

        for (ordinal, call) in message.tool_calls.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chat_tool_calls
                    (id, chat_id, message_id, ordinal, tool_call_id, name, arguments)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(call.id)
            .bind(chat_id)
            .bind(message.id)
            .bind(ordinal as i32)
            .bind(&call.tool_call_id)
            .bind(&call.name)
            .bind(&call.arguments)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Text values of the states a chat may be in for a write to `next`.
fn sources_of(next: ConversationState) -> Vec<&'static str> {
    ConversationState::sources_of(next)
        .into_iter()
        .map(ConversationState::as_str)
        .collect()
}

impl PgChatStore {
    /// Claim the next version of an open chat. On a miss, work out whether the
    /// chat is gone, closed, or was changed by someone else.
    async fn bump_version(
        conn: &mut PgConnection,
        chat_id: Uuid,
        expected_version: i64,
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError> {
        let bumped = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE chats
            SET version = version + 1,
                conversation_state = $3,
                last_stable_at = COALESCE($4, last_stable_at),
                updated_at = now()
            WHERE id = $1
              AND version = $2
              AND conversation_state IN ('stable', 'needs_cleanup')
              AND conversation_state = ANY($5)
            RETURNING version
            "#,
        )
        .bind(chat_id)
        .bind(expected_version)
        .bind(update.state.as_str())
        .bind(update.stable_at)
        .bind(sources_of(update.state))
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        if let Some(version) = bumped {
            return Ok(version);
        }

        let current = sqlx::query_as::<_, (String, Option<Uuid>)>(
            "SELECT conversation_state, forked_into FROM chats WHERE id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        match current {
            None => Err(ChatGuardError::ChatNotFound(chat_id)),
            Some((state, forked_into)) => {
                let state = parse_state(&state)?;
                if state.is_terminal() {
                    Err(ChatGuardError::ChatClosed {
                        chat_id,
                        state,
                        forked_into,
                    })
                } else {
                    Err(ChatGuardError::ConcurrentModification {
                        chat_id,
                        expected_version,
                    })
                }
            }
        }
    }

    async fn exists(&self, chat_id: Uuid) -> Result<bool, ChatGuardError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM chats WHERE id = $1)")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    /// `Ok(true)` when the update touched a row, `ChatNotFound` when the chat
    /// does not exist, `Ok(false)` otherwise.
    async fn touched(&self, chat_id: Uuid, rows: u64) -> Result<bool, ChatGuardError> {
        if rows > 0 {
            return Ok(true);
        }
        if self.exists(chat_id).await? {
            Ok(false)
        } else {
            Err(ChatGuardError::ChatNotFound(chat_id))
        }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn get(&self, chat_id: Uuid) -> Result<Option<Chat>, ChatGuardError> {
        let Some(row) = sqlx::query_as::<_, ChatRow>(
            r#"
            SELECT id, owner_id, organization_id, title, conversation_state, last_stable_at,
                   state_reason, forked_from, forked_into, version, created_at, updated_at
            FROM chats
            WHERE id = $1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        else {
            return Ok(None);
        };

        let message_rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, chat_id, role, content, tool_call_id, synthetic, created_at
            FROM chat_messages
            WHERE chat_id = $1
            ORDER BY position
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let call_rows = sqlx::query_as::<_, ToolCallRow>(
            r#"
            SELECT id, message_id, tool_call_id, name, arguments
            FROM chat_tool_calls
            WHERE chat_id = $1
            ORDER BY message_id, ordinal
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut calls_by_message: HashMap<Uuid, Vec<ToolCall>> = HashMap::new();
        for call in call_rows {
            calls_by_message
                .entry(call.message_id)
                .or_default()
                .push(ToolCall {
                    id: call.id,
                    tool_call_id: call.tool_call_id,
                    name: call.name,
                    arguments: call.arguments,
                });
        }

        let messages = message_rows
            .into_iter()
            .map(|m| {
                let calls = calls_by_message.remove(&m.id).unwrap_or_default();
                m.into_message(calls)
            })
            .collect::<Result<Vec<_>, _>>()?;

        row.into_chat(messages).map(Some)
    }

    async fn create(&self, chat: &Chat) -> Result<(), ChatGuardError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO chats
                (id, owner_id, organization_id, title, conversation_state, last_stable_at,
                 state_reason, forked_from, forked_into, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(chat.id)
        .bind(chat.owner_id)
        .bind(chat.organization_id)
        .bind(&chat.title)
        .bind(chat.conversation_state.as_str())
        .bind(chat.last_stable_at)
        .bind(&chat.state_reason)
        .bind(chat.forked_from)
        .bind(chat.forked_into)
        .bind(chat.version)
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_messages(&mut tx, chat.id, 0, &chat.messages)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn replace_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let version = Self::bump_version(&mut tx, chat_id, expected_version, update).await?;

        // tool calls go with their messages via ON DELETE CASCADE
        sqlx::query("DELETE FROM chat_messages WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_messages(&mut tx, chat_id, 0, messages)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(version)
    }

    async fn append_messages(
        &self,
        chat_id: Uuid,
        expected_version: i64,
        messages: &[Message],
        update: StateUpdate,
    ) -> Result<i64, ChatGuardError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let version = Self::bump_version(&mut tx, chat_id, expected_version, update).await?;

        let next_position = sqlx::query_scalar::<_, i32>(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM chat_messages WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        insert_messages(&mut tx, chat_id, next_position, messages)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(version)
    }

    async fn set_state(&self, chat_id: Uuid, update: StateUpdate) -> Result<bool, ChatGuardError> {
        let result = sqlx::query(
            r#"
            UPDATE chats
            SET conversation_state = $2,
                last_stable_at = COALESCE($3, last_stable_at),
                updated_at = now()
            WHERE id = $1
              AND conversation_state IN ('stable', 'needs_cleanup')
              AND conversation_state = ANY($4)
            "#,
        )
        .bind(chat_id)
        .bind(update.state.as_str())
        .bind(update.stable_at)
        .bind(sources_of(update.state))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.touched(chat_id, result.rows_affected()).await
    }

    async fn mark_forked(
        &self,
        chat_id: Uuid,
        forked_into: Option<Uuid>,
        reason: &str,
    ) -> Result<bool, ChatGuardError> {
        let result = sqlx::query(
            r#"
            UPDATE chats
            SET conversation_state = 'error',
                state_reason = $2,
                forked_into = $3,
                updated_at = now()
            WHERE id = $1
              AND conversation_state <> 'error'
              AND conversation_state = ANY($4)
            "#,
        )
        .bind(chat_id)
        .bind(reason)
        .bind(forked_into)
        .bind(sources_of(ConversationState::Error))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.touched(chat_id, result.rows_affected()).await
    }

    async fn archive(&self, chat_id: Uuid, reason: &str) -> Result<bool, ChatGuardError> {
        let result = sqlx::query(
            r#"
            UPDATE chats
            SET conversation_state = 'archived',
                state_reason = $2,
                updated_at = now()
            WHERE id = $1 AND conversation_state = ANY($3)
            "#,
        )
        .bind(chat_id)
        .bind(reason)
        .bind(sources_of(ConversationState::Archived))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.touched(chat_id, result.rows_affected()).await
    }

    async fn list_open(&self, after: Option<Uuid>, limit: u32) -> Result<Vec<Uuid>, ChatGuardError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM chats
            WHERE conversation_state IN ('stable', 'needs_cleanup')
              AND ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn integrity_stats(&self) -> Result<ChatIntegrityStats, ChatGuardError> {
        let counts = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE conversation_state = 'stable') AS stable,
                   COUNT(*) FILTER (WHERE conversation_state = 'needs_cleanup') AS needs_cleanup,
                   COUNT(*) FILTER (WHERE conversation_state = 'error') AS error,
                   COUNT(*) FILTER (WHERE conversation_state = 'archived') AS archived
            FROM chats
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        // A tool message is orphaned when no earlier assistant message in the
        // same chat issued its id.
        let orphaned = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM chat_messages m
            JOIN chats c ON c.id = m.chat_id
            WHERE c.conversation_state IN ('stable', 'needs_cleanup')
              AND m.role = 'tool'
              AND (
                m.tool_call_id IS NULL
                OR NOT EXISTS (
                    SELECT 1
                    FROM chat_tool_calls tc
                    JOIN chat_messages am ON am.id = tc.message_id
                    WHERE tc.chat_id = m.chat_id
                      AND tc.tool_call_id = m.tool_call_id
                      AND am.position < m.position
                )
              )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ChatIntegrityStats {
            total: counts.total,
            active: counts.stable + counts.needs_cleanup,
            stable: counts.stable,
            needs_cleanup: counts.needs_cleanup,
            error: counts.error,
            archived: counts.archived,
            orphaned_tool_messages: orphaned,
        })
    }
}
