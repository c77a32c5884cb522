use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        ConversationId, ConversationType, MessageId, MessageType, ParticipantRole, PropertyId,
        UserId,
    },
    protocol::{Message, MessageSender},
};

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.message_type,
        m.created_at, m.is_edited, m.is_deleted, m.reply_to_id,
        u.username, u.first_name, u.last_name
     FROM messages m
     INNER JOIN users u ON u.id = m.sender_id";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub username: String,
    pub role: ParticipantRole,
    pub business_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub property_id: Option<PropertyId>,
    pub participants: Vec<StoredParticipant>,
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: &'a str,
    pub message_type: MessageType,
    pub reply_to_id: Option<MessageId>,
}

/// Durable message log. The only source of truth for conversation history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message and returns it joined with its sender.
    async fn append(&self, message: NewMessage<'_>) -> Result<Message>;
    /// Newest-first page of a conversation, optionally strictly older than `before`.
    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;
    async fn touch_conversation(&self, conversation_id: ConversationId) -> Result<()>;
    async fn message_belongs_to(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn find_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<StoredParticipant>>;
    async fn list_active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredParticipant>>;
    async fn list_conversations_for_user(&self, user_id: UserId)
        -> Result<Vec<StoredConversation>>;
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        self.create_user_with_name(username, None, None).await
    }

    /// Inserts the user, or returns the existing id when the username is taken.
    pub async fn create_user_with_name(
        &self,
        username: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, first_name, last_name) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                first_name = COALESCE(excluded.first_name, users.first_name),
                last_name = COALESCE(excluded.last_name, users.last_name)
             RETURNING id",
        )
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user '{username}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, first_name, last_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            first_name: r.get::<Option<String>, _>(2),
            last_name: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        title: Option<&str>,
        property_id: Option<PropertyId>,
    ) -> Result<ConversationId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO conversations (conversation_type, title, property_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_type.as_str())
        .bind(title)
        .bind(property_id.map(|id| id.0))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to create conversation")?;
        Ok(ConversationId(rec.get::<i64, _>(0)))
    }

    /// Adds a participant. A previously soft-left participant becomes active again.
    pub async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: ParticipantRole,
        business_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, role, business_name, joined_at, left_at)
             VALUES (?, ?, ?, ?, ?, NULL)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                role = excluded.role,
                business_name = excluded.business_name,
                left_at = NULL",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(business_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to add user {} to conversation {}",
                user_id.0, conversation_id.0
            )
        })?;
        Ok(())
    }

    /// Soft-leaves a conversation; returns `false` when there was no active row.
    pub async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversation_participants SET left_at = ?
             WHERE conversation_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(Utc::now())
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_message(&self, message: &NewMessage<'_>) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, message_type, reply_to_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(message.content)
        .bind(message.message_type.as_str())
        .bind(message.reply_to_id.map(|id| id.0))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to insert message into conversation {}",
                message.conversation_id.0
            )
        })?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn message_with_sender(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn list_recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ? AND m.id < ?
                 ORDER BY m.id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(before_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?
                 ORDER BY m.id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(message_from_row).collect()
    }

    pub async fn latest_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        Ok(self
            .list_recent_messages(conversation_id, 1, None)
            .await?
            .into_iter()
            .next())
    }

    pub async fn update_conversation_timestamp(
        &self,
        conversation_id: ConversationId,
    ) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(conversation_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| {
                format!("failed to touch conversation {}", conversation_id.0)
            })?;
        Ok(())
    }

    pub async fn conversation_updated_at(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT updated_at FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
    }

    pub async fn participant_status(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<StoredParticipant>> {
        let row = sqlx::query(
            "SELECT u.id, u.username, p.role, p.business_name
             FROM conversation_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ? AND p.user_id = ? AND p.left_at IS NULL",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    pub async fn list_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, p.role, p.business_name
             FROM conversation_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ? AND p.left_at IS NULL
             ORDER BY p.joined_at ASC, u.id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.conversation_type, c.title, c.property_id, c.updated_at
             FROM conversations c
             INNER JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ? AND p.left_at IS NULL
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation_id = ConversationId(row.try_get::<i64, _>(0)?);
            let conversation_type = row
                .try_get::<String, _>(1)?
                .parse::<ConversationType>()
                .map_err(|e| anyhow!("conversation {}: {e}", conversation_id.0))?;
            conversations.push(StoredConversation {
                conversation_id,
                conversation_type,
                title: row.try_get::<Option<String>, _>(2)?,
                property_id: row.try_get::<Option<i64>, _>(3)?.map(PropertyId),
                participants: self.list_participants(conversation_id).await?,
                last_message: self.latest_message(conversation_id).await?,
                updated_at: row.try_get::<DateTime<Utc>, _>(4)?,
            });
        }
        Ok(conversations)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn append(&self, message: NewMessage<'_>) -> Result<Message> {
        let message_id = self.insert_message(&message).await?;
        self.message_with_sender(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {} vanished after insert", message_id.0))
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.list_recent_messages(conversation_id, limit, before)
            .await
    }

    async fn touch_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.update_conversation_timestamp(conversation_id).await
    }

    async fn message_belongs_to(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE id = ? AND conversation_id = ?")
            .bind(message_id.0)
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ConversationDirectory for Storage {
    async fn find_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<StoredParticipant>> {
        self.participant_status(conversation_id, user_id).await
    }

    async fn list_active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredParticipant>> {
        self.list_participants(conversation_id).await
    }

    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        self.list_conversations(user_id).await
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id = MessageId(row.try_get::<i64, _>(0)?);
    let sender_id = UserId(row.try_get::<i64, _>(2)?);
    let message_type = row
        .try_get::<String, _>(4)?
        .parse::<MessageType>()
        .map_err(|e| anyhow!("message {}: {e}", id.0))?;
    Ok(Message {
        id,
        conversation_id: ConversationId(row.try_get::<i64, _>(1)?),
        sender_id,
        sender: MessageSender {
            id: sender_id,
            username: row.try_get::<String, _>(9)?,
            first_name: row.try_get::<Option<String>, _>(10)?,
            last_name: row.try_get::<Option<String>, _>(11)?,
        },
        content: row.try_get::<String, _>(3)?,
        message_type,
        created_at: row.try_get::<DateTime<Utc>, _>(5)?,
        is_edited: row.try_get::<bool, _>(6)?,
        is_deleted: row.try_get::<bool, _>(7)?,
        reply_to_id: row.try_get::<Option<i64>, _>(8)?.map(MessageId),
        client_id: None,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<StoredParticipant> {
    let user_id = UserId(row.try_get::<i64, _>(0)?);
    let role = row
        .try_get::<String, _>(2)?
        .parse::<ParticipantRole>()
        .map_err(|e| anyhow!("participant {}: {e}", user_id.0))?;
    Ok(StoredParticipant {
        user_id,
        username: row.try_get::<String, _>(1)?,
        role,
        business_name: row.try_get::<Option<String>, _>(3)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
