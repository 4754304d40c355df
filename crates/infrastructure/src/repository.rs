use std::cmp::max;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{
    Conversation, ConversationId, ConversationRepository, Message, MessageId, MessageRepository,
    MessageText, NewMessage, ParticipantPair, RepositoryError, RepositoryFuture, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use crate::profile::PgProfileDirectory;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    participant_a_id: Uuid,
    participant_b_id: Uuid,
    is_direct_message: bool,
    title: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRecord> for Conversation {
    fn from(value: ConversationRecord) -> Self {
        Conversation {
            id: ConversationId::from(value.id),
            participant_a_id: UserId::from(value.participant_a_id),
            participant_b_id: UserId::from(value.participant_b_id),
            is_direct_message: value.is_direct_message,
            title: value.title,
            description: value.description,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    seq: i64,
    conversation_id: Uuid,
    sender_id: Uuid,
    text: String,
    created_at: DateTime<Utc>,
    read: bool,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let text = MessageText::from_stored(value.text).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            id: MessageId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            sender_id: UserId::from(value.sender_id),
            text,
            created_at: value.created_at,
            seq: value.seq,
            read: value.read,
            read_at: value.read_at,
        })
    }
}

const CONVERSATION_COLUMNS: &str = "id, participant_a_id, participant_b_id, is_direct_message, \
     title, description, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, seq, conversation_id, sender_id, text, created_at, read, read_at";

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ConversationRepository for PgConversationRepository {
    fn find_direct(&self, pair: ParticipantPair) -> RepositoryFuture<Option<Conversation>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                r#"
                SELECT {CONVERSATION_COLUMNS}
                FROM conversations
                WHERE is_direct_message
                  AND LEAST(participant_a_id, participant_b_id) = $1
                  AND GREATEST(participant_a_id, participant_b_id) = $2
                "#
            ))
            .bind(Uuid::from(pair.low()))
            .bind(Uuid::from(pair.high()))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(Conversation::from))
        })
    }

    fn insert(&self, conversation: Conversation) -> RepositoryFuture<Conversation> {
        let pool = self.pool.clone();
        Box::pin(async move {
            // 私信参与者对的唯一索引冲突时不返回行
            let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                r#"
                INSERT INTO conversations
                    (id, participant_a_id, participant_b_id, is_direct_message, title, description, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                RETURNING {CONVERSATION_COLUMNS}
                "#
            ))
            .bind(Uuid::from(conversation.id))
            .bind(Uuid::from(conversation.participant_a_id))
            .bind(Uuid::from(conversation.participant_b_id))
            .bind(conversation.is_direct_message)
            .bind(conversation.title.as_deref())
            .bind(conversation.description.as_deref())
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record
                .map(Conversation::from)
                .ok_or(RepositoryError::Conflict)
        })
    }

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
            ))
            .bind(Uuid::from(id))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(Conversation::from))
        })
    }

    fn list_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<Conversation>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let records = sqlx::query_as::<_, ConversationRecord>(&format!(
                r#"
                SELECT {CONVERSATION_COLUMNS}
                FROM conversations
                WHERE participant_a_id = $1 OR participant_b_id = $1
                ORDER BY updated_at DESC, id
                "#
            ))
            .bind(Uuid::from(user_id))
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(records.into_iter().map(Conversation::from).collect())
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MessageRepository for PgMessageRepository {
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            // 行锁把同一会话的追加串行化，seq 的分配顺序与提交顺序一致
            let updated_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT updated_at FROM conversations WHERE id = $1 FOR UPDATE",
            )
            .bind(Uuid::from(message.conversation_id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            let updated_at = updated_at.ok_or(RepositoryError::NotFound)?;

            let created_at = max(message.sent_at, updated_at);
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                INSERT INTO messages (id, conversation_id, sender_id, text, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(message.conversation_id))
            .bind(Uuid::from(message.sender_id))
            .bind(message.text.as_str())
            .bind(created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
                .bind(Uuid::from(message.conversation_id))
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

            tx.commit().await.map_err(map_sqlx_err)?;
            Message::try_from(record)
        })
    }

    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> RepositoryFuture<Vec<Message>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let records = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS}
                FROM (
                    SELECT {MESSAGE_COLUMNS}
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, seq DESC
                    LIMIT $2
                ) recent
                ORDER BY created_at ASC, seq ASC
                "#
            ))
            .bind(Uuid::from(conversation_id))
            .bind(i64::from(limit))
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            records.into_iter().map(Message::try_from).collect()
        })
    }

    fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        at: Timestamp,
    ) -> RepositoryFuture<u64> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE messages
                SET read = TRUE, read_at = $3
                WHERE conversation_id = $1 AND sender_id <> $2 AND NOT read
                "#,
            )
            .bind(Uuid::from(conversation_id))
            .bind(Uuid::from(reader_id))
            .bind(at)
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(result.rows_affected())
        })
    }

    fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> RepositoryFuture<u64> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM messages
                WHERE conversation_id = $1 AND sender_id <> $2 AND NOT read
                "#,
            )
            .bind(Uuid::from(conversation_id))
            .bind(Uuid::from(reader_id))
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            u64::try_from(count).map_err(|_| invalid_data("negative unread count"))
        })
    }
}

pub struct PgStorage {
    pub pool: PgPool,
    pub conversation_repository: Arc<PgConversationRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub profile_directory: Arc<PgProfileDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversation_repository: Arc::new(PgConversationRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            profile_directory: Arc::new(PgProfileDirectory::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
