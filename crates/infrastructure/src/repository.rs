use std::sync::Arc;

use application::repository::{ChatMessageRepository, MeetingRepository, UserRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatIdentity, ChatKind, ChatMessage, Meeting, MeetingId, MessageId, RepositoryError, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct IdentityRecord {
    id: Uuid,
    nickname: String,
    profile_uri: String,
}

impl From<IdentityRecord> for ChatIdentity {
    fn from(value: IdentityRecord) -> Self {
        ChatIdentity::new(UserId::from(value.id), value.nickname, value.profile_uri)
    }
}

#[derive(Debug, FromRow)]
struct MeetingRecord {
    id: Uuid,
    host_id: Uuid,
    max_participants: i32,
}

#[derive(Debug, FromRow)]
struct ChatMessageRecord {
    id: Uuid,
    meeting_id: Uuid,
    sender_id: Uuid,
    sender_name: String,
    sender_profile_uri: String,
    content: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl From<ChatMessageRecord> for ChatMessage {
    fn from(value: ChatMessageRecord) -> Self {
        ChatMessage {
            id: MessageId::from(value.id),
            meeting_id: MeetingId::from(value.meeting_id),
            sender_id: UserId::from(value.sender_id),
            sender_name: value.sender_name,
            sender_profile_uri: value.sender_profile_uri,
            content: value.content,
            kind: ChatKind::parse(&value.kind),
            created_at: value.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_identity(&self, id: UserId) -> Result<Option<ChatIdentity>, RepositoryError> {
        let record = sqlx::query_as::<_, IdentityRecord>(
            r#"
            SELECT id, nickname, profile_uri
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(ChatIdentity::from))
    }
}

#[derive(Clone)]
pub struct PgMeetingRepository {
    pool: PgPool,
}

impl PgMeetingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeetingRepository for PgMeetingRepository {
    async fn find_by_id(&self, id: MeetingId) -> Result<Option<Meeting>, RepositoryError> {
        let record = sqlx::query_as::<_, MeetingRecord>(
            r#"
            SELECT id, host_id, max_participants
            FROM meetings
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let Some(record) = record else {
            return Ok(None);
        };

        let participant_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM meeting_participants
            WHERE meeting_id = $1
            ORDER BY joined_at
            "#,
        )
        .bind(record.id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let max_participants = u32::try_from(record.max_participants)
            .map_err(|_| invalid_data("meeting capacity out of range"))?;

        Ok(Some(Meeting {
            id: MeetingId::from(record.id),
            host_id: UserId::from(record.host_id),
            max_participants,
            participant_ids: participant_ids.into_iter().map(UserId::from).collect(),
        }))
    }

    async fn add_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
        max_participants: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 锁住会议行，使容量检查和插入对并发加入是原子的
        let exists = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM meetings WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(Uuid::from(meeting_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM meeting_participants WHERE meeting_id = $1
            "#,
        )
        .bind(Uuid::from(meeting_id))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if count >= i64::from(max_participants) {
            return Ok(false);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO meeting_participants (meeting_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (meeting_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(meeting_id))
        .bind(Uuid::from(user_id))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn remove_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM meeting_participants
            WHERE meeting_id = $1 AND user_id = $2
            "#,
        )
        .bind(Uuid::from(meeting_id))
        .bind(Uuid::from(user_id))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgChatMessageRepository {
    pool: PgPool,
}

impl PgChatMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatMessageRepository for PgChatMessageRepository {
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, RepositoryError> {
        let record = sqlx::query_as::<_, ChatMessageRecord>(
            r#"
            INSERT INTO chat_messages
                (id, meeting_id, sender_id, sender_name, sender_profile_uri, content, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, meeting_id, sender_id, sender_name, sender_profile_uri, content, kind, created_at
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.meeting_id))
        .bind(Uuid::from(message.sender_id))
        .bind(&message.sender_name)
        .bind(&message.sender_profile_uri)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RepositoryError::Conflict
            }
            other => map_sqlx_err(other),
        })?;

        Ok(ChatMessage::from(record))
    }

    async fn recent(
        &self,
        meeting_id: MeetingId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let records = sqlx::query_as::<_, ChatMessageRecord>(
            r#"
            SELECT id, meeting_id, sender_id, sender_name, sender_profile_uri, content, kind, created_at
            FROM chat_messages
            WHERE meeting_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(Uuid::from(meeting_id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(ChatMessage::from).collect())
    }
}

/// PostgreSQL 存储的全部仓储
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub meeting_repository: Arc<PgMeetingRepository>,
    pub message_repository: Arc<PgChatMessageRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            meeting_repository: Arc::new(PgMeetingRepository::new(pool.clone())),
            message_repository: Arc::new(PgChatMessageRepository::new(pool.clone())),
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
