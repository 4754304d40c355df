use application::{ApplicationError, ProfileDirectory};
use async_trait::async_trait;
use domain::{DisplayProfile, UserId};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// 从 `users` 表读取展示资料，该表由外部账号服务维护
#[derive(Clone)]
pub struct PgProfileDirectory {
    pool: PgPool,
}

impl PgProfileDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ProfileRecord {
    id: Uuid,
    username: String,
    name: Option<String>,
    role: Option<String>,
}

impl From<ProfileRecord> for DisplayProfile {
    fn from(value: ProfileRecord) -> Self {
        DisplayProfile {
            user_id: UserId::from(value.id),
            username: value.username,
            name: value.name,
            role: value.role,
        }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    async fn lookup(&self, user_id: UserId) -> Result<Option<DisplayProfile>, ApplicationError> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, username, name, role FROM users WHERE id = $1",
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| ApplicationError::unavailable(format!("profile lookup failed: {err}")))?;

        Ok(record.map(DisplayProfile::from))
    }
}
