use std::sync::Arc;

use application::repository::{ChatMessageRepository, MeetingRepository, UserRepository};
use config::DatabaseConfig;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    memory::{InMemoryStore, SeedError},
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("seed error: {0}")]
    Seed(#[from] SeedError),
}

/// 应用层使用的全部持久化端口
#[derive(Clone)]
pub struct Infrastructure {
    pub message_repository: Arc<dyn ChatMessageRepository>,
    pub meeting_repository: Arc<dyn MeetingRepository>,
    pub user_repository: Arc<dyn UserRepository>,
}

impl Infrastructure {
    /// 按配置连接 PostgreSQL 并执行迁移，或者使用内存存储
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, InfrastructureError> {
        if config.is_memory() {
            let store = match &config.seed_file {
                Some(path) => {
                    info!(path = %path, "loading in-memory store seed");
                    InMemoryStore::load_seed_file(path)?
                }
                None => {
                    warn!("using empty in-memory store, data is lost on restart");
                    InMemoryStore::new()
                }
            };
            return Ok(Self::in_memory(store));
        }

        let pool = create_pg_pool(&config.url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!("database migrations applied");

        Ok(Self::postgres(PgStorage::new(pool)))
    }

    pub fn postgres(storage: PgStorage) -> Self {
        Self {
            message_repository: storage.message_repository,
            meeting_repository: storage.meeting_repository,
            user_repository: storage.user_repository,
        }
    }

    pub fn in_memory(store: InMemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            message_repository: store.clone(),
            meeting_repository: store.clone(),
            user_repository: store,
        }
    }
}
