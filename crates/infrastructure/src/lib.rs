//! 基础设施层实现。
//!
//! 提供持久化端口的 PostgreSQL 与内存实现，以及内嵌的数据库迁移。

pub mod builder;
pub mod memory;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use memory::{InMemoryStore, Seed, SeedError};
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgChatMessageRepository, PgMeetingRepository, PgStorage, PgUserRepository,
};
