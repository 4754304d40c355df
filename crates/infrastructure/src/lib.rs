//! 基础设施层实现。
//!
//! 提供 Postgres 仓储、用户资料读取和数据库迁移，实现应用/领域层定义的接口。

pub mod builder;
pub mod migrations;
pub mod profile;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use profile::PgProfileDirectory;
pub use repository::{create_pg_pool, PgConversationRepository, PgMessageRepository, PgStorage};
