//! # 诊所数据库模块
//!
//! 实体存储的两种实现：基于PostgreSQL连接池的 [`PgStore`]，以及遵循相同事务契约的
//! 内存实现 [`MemoryStore`]。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::MemoryStore;
pub use queries::DatabaseQueries;
pub use store::PgStore;
