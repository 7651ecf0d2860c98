pub mod audit;
pub mod store;

pub use audit::{MemoryAuditLog, SqliteAuditLog};
pub use store::{InMemoryAgentRegistry, InMemoryLinkRepository, InMemoryModelRepository};
