//! Admission decisions and the storage they are built on.

mod limiter;
mod memory;
mod redis_storage;
mod rules;
mod storage;
mod subject;

pub use limiter::{Decision, RateLimiter};
pub use memory::MemoryStorage;
pub use redis_storage::RedisStorage;
pub use rules::{Policy, PolicyRegistry, PolicyRule, SubjectClass, TierRules};
pub use storage::{LimiterStorage, StorageError};
pub use subject::{SubjectKey, SubjectKind};
