mod schema;

pub use schema::SqliteStore;

use crate::error::StoreError;

/// Durable key-value store backing the manual grouping ledger and the
/// review-status set. Writes are synchronous; a returned `Ok` means the
/// value is durable.
pub trait KvStore: Send + Sync {
    fn persist(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Keys used by the stores in this crate.
pub mod keys {
    pub const MANUAL_GROUPS: &str = "manual_groups";
    pub const REVIEWED_LEAVES: &str = "reviewed_leaves";
}
