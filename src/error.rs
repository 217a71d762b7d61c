use crate::model::EntityId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GroupingError>;

/// Failure reported by the external data source.
///
/// Cloneable so that one in-flight resolution can hand the same failure to
/// every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed ancestor chain for entity {entity_id}: {reason}")]
    Malformed { entity_id: EntityId, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum GroupingError {
    #[error("failed to fetch leaves: {0}")]
    Fetch(#[source] SourceError),
    #[error("failed to persist state: {0}")]
    Store(#[from] StoreError),
    #[error("hierarchy is still loading")]
    HierarchyLoading,
    #[error("manual group not found: {0}")]
    GroupNotFound(String),
    #[error("depth {requested} exceeds the maximum of {max}")]
    DepthOutOfRange { requested: usize, max: usize },
    #[error("settings error: {0}")]
    Settings(String),
}
