//! Hierarchical grouping of review requests with incremental caching.
//!
//! Leaves (review requests) are grouped by author, by the ancestor of their
//! linked work item at a chosen depth, or into user-curated manual groups.
//! [`coordinator::GroupingCoordinator`] is the entry point.

pub mod cache;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod grouping;
pub mod manual;
pub mod model;
pub mod review;
pub mod settings;
pub mod source;

pub use coordinator::{DepthChange, GroupingConfig, GroupingCoordinator, RefreshOutcome};
pub use error::{GroupingError, Result, SourceError, StoreError};
pub use grouping::{GroupKey, GroupingEngine, GroupingTree};
pub use model::{Bucket, Entity, EntityId, GroupingMode, Leaf, LeafId};
pub use source::{Fixture, FixtureSource, LeafSource};
