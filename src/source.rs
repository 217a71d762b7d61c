//! External data source contract and an in-memory fixture implementation.
//!
//! The grouping engine never talks to the ticketing/VCS system directly. It
//! goes through [`LeafSource`], which the host wires to its REST client. The
//! [`FixtureSource`] serves a JSON snapshot instead and counts every call, so
//! the CLI can run offline and tests can assert on resolver traffic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::SourceError;
use crate::model::{Entity, EntityId, Leaf, LeafId};

#[async_trait]
pub trait LeafSource: Send + Sync {
    /// Fetch the full current leaf set.
    async fn fetch_leaves(&self) -> Result<Vec<Leaf>, SourceError>;

    /// Entity a leaf is linked to, `None` when it has no link.
    async fn fetch_entity_link(&self, leaf_id: LeafId) -> Result<Option<EntityId>, SourceError>;

    /// The entity itself followed by up to `max_depth` ancestors. An empty
    /// result means the entity is unknown.
    async fn fetch_ancestor_chain(
        &self,
        entity_id: EntityId,
        max_depth: usize,
    ) -> Result<Vec<Entity>, SourceError>;
}

/// Snapshot served by [`FixtureSource`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub leaves: Vec<Leaf>,
    #[serde(default)]
    pub links: HashMap<LeafId, EntityId>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read fixture {}: {}", path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse fixture {}: {}", path.display(), e))
    }
}

pub struct FixtureSource {
    leaves: Mutex<Vec<Leaf>>,
    links: HashMap<LeafId, EntityId>,
    entities: HashMap<EntityId, Entity>,
    failing_entities: Mutex<HashSet<EntityId>>,
    failing_links: Mutex<HashSet<LeafId>>,
    fail_leaf_fetch: AtomicBool,
    latency: Option<Duration>,
    leaf_fetches: AtomicUsize,
    link_calls: AtomicUsize,
    chain_calls: Mutex<Vec<(EntityId, usize)>>,
}

impl FixtureSource {
    pub fn new(fixture: Fixture) -> Self {
        Self {
            leaves: Mutex::new(fixture.leaves),
            links: fixture.links,
            entities: fixture.entities.into_iter().map(|e| (e.id, e)).collect(),
            failing_entities: Mutex::new(HashSet::new()),
            failing_links: Mutex::new(HashSet::new()),
            fail_leaf_fetch: AtomicBool::new(false),
            latency: None,
            leaf_fetches: AtomicUsize::new(0),
            link_calls: AtomicUsize::new(0),
            chain_calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay every call, to let concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_leaves(&self, leaves: Vec<Leaf>) {
        *self.leaves.lock().unwrap_or_else(|e| e.into_inner()) = leaves;
    }

    pub fn fail_entity(&self, entity_id: EntityId) {
        self.failing_entities.lock().unwrap_or_else(|e| e.into_inner()).insert(entity_id);
    }

    pub fn fail_link(&self, leaf_id: LeafId) {
        self.failing_links.lock().unwrap_or_else(|e| e.into_inner()).insert(leaf_id);
    }

    pub fn set_fail_leaf_fetch(&self, fail: bool) {
        self.fail_leaf_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn leaf_fetches(&self) -> usize {
        self.leaf_fetches.load(Ordering::SeqCst)
    }

    pub fn link_calls(&self) -> usize {
        self.link_calls.load(Ordering::SeqCst)
    }

    pub fn chain_calls(&self) -> usize {
        self.chain_calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every `(entity_id, max_depth)` pair the resolver was asked for, in order.
    pub fn chain_requests(&self) -> Vec<(EntityId, usize)> {
        self.chain_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LeafSource for FixtureSource {
    async fn fetch_leaves(&self) -> Result<Vec<Leaf>, SourceError> {
        self.leaf_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_leaf_fetch.load(Ordering::SeqCst) {
            return Err(SourceError::Request("leaf listing unavailable".to_string()));
        }
        Ok(self.leaves.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn fetch_entity_link(&self, leaf_id: LeafId) -> Result<Option<EntityId>, SourceError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failing_links.lock().unwrap_or_else(|e| e.into_inner()).contains(&leaf_id) {
            return Err(SourceError::Request(format!("links for leaf {}", leaf_id)));
        }
        Ok(self.links.get(&leaf_id).copied())
    }

    async fn fetch_ancestor_chain(
        &self,
        entity_id: EntityId,
        max_depth: usize,
    ) -> Result<Vec<Entity>, SourceError> {
        self.chain_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((entity_id, max_depth));
        self.simulate_latency().await;
        if self.failing_entities.lock().unwrap_or_else(|e| e.into_inner()).contains(&entity_id) {
            return Err(SourceError::Request(format!("work item {}", entity_id)));
        }

        // Walks blindly like a remote API would; bounded only by max_depth.
        let mut walk = Vec::new();
        let mut current = self.entities.get(&entity_id);
        while let Some(entity) = current {
            walk.push(entity.clone());
            if walk.len() > max_depth {
                break;
            }
            current = entity.parent_id.and_then(|p| self.entities.get(&p));
        }
        Ok(walk)
    }
}
