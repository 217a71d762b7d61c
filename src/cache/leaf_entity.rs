use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::lock;
use crate::model::{EntityId, LeafId};

/// Memoizes which entity (if any) each leaf is linked to.
///
/// A leaf's link is treated as stable for the life of the leaf, so entries
/// are never invalidated, only evicted when the leaf disappears upstream.
/// "No link" is cached too; it is an answer, not a miss.
#[derive(Debug, Default)]
pub struct LeafEntityCache {
    links: Mutex<HashMap<LeafId, Option<EntityId>>>,
}

impl LeafEntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` on a miss, `Some(None)` for a leaf known to have no link.
    pub fn get(&self, leaf_id: LeafId) -> Option<Option<EntityId>> {
        lock(&self.links).get(&leaf_id).copied()
    }

    pub fn set(&self, leaf_id: LeafId, entity_id: Option<EntityId>) {
        lock(&self.links).insert(leaf_id, entity_id);
    }

    /// Drop entries for leaves outside `valid`. Returns how many were evicted.
    pub fn retain(&self, valid: &HashSet<LeafId>) -> usize {
        let mut links = lock(&self.links);
        let before = links.len();
        links.retain(|leaf_id, _| valid.contains(leaf_id));
        before - links.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
