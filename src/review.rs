//! Persisted set of leaves the user has marked as reviewed.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{keys, KvStore};
use crate::error::{Result, StoreError};
use crate::model::LeafId;

pub struct ReviewStatusStore {
    reviewed: BTreeSet<LeafId>,
    kv: Arc<dyn KvStore>,
}

impl ReviewStatusStore {
    pub fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let reviewed = match kv.load(keys::REVIEWED_LEAVES)? {
            Some(json) => serde_json::from_str(&json).map_err(StoreError::from)?,
            None => BTreeSet::new(),
        };
        Ok(Self { reviewed, kv })
    }

    pub fn is_reviewed(&self, leaf_id: LeafId) -> bool {
        self.reviewed.contains(&leaf_id)
    }

    pub fn reviewed(&self) -> Vec<LeafId> {
        self.reviewed.iter().copied().collect()
    }

    fn commit(&mut self, next: BTreeSet<LeafId>) -> Result<()> {
        let json = serde_json::to_string(&next).map_err(StoreError::from)?;
        if let Err(e) = self.kv.persist(keys::REVIEWED_LEAVES, &json) {
            warn!("[Reviews] Persist failed, keeping last durable state: {}", e);
            return Err(e.into());
        }
        self.reviewed = next;
        Ok(())
    }

    pub fn mark_reviewed(&mut self, leaf_id: LeafId) -> Result<()> {
        if self.is_reviewed(leaf_id) {
            return Ok(());
        }
        let mut next = self.reviewed.clone();
        next.insert(leaf_id);
        self.commit(next)
    }

    pub fn unmark_reviewed(&mut self, leaf_id: LeafId) -> Result<()> {
        if !self.is_reviewed(leaf_id) {
            return Ok(());
        }
        let mut next = self.reviewed.clone();
        next.remove(&leaf_id);
        self.commit(next)
    }

    /// Forget leaves that vanished upstream. Returns how many were dropped.
    pub fn reconcile(&mut self, valid: &HashSet<LeafId>) -> Result<usize> {
        let next: BTreeSet<LeafId> = self.reviewed.iter().copied().filter(|id| valid.contains(id)).collect();
        let dropped = self.reviewed.len() - next.len();
        if dropped > 0 {
            self.commit(next)?;
            debug!("[Reviews] Dropped {} vanished leaves", dropped);
        }
        Ok(dropped)
    }
}
