//! User-curated manual groups.
//!
//! A ledger of named buckets, each holding an ordered list of leaf ids. A
//! leaf sits in at most one bucket; leaves in none are "unassigned". Every
//! mutation is applied to a copy of the state, persisted, and only then made
//! current, so a failed write leaves memory matching what is durable.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{keys, KvStore};
use crate::error::{GroupingError, Result, StoreError};
use crate::model::{Bucket, Leaf, LeafId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManualGroup {
    /// Generated, stable across renames.
    pub id: String,
    pub name: String,
    pub member_leaf_ids: Vec<LeafId>,
    pub created_at: i64,
    pub order: usize,
}

impl ManualGroup {
    pub fn contains(&self, leaf_id: LeafId) -> bool {
        self.member_leaf_ids.contains(&leaf_id)
    }
}

/// Everything persisted for manual grouping, including the id counter so
/// ids stay unique across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManualGroupingState {
    #[serde(default)]
    pub groups: Vec<ManualGroup>,
    #[serde(default)]
    pub next_id: u64,
}

impl ManualGroupingState {
    fn group_mut(&mut self, group_id: &str) -> Option<&mut ManualGroup> {
        self.groups.iter_mut().find(|g| g.id == group_id)
    }

    fn renumber(&mut self) {
        self.groups.sort_by_key(|g| g.order);
        for (i, group) in self.groups.iter_mut().enumerate() {
            group.order = i;
        }
    }

    /// Remove `leaf_id` from every group.
    fn detach(&mut self, leaf_id: LeafId) {
        for group in &mut self.groups {
            group.member_leaf_ids.retain(|id| *id != leaf_id);
        }
    }

    pub fn group_of(&self, leaf_id: LeafId) -> Option<&ManualGroup> {
        self.groups.iter().find(|g| g.contains(leaf_id))
    }
}

/// Outcome of [`ManualGroupStore::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Memberships dropped because the leaf vanished upstream.
    pub pruned: usize,
    /// Duplicate memberships dropped to restore exclusivity.
    pub repaired: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.pruned > 0 || self.repaired > 0
    }
}

pub struct ManualGroupStore {
    state: ManualGroupingState,
    kv: Arc<dyn KvStore>,
}

impl ManualGroupStore {
    /// Load the persisted ledger, or start empty when nothing is stored.
    pub fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let state = match kv.load(keys::MANUAL_GROUPS)? {
            Some(json) => serde_json::from_str(&json).map_err(StoreError::from)?,
            None => ManualGroupingState::default(),
        };
        debug!("[ManualGroups] Loaded {} groups", state.groups.len());
        Ok(Self { state, kv })
    }

    pub fn state(&self) -> &ManualGroupingState {
        &self.state
    }

    pub fn groups(&self) -> &[ManualGroup] {
        &self.state.groups
    }

    pub fn group(&self, group_id: &str) -> Option<&ManualGroup> {
        self.state.groups.iter().find(|g| g.id == group_id)
    }

    /// Persist `next` and make it current. On failure the current state is
    /// left untouched.
    fn commit(&mut self, next: ManualGroupingState) -> Result<()> {
        let json = serde_json::to_string(&next).map_err(StoreError::from)?;
        if let Err(e) = self.kv.persist(keys::MANUAL_GROUPS, &json) {
            warn!("[ManualGroups] Persist failed, keeping last durable state: {}", e);
            return Err(e.into());
        }
        self.state = next;
        Ok(())
    }

    pub fn create_group(&mut self, name: &str) -> Result<String> {
        let mut next = self.state.clone();
        next.next_id += 1;
        let id = next.next_id.to_string();
        next.groups.push(ManualGroup {
            id: id.clone(),
            name: name.to_string(),
            member_leaf_ids: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            order: next.groups.len(),
        });
        self.commit(next)?;
        debug!("[ManualGroups] Created group {} ({})", id, name);
        Ok(id)
    }

    /// No-op when the group does not exist.
    pub fn rename_group(&mut self, group_id: &str, new_name: &str) -> Result<()> {
        let mut next = self.state.clone();
        match next.group_mut(group_id) {
            Some(group) if group.name != new_name => group.name = new_name.to_string(),
            _ => return Ok(()),
        }
        self.commit(next)
    }

    /// Members of a deleted group become unassigned. No-op when missing.
    pub fn delete_group(&mut self, group_id: &str) -> Result<()> {
        if self.group(group_id).is_none() {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.groups.retain(|g| g.id != group_id);
        next.renumber();
        self.commit(next)
    }

    pub fn delete_all_groups(&mut self) -> Result<()> {
        if self.state.groups.is_empty() {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.groups.clear();
        self.commit(next)
    }

    /// Add `leaf_id` to `group_id`, dropping it from any other group.
    /// No-op if already a member.
    pub fn add_leaf(&mut self, leaf_id: LeafId, group_id: &str) -> Result<()> {
        let group = self
            .group(group_id)
            .ok_or_else(|| GroupingError::GroupNotFound(group_id.to_string()))?;
        if group.contains(leaf_id) {
            return Ok(());
        }
        let mut next = self.state.clone();
        // exclusivity holds for raw adds too
        next.detach(leaf_id);
        if let Some(group) = next.group_mut(group_id) {
            group.member_leaf_ids.push(leaf_id);
        }
        self.commit(next)
    }

    /// No-op if the leaf is not a member.
    pub fn remove_leaf(&mut self, leaf_id: LeafId, group_id: &str) -> Result<()> {
        match self.group(group_id) {
            Some(group) if group.contains(leaf_id) => {}
            _ => return Ok(()),
        }
        let mut next = self.state.clone();
        if let Some(group) = next.group_mut(group_id) {
            group.member_leaf_ids.retain(|id| *id != leaf_id);
        }
        self.commit(next)
    }

    /// Drop `leaf_id` from every group holding it, then add it to `to`.
    /// `from` names where the drag started; removal does not depend on it,
    /// which also repairs any stray duplicate membership.
    /// Returns `false` when the leaf already sat in `to` alone.
    pub fn move_leaf(&mut self, leaf_id: LeafId, from: &Bucket, to: &Bucket) -> Result<bool> {
        if let Bucket::Group(to_id) = to {
            if self.group(to_id).is_none() {
                return Err(GroupingError::GroupNotFound(to_id.clone()));
            }
        }

        let holders: Vec<&str> = self
            .state
            .groups
            .iter()
            .filter(|g| g.contains(leaf_id))
            .map(|g| g.id.as_str())
            .collect();
        let settled = match to {
            Bucket::Unassigned => holders.is_empty(),
            Bucket::Group(to_id) => holders.len() == 1 && holders[0] == to_id.as_str(),
        };
        if settled {
            return Ok(false);
        }

        let mut next = self.state.clone();
        next.detach(leaf_id);
        if let Bucket::Group(to_id) = to {
            if let Some(group) = next.group_mut(to_id) {
                group.member_leaf_ids.push(leaf_id);
            }
        }
        debug!("[ManualGroups] Moving leaf {} from {:?} to {:?}", leaf_id, from, to);
        self.commit(next)?;
        Ok(true)
    }

    /// Move every leaf by `author_name` currently in `from` to `to`.
    /// Best-effort: a failed move is logged and the rest continue.
    /// Returns how many leaves moved.
    pub fn move_author_leaves(&mut self, leaves: &[Leaf], author_name: &str, from: &Bucket, to: &Bucket) -> usize {
        let candidates: Vec<LeafId> = leaves
            .iter()
            .filter(|leaf| leaf.author_name == author_name)
            .filter(|leaf| match from {
                Bucket::Unassigned => self.state.group_of(leaf.id).is_none(),
                Bucket::Group(id) => self.group(id).map(|g| g.contains(leaf.id)).unwrap_or(false),
            })
            .map(|leaf| leaf.id)
            .collect();

        let mut moved = 0;
        for leaf_id in candidates {
            match self.move_leaf(leaf_id, from, to) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => warn!("[ManualGroups] Could not move leaf {}: {}", leaf_id, e),
            }
        }
        moved
    }

    /// Strip ids outside `valid` and repair duplicate memberships, keeping
    /// each leaf in its lowest-order group. Empty groups are kept. Persists
    /// only when something changed.
    pub fn reconcile(&mut self, valid: &HashSet<LeafId>) -> Result<ReconcileReport> {
        let mut next = self.state.clone();
        next.groups.sort_by_key(|g| g.order);

        let mut report = ReconcileReport::default();
        let mut owner: HashMap<LeafId, String> = HashMap::new();
        for group in &mut next.groups {
            let mut seen: HashSet<LeafId> = HashSet::new();
            let group_id = group.id.clone();
            group.member_leaf_ids.retain(|id| {
                if !valid.contains(id) {
                    report.pruned += 1;
                    return false;
                }
                if !seen.insert(*id) {
                    report.repaired += 1;
                    return false;
                }
                match owner.get(id) {
                    Some(kept) => {
                        warn!("[ManualGroups] Leaf {} was in groups {} and {}, keeping {}", id, kept, group_id, kept);
                        report.repaired += 1;
                        false
                    }
                    None => {
                        owner.insert(*id, group_id.clone());
                        true
                    }
                }
            });
        }

        if !report.changed() {
            return Ok(report);
        }
        self.commit(next)?;
        debug!(
            "[ManualGroups] Reconciled: pruned {} stale and {} duplicate memberships",
            report.pruned, report.repaired
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Wraps a real store; writes fail while `failing` is set.
    struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
        writes: Mutex<usize>,
    }

    impl FlakyStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: SqliteStore::in_memory().unwrap(),
                failing: AtomicBool::new(false),
                writes: Mutex::new(0),
            })
        }

        fn writes(&self) -> usize {
            *self.writes.lock().unwrap()
        }
    }

    impl KvStore for FlakyStore {
        fn persist(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            *self.writes.lock().unwrap() += 1;
            self.inner.persist(key, value)
        }

        fn load(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.load(key)
        }

        fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    fn store() -> (ManualGroupStore, Arc<FlakyStore>) {
        let kv = FlakyStore::new();
        let store = ManualGroupStore::load(kv.clone()).unwrap();
        (store, kv)
    }

    fn membership(store: &ManualGroupStore) -> Vec<(String, Vec<LeafId>)> {
        store
            .groups()
            .iter()
            .map(|g| (g.id.clone(), g.member_leaf_ids.clone()))
            .collect()
    }

    fn assert_exclusive(store: &ManualGroupStore) {
        let mut seen = HashSet::new();
        for group in store.groups() {
            for id in &group.member_leaf_ids {
                assert!(seen.insert(*id), "leaf {} appears in more than one group", id);
            }
        }
    }

    #[test]
    fn test_create_assigns_increasing_ids_and_order() {
        let (mut store, _) = store();
        let a = store.create_group("Frontend").unwrap();
        let b = store.create_group("Backend").unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("1", "2"));
        assert_eq!(store.group(&b).unwrap().order, 1);

        store.delete_group(&a).unwrap();
        let c = store.create_group("Infra").unwrap();
        assert_eq!(c, "3");
        assert_eq!(store.groups().iter().map(|g| g.order).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_state_survives_reload() {
        let (mut store, kv) = store();
        let id = store.create_group("Frontend").unwrap();
        store.move_leaf(7, &Bucket::Unassigned, &Bucket::Group(id.clone())).unwrap();
        store.rename_group(&id, "Web").unwrap();

        let reloaded = ManualGroupStore::load(kv).unwrap();
        assert_eq!(reloaded.state(), store.state());
        assert_eq!(reloaded.group(&id).unwrap().name, "Web");
    }

    #[test]
    fn test_rename_and_delete_missing_are_noops() {
        let (mut store, kv) = store();
        store.rename_group("nope", "x").unwrap();
        store.delete_group("nope").unwrap();
        store.delete_all_groups().unwrap();
        assert_eq!(kv.writes(), 0);
    }

    #[test]
    fn test_move_leaf_is_idempotent_and_exclusive() {
        let (mut store, _) = store();
        let a = store.create_group("A").unwrap();
        let b = store.create_group("B").unwrap();

        store.add_leaf(2, &b).unwrap();
        store.move_leaf(1, &Bucket::Unassigned, &Bucket::Group(a.clone())).unwrap();
        store.move_leaf(1, &Bucket::Group(a.clone()), &Bucket::Group(b.clone())).unwrap();
        let once = membership(&store);
        store.move_leaf(1, &Bucket::Group(a.clone()), &Bucket::Group(b.clone())).unwrap();
        assert_eq!(membership(&store), once);
        assert_eq!(once, vec![(a.clone(), vec![]), (b.clone(), vec![2, 1])]);

        store.move_leaf(1, &Bucket::Group(b), &Bucket::Unassigned).unwrap();
        assert!(store.state().group_of(1).is_none());
        assert_exclusive(&store);
    }

    #[test]
    fn test_move_to_missing_group_changes_nothing() {
        let (mut store, _) = store();
        let a = store.create_group("A").unwrap();
        store.add_leaf(1, &a).unwrap();

        let err = store.move_leaf(1, &Bucket::Group(a.clone()), &Bucket::Group("404".to_string()));
        assert!(matches!(err, Err(GroupingError::GroupNotFound(_))));
        assert!(store.group(&a).unwrap().contains(1));
    }

    #[test]
    fn test_add_and_remove_keep_exclusivity() {
        let (mut store, _) = store();
        let a = store.create_group("A").unwrap();
        let b = store.create_group("B").unwrap();

        store.add_leaf(1, &a).unwrap();
        store.add_leaf(1, &a).unwrap();
        store.add_leaf(1, &b).unwrap();
        store.add_leaf(2, &a).unwrap();
        store.remove_leaf(2, &b).unwrap();
        assert_exclusive(&store);
        assert_eq!(membership(&store), vec![(a.clone(), vec![2]), (b.clone(), vec![1])]);

        store.remove_leaf(2, &a).unwrap();
        assert!(store.group(&a).unwrap().member_leaf_ids.is_empty());
        assert!(matches!(store.add_leaf(3, "404"), Err(GroupingError::GroupNotFound(_))));
    }

    #[test]
    fn test_persist_failure_rolls_back() {
        let (mut store, kv) = store();
        let a = store.create_group("A").unwrap();
        let before = store.state().clone();

        kv.failing.store(true, Ordering::SeqCst);
        assert!(matches!(store.create_group("B"), Err(GroupingError::Store(_))));
        assert!(store.move_leaf(1, &Bucket::Unassigned, &Bucket::Group(a.clone())).is_err());
        assert!(store.rename_group(&a, "Renamed").is_err());
        assert_eq!(store.state(), &before);

        // next id is not burned by the failed create
        kv.failing.store(false, Ordering::SeqCst);
        assert_eq!(store.create_group("B").unwrap(), "2");
    }

    #[test]
    fn test_reconcile_prunes_but_keeps_empty_groups() {
        let (mut store, kv) = store();
        let a = store.create_group("A").unwrap();
        let b = store.create_group("B").unwrap();
        store.add_leaf(1, &a).unwrap();
        store.add_leaf(2, &b).unwrap();
        store.add_leaf(3, &b).unwrap();

        let report = store.reconcile(&HashSet::from([3, 4])).unwrap();
        assert_eq!(report, ReconcileReport { pruned: 2, repaired: 0 });
        assert_eq!(membership(&store), vec![(a, vec![]), (b, vec![3])]);

        let writes = kv.writes();
        let report = store.reconcile(&HashSet::from([3, 4])).unwrap();
        assert!(!report.changed());
        assert_eq!(kv.writes(), writes);
    }

    #[test]
    fn test_reconcile_repairs_duplicates_keeping_lowest_order() {
        let kv = FlakyStore::new();
        let corrupt = ManualGroupingState {
            groups: vec![
                ManualGroup { id: "2".into(), name: "Late".into(), member_leaf_ids: vec![5, 6], created_at: 0, order: 1 },
                ManualGroup { id: "1".into(), name: "Early".into(), member_leaf_ids: vec![5, 5], created_at: 0, order: 0 },
            ],
            next_id: 2,
        };
        kv.persist(keys::MANUAL_GROUPS, &serde_json::to_string(&corrupt).unwrap()).unwrap();

        let mut store = ManualGroupStore::load(kv).unwrap();
        let report = store.reconcile(&HashSet::from([5, 6])).unwrap();
        assert_eq!(report, ReconcileReport { pruned: 0, repaired: 2 });
        assert_eq!(
            membership(&store),
            vec![("1".to_string(), vec![5]), ("2".to_string(), vec![6])]
        );
    }

    #[test]
    fn test_move_author_leaves_is_best_effort() {
        let (mut store, _) = store();
        let a = store.create_group("A").unwrap();
        let leaves = vec![
            Leaf::new(1, "Alice", "x"),
            Leaf::new(2, "Bob", "y"),
            Leaf::new(3, "Alice", "z"),
            Leaf::new(4, "Alice", "w"),
        ];
        store.add_leaf(4, &a).unwrap();

        let moved = store.move_author_leaves(&leaves, "Alice", &Bucket::Unassigned, &Bucket::Group(a.clone()));
        assert_eq!(moved, 2);
        assert_eq!(store.group(&a).unwrap().member_leaf_ids, vec![4, 1, 3]);

        let moved = store.move_author_leaves(&leaves, "Alice", &Bucket::Group(a.clone()), &Bucket::Group("404".into()));
        assert_eq!(moved, 0);
        assert_eq!(store.group(&a).unwrap().member_leaf_ids.len(), 3);
    }

    #[test]
    fn test_move_author_leaves_counts_only_real_moves() {
        let (mut store, kv) = store();
        let a = store.create_group("A").unwrap();
        let leaves = vec![Leaf::new(1, "Alice", "x"), Leaf::new(2, "Alice", "y")];
        store.add_leaf(1, &a).unwrap();
        store.add_leaf(2, &a).unwrap();
        let before = store.state().clone();
        let writes = kv.writes();

        let moved = store.move_author_leaves(&leaves, "Alice", &Bucket::Group(a.clone()), &Bucket::Group(a.clone()));
        assert_eq!(moved, 0);
        assert_eq!(store.state(), &before);
        assert_eq!(kv.writes(), writes);

        assert!(!store.move_leaf(1, &Bucket::Group(a.clone()), &Bucket::Group(a.clone())).unwrap());
        assert!(store.move_leaf(1, &Bucket::Group(a), &Bucket::Unassigned).unwrap());
    }

    #[test]
    fn test_random_mutation_sequences_keep_exclusivity() {
        let (mut store, _) = store();
        let groups: Vec<String> = ["A", "B", "C", "D"]
            .iter()
            .map(|name| store.create_group(name).unwrap())
            .collect();

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..500 {
                let leaf_id: LeafId = rng.gen_range(1..=12);
                let group = &groups[rng.gen_range(0..groups.len())];
                match rng.gen_range(0..4) {
                    0 => store.add_leaf(leaf_id, group).unwrap(),
                    1 => store.remove_leaf(leaf_id, group).unwrap(),
                    2 => {
                        let from = match store.state().group_of(leaf_id) {
                            Some(g) => Bucket::Group(g.id.clone()),
                            None => Bucket::Unassigned,
                        };
                        store.move_leaf(leaf_id, &from, &Bucket::Group(group.clone())).unwrap();
                    }
                    _ => {
                        store.move_leaf(leaf_id, &Bucket::Group(group.clone()), &Bucket::Unassigned).unwrap();
                    }
                }
                assert_exclusive(&store);
            }
        }
    }
}
