//! Grouping coordinator: the single query and mutation surface.
//!
//! Owns the grouping engine (and through it both caches), the manual group
//! ledger and the review-status set. Consumers pull [`GroupingTree`]
//! snapshots and subscribe to a payload-free change signal.
//!
//! Hierarchy passes run in the background. Every `refresh` and `set_depth`
//! bumps a generation counter under the state lock; a pass only publishes
//! if the generation it started with is still current, so the last caller
//! wins and older passes drop their result.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::lock;
use crate::db::KvStore;
use crate::error::{GroupingError, Result};
use crate::grouping::{group_by_author, group_manual, GroupingEngine, GroupingTree};
use crate::manual::{ManualGroup, ManualGroupStore};
use crate::model::{Bucket, GroupingMode, Leaf, LeafId};
use crate::review::ReviewStatusStore;
use crate::source::LeafSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingConfig {
    pub initial_depth: usize,
    pub max_depth: usize,
    pub resolver_concurrency: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            initial_depth: 1,
            max_depth: 10,
            resolver_concurrency: crate::grouping::DEFAULT_CONCURRENCY,
        }
    }
}

/// Result of [`GroupingCoordinator::refresh`].
#[derive(Debug)]
pub enum RefreshOutcome {
    /// New leaves were published; the hierarchy pass runs on `hierarchy_pass`.
    Refreshed {
        generation: u64,
        leaf_count: usize,
        hierarchy_pass: JoinHandle<()>,
    },
    /// Another refresh was already in flight.
    Coalesced,
}

impl RefreshOutcome {
    /// Wait for the background hierarchy pass, if one was started.
    pub async fn wait(self) {
        if let RefreshOutcome::Refreshed { hierarchy_pass, .. } = self {
            if let Err(e) = hierarchy_pass.await {
                warn!("[Coordinator] Hierarchy pass aborted: {}", e);
            }
        }
    }
}

/// Result of [`GroupingCoordinator::set_depth`].
#[derive(Debug)]
pub enum DepthChange {
    /// Regrouped synchronously from the caches.
    Regrouped,
    /// The caches could not answer; a background pass is resolving.
    Resolving(JoinHandle<()>),
    /// Nothing loaded yet; the depth applies to the next refresh.
    Deferred,
}

impl DepthChange {
    pub async fn wait(self) {
        if let DepthChange::Resolving(pass) = self {
            if let Err(e) = pass.await {
                warn!("[Coordinator] Hierarchy pass aborted: {}", e);
            }
        }
    }
}

struct Published {
    mode: GroupingMode,
    depth: usize,
    generation: u64,
    loaded: bool,
    /// Switch back to the ancestor view once the running pass publishes.
    restore_hierarchy: bool,
    leaves: Arc<Vec<Leaf>>,
    tree: Arc<GroupingTree>,
    /// Latest ancestor tree; `None` while a pass is outstanding.
    hierarchy: Option<Arc<GroupingTree>>,
    /// Deepest depth any completed pass has resolved.
    global_max_depth: Option<usize>,
    unresolved_count: usize,
}

struct Inner {
    engine: GroupingEngine,
    config: GroupingConfig,
    state: Mutex<Published>,
    manual: Mutex<ManualGroupStore>,
    reviews: Mutex<ReviewStatusStore>,
    refreshing: AtomicBool,
    changed: watch::Sender<()>,
}

/// Clears the in-flight flag even if the refresh unwinds.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct GroupingCoordinator {
    inner: Arc<Inner>,
}

impl GroupingCoordinator {
    pub fn new(engine: GroupingEngine, kv: Arc<dyn KvStore>, config: GroupingConfig) -> Result<Self> {
        let manual = ManualGroupStore::load(Arc::clone(&kv))?;
        let reviews = ReviewStatusStore::load(kv)?;
        let (changed, _) = watch::channel(());

        let state = Published {
            mode: GroupingMode::ByAuthor,
            depth: config.initial_depth.min(config.max_depth),
            generation: 0,
            loaded: false,
            restore_hierarchy: false,
            leaves: Arc::new(Vec::new()),
            tree: Arc::new(GroupingTree::empty(GroupingMode::ByAuthor)),
            hierarchy: None,
            global_max_depth: None,
            unresolved_count: 0,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                config,
                state: Mutex::new(state),
                manual: Mutex::new(manual),
                reviews: Mutex::new(reviews),
                refreshing: AtomicBool::new(false),
                changed,
            }),
        })
    }

    /// Coordinator with fresh, empty caches over `source`.
    pub fn from_source(source: Arc<dyn LeafSource>, kv: Arc<dyn KvStore>, config: GroupingConfig) -> Result<Self> {
        let engine = GroupingEngine::new(source).with_concurrency(config.resolver_concurrency);
        Self::new(engine, kv, config)
    }

    pub fn engine(&self) -> &GroupingEngine {
        &self.inner.engine
    }

    // ==================== Queries ====================

    pub fn grouping_tree(&self) -> Arc<GroupingTree> {
        Arc::clone(&lock(&self.inner.state).tree)
    }

    pub fn mode(&self) -> GroupingMode {
        lock(&self.inner.state).mode
    }

    pub fn depth(&self) -> usize {
        lock(&self.inner.state).depth
    }

    pub fn hierarchy_ready(&self) -> bool {
        lock(&self.inner.state).hierarchy.is_some()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner.state).generation
    }

    /// Leaves demoted to "unresolved" by the last published hierarchy pass.
    pub fn unresolved_count(&self) -> usize {
        lock(&self.inner.state).unresolved_count
    }

    pub fn leaves(&self) -> Arc<Vec<Leaf>> {
        Arc::clone(&lock(&self.inner.state).leaves)
    }

    pub fn manual_groups(&self) -> Vec<ManualGroup> {
        lock(&self.inner.manual).groups().to_vec()
    }

    /// Fires after every publish. Carries no payload; re-query on change.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.inner.changed.subscribe()
    }

    fn notify(&self) {
        self.inner.changed.send_replace(());
    }

    // ==================== Refresh and depth ====================

    /// Fetch the leaf set, reconcile persisted state against it, publish the
    /// cheap grouping right away and start the hierarchy pass in the
    /// background. A call made while another is fetching is coalesced.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        if self
            .inner
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[Coordinator] Refresh already in flight, coalescing");
            return Ok(RefreshOutcome::Coalesced);
        }
        let _guard = RefreshGuard(&self.inner.refreshing);

        let leaves = match self.inner.engine.source().fetch_leaves().await {
            Ok(leaves) => leaves,
            Err(e) => {
                warn!("[Coordinator] Refresh failed, keeping previous grouping: {}", e);
                return Err(GroupingError::Fetch(e));
            }
        };

        let valid: HashSet<LeafId> = leaves.iter().map(|l| l.id).collect();
        let manual_groups = {
            let mut manual = lock(&self.inner.manual);
            if let Err(e) = manual.reconcile(&valid) {
                warn!("[Coordinator] Manual group reconcile not persisted: {}", e);
            }
            manual.groups().to_vec()
        };
        if let Err(e) = lock(&self.inner.reviews).reconcile(&valid) {
            warn!("[Coordinator] Review status reconcile not persisted: {}", e);
        }
        let evicted = self.inner.engine.links().retain(&valid);
        if evicted > 0 {
            debug!("[Coordinator] Evicted {} stale leaf links", evicted);
        }

        let leaves = Arc::new(leaves);
        let leaf_count = leaves.len();
        let (generation, depth) = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.loaded = true;
            state.leaves = Arc::clone(&leaves);
            state.hierarchy = None;
            if state.mode == GroupingMode::ByAncestorAtDepth {
                state.restore_hierarchy = true;
                state.mode = GroupingMode::ByAuthor;
            }
            state.tree = Arc::new(match state.mode {
                GroupingMode::Manual => group_manual(&leaves, &manual_groups),
                _ => group_by_author(&leaves),
            });
            (state.generation, state.depth)
        };
        self.notify();
        info!("[Coordinator] Refreshed {} leaves (generation {})", leaf_count, generation);

        let hierarchy_pass = self.spawn_hierarchy_pass(generation, leaves, depth);
        Ok(RefreshOutcome::Refreshed { generation, leaf_count, hierarchy_pass })
    }

    /// Change the hierarchy depth. Depths already covered by a completed
    /// pass are regrouped from the caches on the spot; anything else starts
    /// a background pass.
    pub fn set_depth(&self, depth: usize) -> Result<DepthChange> {
        if depth > self.inner.config.max_depth {
            return Err(GroupingError::DepthOutOfRange { requested: depth, max: self.inner.config.max_depth });
        }

        let (generation, leaves, covered) = {
            let mut state = lock(&self.inner.state);
            state.depth = depth;
            if !state.loaded {
                return Ok(DepthChange::Deferred);
            }
            state.generation += 1;
            let covered = state.global_max_depth.is_some_and(|max| max >= depth);
            (state.generation, Arc::clone(&state.leaves), covered)
        };

        if covered {
            match self.inner.engine.replay_by_ancestor(&leaves, depth) {
                Some(tree) => {
                    self.publish_hierarchy(generation, depth, tree);
                    return Ok(DepthChange::Regrouped);
                }
                None => debug!("[Coordinator] Cache cannot answer depth {}, resolving", depth),
            }
        }

        let fell_back = {
            let mut state = lock(&self.inner.state);
            state.hierarchy = None;
            if state.mode == GroupingMode::ByAncestorAtDepth {
                state.restore_hierarchy = true;
                state.mode = GroupingMode::ByAuthor;
                state.tree = Arc::new(group_by_author(&state.leaves));
                true
            } else {
                false
            }
        };
        if fell_back {
            self.notify();
        }

        Ok(DepthChange::Resolving(self.spawn_hierarchy_pass(generation, leaves, depth)))
    }

    fn spawn_hierarchy_pass(&self, generation: u64, leaves: Arc<Vec<Leaf>>, depth: usize) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let tree = coordinator.inner.engine.group_by_ancestor(&leaves, depth).await;
            coordinator.publish_hierarchy(generation, depth, tree);
        })
    }

    /// Publish an ancestor tree unless a newer generation has started.
    fn publish_hierarchy(&self, generation: u64, depth: usize, tree: GroupingTree) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                debug!(
                    "[Coordinator] Dropping stale hierarchy pass (generation {} < {})",
                    generation, state.generation
                );
                return false;
            }

            let tree = Arc::new(tree);
            state.unresolved_count = tree.unresolved_count;
            state.global_max_depth = Some(state.global_max_depth.map_or(depth, |max| max.max(depth)));
            state.hierarchy = Some(Arc::clone(&tree));
            if state.restore_hierarchy {
                state.restore_hierarchy = false;
                state.mode = GroupingMode::ByAncestorAtDepth;
            }
            if state.mode == GroupingMode::ByAncestorAtDepth {
                state.tree = tree;
            }
        }
        self.notify();
        true
    }

    // ==================== Mode ====================

    /// Switch the published view. Switching to the ancestor view while its
    /// pass is outstanding is rejected and leaves the mode unchanged.
    pub fn set_mode(&self, mode: GroupingMode) -> Result<()> {
        let manual_groups = match mode {
            GroupingMode::Manual => self.manual_groups(),
            _ => Vec::new(),
        };

        {
            let mut state = lock(&self.inner.state);
            let tree = match mode {
                GroupingMode::ByAncestorAtDepth => match &state.hierarchy {
                    Some(tree) => Arc::clone(tree),
                    None => {
                        debug!("[Coordinator] Hierarchy still loading, staying in {}", state.mode);
                        return Err(GroupingError::HierarchyLoading);
                    }
                },
                GroupingMode::ByAuthor => Arc::new(group_by_author(&state.leaves)),
                GroupingMode::Manual => Arc::new(group_manual(&state.leaves, &manual_groups)),
            };
            state.mode = mode;
            state.restore_hierarchy = false;
            state.tree = tree;
        }
        self.notify();
        Ok(())
    }

    // ==================== Manual groups ====================

    fn with_manual<T>(&self, apply: impl FnOnce(&mut ManualGroupStore) -> Result<T>) -> Result<T> {
        let (result, groups) = {
            let mut manual = lock(&self.inner.manual);
            let result = apply(&mut manual);
            (result, manual.groups().to_vec())
        };
        let value = result?;

        let republished = {
            let mut state = lock(&self.inner.state);
            if state.mode == GroupingMode::Manual {
                state.tree = Arc::new(group_manual(&state.leaves, &groups));
                true
            } else {
                false
            }
        };
        if republished {
            self.notify();
        }
        Ok(value)
    }

    pub fn create_group(&self, name: &str) -> Result<String> {
        self.with_manual(|manual| manual.create_group(name))
    }

    pub fn rename_group(&self, group_id: &str, new_name: &str) -> Result<()> {
        self.with_manual(|manual| manual.rename_group(group_id, new_name))
    }

    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        self.with_manual(|manual| manual.delete_group(group_id))
    }

    pub fn delete_all_groups(&self) -> Result<()> {
        self.with_manual(|manual| manual.delete_all_groups())
    }

    pub fn add_leaf(&self, leaf_id: LeafId, group_id: &str) -> Result<()> {
        self.with_manual(|manual| manual.add_leaf(leaf_id, group_id))
    }

    pub fn remove_leaf(&self, leaf_id: LeafId, group_id: &str) -> Result<()> {
        self.with_manual(|manual| manual.remove_leaf(leaf_id, group_id))
    }

    /// Drag-and-drop entry point for a single leaf. Returns whether anything moved.
    pub fn move_leaf(&self, leaf_id: LeafId, from: &Bucket, to: &Bucket) -> Result<bool> {
        self.with_manual(|manual| manual.move_leaf(leaf_id, from, to))
    }

    /// Drag-and-drop entry point for an author node. Returns how many leaves moved.
    pub fn move_author_leaves(&self, author_name: &str, from: &Bucket, to: &Bucket) -> Result<usize> {
        let leaves = self.leaves();
        self.with_manual(|manual| Ok(manual.move_author_leaves(&leaves, author_name, from, to)))
    }

    // ==================== Review status ====================

    pub fn mark_reviewed(&self, leaf_id: LeafId) -> Result<()> {
        lock(&self.inner.reviews).mark_reviewed(leaf_id)
    }

    pub fn unmark_reviewed(&self, leaf_id: LeafId) -> Result<()> {
        lock(&self.inner.reviews).unmark_reviewed(leaf_id)
    }

    pub fn is_reviewed(&self, leaf_id: LeafId) -> bool {
        lock(&self.inner.reviews).is_reviewed(leaf_id)
    }

    pub fn reviewed_leaves(&self) -> Vec<LeafId> {
        lock(&self.inner.reviews).reviewed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::grouping::GroupKey;
    use crate::model::{Entity, EntityId};
    use crate::source::{Fixture, FixtureSource};
    use std::collections::HashMap;
    use std::time::Duration;

    fn entity(id: EntityId, parent: Option<EntityId>) -> Entity {
        Entity {
            id,
            title: format!("Work item {}", id),
            entity_type: "Epic".to_string(),
            parent_id: parent,
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            leaves: vec![
                Leaf::new(1, "Alice", "one"),
                Leaf::new(2, "Bob", "two"),
                Leaf::new(3, "Alice", "three"),
            ],
            links: HashMap::from([(1, 100), (2, 100), (3, 200)]),
            entities: vec![
                entity(100, Some(900)),
                entity(900, Some(9000)),
                entity(9000, None),
                entity(200, None),
            ],
        }
    }

    fn setup_with(source: FixtureSource) -> (GroupingCoordinator, Arc<FixtureSource>) {
        let source = Arc::new(source);
        let kv: Arc<dyn KvStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let coordinator = GroupingCoordinator::from_source(source.clone(), kv, GroupingConfig::default()).unwrap();
        (coordinator, source)
    }

    fn setup() -> (GroupingCoordinator, Arc<FixtureSource>) {
        setup_with(FixtureSource::new(fixture()))
    }

    fn leaf_ids(coordinator: &GroupingCoordinator, key: &GroupKey) -> Vec<(String, Vec<LeafId>)> {
        coordinator
            .grouping_tree()
            .group(key)
            .map(|g| g.leaf_ids_by_author())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (coordinator, _) = setup();
        assert_eq!(coordinator.mode(), GroupingMode::ByAuthor);
        assert_eq!(coordinator.depth(), 1);
        assert!(!coordinator.hierarchy_ready());
        assert!(coordinator.grouping_tree().groups.is_empty());
        assert!(matches!(coordinator.set_mode(GroupingMode::ByAncestorAtDepth), Err(GroupingError::HierarchyLoading)));
    }

    #[tokio::test]
    async fn test_refresh_publishes_authors_then_hierarchy() {
        let (coordinator, _) = setup();
        let mut changes = coordinator.subscribe();

        let outcome = coordinator.refresh().await.unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();
        assert_eq!(coordinator.grouping_tree().keys(), vec!["author:Alice", "author:Bob"]);
        assert!(!coordinator.hierarchy_ready());

        outcome.wait().await;
        assert!(changes.has_changed().unwrap());
        assert!(coordinator.hierarchy_ready());
        assert_eq!(coordinator.mode(), GroupingMode::ByAuthor);
        assert_eq!(coordinator.unresolved_count(), 1);

        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        let tree = coordinator.grouping_tree();
        assert_eq!(tree.keys(), vec!["entity:900", "unresolved"]);
        assert_eq!(
            leaf_ids(&coordinator, &GroupKey::Entity(900)),
            vec![("Alice".to_string(), vec![1]), ("Bob".to_string(), vec![2])]
        );
    }

    #[tokio::test]
    async fn test_depth_switch_within_cache_is_synchronous() {
        let (coordinator, source) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        let calls = source.chain_calls();

        let change = coordinator.set_depth(0).unwrap();
        assert!(matches!(change, DepthChange::Regrouped));
        assert_eq!(source.chain_calls(), calls);
        assert_eq!(coordinator.grouping_tree().keys(), vec!["entity:200", "entity:100"]);
        assert_eq!(coordinator.grouping_tree().depth, Some(0));

        // back up to 1: still covered
        assert!(matches!(coordinator.set_depth(1).unwrap(), DepthChange::Regrouped));
        assert_eq!(source.chain_calls(), calls);
        assert_eq!(coordinator.grouping_tree().keys(), vec!["entity:900", "unresolved"]);
    }

    #[tokio::test]
    async fn test_deeper_depth_resolves_in_background() {
        let (coordinator, source) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        let calls = source.chain_calls();

        let change = coordinator.set_depth(2).unwrap();
        // falls back to authors until the pass lands
        assert_eq!(coordinator.mode(), GroupingMode::ByAuthor);
        assert!(!coordinator.hierarchy_ready());
        change.wait().await;

        assert_eq!(coordinator.mode(), GroupingMode::ByAncestorAtDepth);
        assert_eq!(coordinator.grouping_tree().keys(), vec!["entity:9000", "unresolved"]);
        // only entity 100's missing level was fetched; 200 is a known root
        assert_eq!(source.chain_calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_refresh_restores_hierarchy_mode() {
        let (coordinator, _) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();

        let outcome = coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.mode(), GroupingMode::ByAuthor);
        assert!(matches!(coordinator.set_mode(GroupingMode::ByAncestorAtDepth), Err(GroupingError::HierarchyLoading)));
        assert_eq!(coordinator.mode(), GroupingMode::ByAuthor);

        outcome.wait().await;
        assert_eq!(coordinator.mode(), GroupingMode::ByAncestorAtDepth);
        assert_eq!(coordinator.grouping_tree().mode, GroupingMode::ByAncestorAtDepth);
    }

    #[tokio::test]
    async fn test_explicit_mode_choice_cancels_restore() {
        let (coordinator, _) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();

        let outcome = coordinator.refresh().await.unwrap();
        coordinator.set_mode(GroupingMode::Manual).unwrap();
        outcome.wait().await;
        assert_eq!(coordinator.mode(), GroupingMode::Manual);
        assert!(coordinator.hierarchy_ready());
    }

    #[tokio::test]
    async fn test_stale_pass_is_dropped() {
        let (coordinator, _) = setup_with(FixtureSource::new(fixture()).with_latency(Duration::from_millis(10)));
        let first = coordinator.refresh().await.unwrap();
        let second = coordinator.set_depth(2).unwrap();

        first.wait().await;
        assert!(!coordinator.hierarchy_ready());

        second.wait().await;
        assert!(coordinator.hierarchy_ready());
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        assert_eq!(coordinator.grouping_tree().depth, Some(2));
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_coalesce() {
        let (coordinator, source) = setup_with(FixtureSource::new(fixture()).with_latency(Duration::from_millis(10)));

        let (a, b) = tokio::join!(coordinator.refresh(), coordinator.refresh());
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, RefreshOutcome::Coalesced)).count(), 1);
        assert_eq!(source.leaf_fetches(), 1);

        for outcome in outcomes {
            outcome.wait().await;
        }
        // the flag is released once the refresh returns
        assert!(matches!(coordinator.refresh().await.unwrap(), RefreshOutcome::Refreshed { .. }));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous_tree() {
        let (coordinator, source) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        let before = coordinator.grouping_tree();
        let generation = coordinator.generation();

        source.set_fail_leaf_fetch(true);
        assert!(matches!(coordinator.refresh().await, Err(GroupingError::Fetch(_))));
        assert!(Arc::ptr_eq(&before, &coordinator.grouping_tree()));
        assert_eq!(coordinator.generation(), generation);
        assert!(coordinator.hierarchy_ready());
    }

    #[tokio::test]
    async fn test_refresh_prunes_vanished_leaves_from_groups() {
        let (coordinator, source) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        let group = coordinator.create_group("Sprint").unwrap();
        coordinator.move_leaf(3, &Bucket::Unassigned, &Bucket::Group(group.clone())).unwrap();
        coordinator.mark_reviewed(3).unwrap();

        source.set_leaves(vec![Leaf::new(1, "Alice", "one"), Leaf::new(2, "Bob", "two")]);
        coordinator.refresh().await.unwrap().wait().await;

        let groups = coordinator.manual_groups();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].member_leaf_ids.is_empty());
        assert!(!coordinator.is_reviewed(3));
        assert_eq!(coordinator.engine().links().get(3), None);
    }

    #[tokio::test]
    async fn test_manual_mode_republishes_on_mutation() {
        let (coordinator, _) = setup();
        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::Manual).unwrap();
        assert_eq!(coordinator.grouping_tree().keys(), vec!["unassigned"]);

        let mut changes = coordinator.subscribe();
        let group = coordinator.create_group("Mine").unwrap();
        assert!(changes.has_changed().unwrap());

        let moved = coordinator
            .move_author_leaves("Alice", &Bucket::Unassigned, &Bucket::Group(group.clone()))
            .unwrap();
        assert_eq!(moved, 2);
        let key = GroupKey::Manual(group);
        assert_eq!(leaf_ids(&coordinator, &key), vec![("Alice".to_string(), vec![1, 3])]);
        assert_eq!(
            leaf_ids(&coordinator, &GroupKey::Unassigned),
            vec![("Bob".to_string(), vec![2])]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_counts_unresolved() {
        let source = FixtureSource::new(fixture());
        source.fail_entity(200);
        let (coordinator, _) = setup_with(source);
        coordinator.set_depth(0).unwrap();
        coordinator.refresh().await.unwrap().wait().await;

        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        assert_eq!(coordinator.grouping_tree().keys(), vec!["entity:100", "unresolved"]);
        assert_eq!(coordinator.unresolved_count(), 1);
    }

    #[tokio::test]
    async fn test_depth_validation_and_deferral() {
        let (coordinator, source) = setup();
        assert!(matches!(
            coordinator.set_depth(11),
            Err(GroupingError::DepthOutOfRange { requested: 11, max: 10 })
        ));
        assert!(matches!(coordinator.set_depth(2).unwrap(), DepthChange::Deferred));
        assert_eq!(coordinator.depth(), 2);
        assert_eq!(source.chain_calls(), 0);

        coordinator.refresh().await.unwrap().wait().await;
        coordinator.set_mode(GroupingMode::ByAncestorAtDepth).unwrap();
        assert_eq!(coordinator.grouping_tree().depth, Some(2));
    }
}
