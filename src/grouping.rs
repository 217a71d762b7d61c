//! Grouping engine: partitions a leaf set into display groups.
//!
//! Three partitions are supported:
//! - by author, a single pass over the leaves,
//! - by manual group membership, plus an "unassigned" bucket,
//! - by the ancestor at a requested depth of each leaf's linked entity.
//!
//! Every group is sub-partitioned by author. The ancestor partition is the
//! only one that touches the external source; a leaf whose link or chain
//! cannot be resolved is demoted to the "unresolved" bucket and never fails
//! the pass. The same assembly step backs both a fresh pass and a replay
//! from the caches, so both produce identical trees for identical inputs.

use futures::{stream, StreamExt};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::cache::{ChainCache, LeafEntityCache};
use crate::manual::ManualGroup;
use crate::model::{Entity, EntityId, GroupingMode, Leaf, LeafId};
use crate::source::LeafSource;

/// Fan-out used when no concurrency is configured.
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Author(String),
    Entity(EntityId),
    Unresolved,
    Manual(String),
    Unassigned,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Author(name) => write!(f, "author:{}", name),
            GroupKey::Entity(id) => write!(f, "entity:{}", id),
            GroupKey::Unresolved => f.write_str("unresolved"),
            GroupKey::Manual(id) => write!(f, "manual:{}", id),
            GroupKey::Unassigned => f.write_str("unassigned"),
        }
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorGroup {
    pub author_name: String,
    pub leaves: Vec<Leaf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupNode {
    pub key: GroupKey,
    pub label: String,
    pub entity: Option<Entity>,
    pub authors: Vec<AuthorGroup>,
}

impl GroupNode {
    pub fn leaf_count(&self) -> usize {
        self.authors.iter().map(|a| a.leaves.len()).sum()
    }

    /// Leaf ids per author, in display order. Handy for assertions and logs.
    pub fn leaf_ids_by_author(&self) -> Vec<(String, Vec<LeafId>)> {
        self.authors
            .iter()
            .map(|a| (a.author_name.clone(), a.leaves.iter().map(|l| l.id).collect()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingTree {
    pub mode: GroupingMode,
    pub depth: Option<usize>,
    pub groups: Vec<GroupNode>,
    pub unresolved_count: usize,
}

impl GroupingTree {
    pub fn empty(mode: GroupingMode) -> Self {
        Self {
            mode,
            depth: None,
            groups: Vec::new(),
            unresolved_count: 0,
        }
    }

    pub fn group(&self, key: &GroupKey) -> Option<&GroupNode> {
        self.groups.iter().find(|g| &g.key == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key.to_string()).collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.groups.iter().map(GroupNode::leaf_count).sum()
    }
}

fn cmp_case_insensitive(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

/// Split leaves by author, keeping input order within each author.
pub fn split_by_author(leaves: Vec<Leaf>) -> Vec<AuthorGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut authors: Vec<AuthorGroup> = Vec::new();

    for leaf in leaves {
        match index.get(&leaf.author_name) {
            Some(&i) => authors[i].leaves.push(leaf),
            None => {
                index.insert(leaf.author_name.clone(), authors.len());
                authors.push(AuthorGroup {
                    author_name: leaf.author_name.clone(),
                    leaves: vec![leaf],
                });
            }
        }
    }

    authors.sort_by(|a, b| cmp_case_insensitive(&a.author_name, &b.author_name));
    authors
}

pub fn group_by_author(leaves: &[Leaf]) -> GroupingTree {
    let groups = split_by_author(leaves.to_vec())
        .into_iter()
        .map(|author| GroupNode {
            key: GroupKey::Author(author.author_name.clone()),
            label: author.author_name.clone(),
            entity: None,
            authors: vec![author],
        })
        .collect();

    GroupingTree {
        mode: GroupingMode::ByAuthor,
        depth: None,
        groups,
        unresolved_count: 0,
    }
}

/// Manual groups ordered by name, then the unassigned bucket.
/// Member ids missing from `leaves` are skipped.
pub fn group_manual(leaves: &[Leaf], manual_groups: &[ManualGroup]) -> GroupingTree {
    let by_id: HashMap<LeafId, &Leaf> = leaves.iter().map(|l| (l.id, l)).collect();
    let mut assigned: HashSet<LeafId> = HashSet::new();

    let mut ordered: Vec<&ManualGroup> = manual_groups.iter().collect();
    ordered.sort_by(|a, b| cmp_case_insensitive(&a.name, &b.name).then(a.order.cmp(&b.order)));

    let mut groups: Vec<GroupNode> = Vec::with_capacity(ordered.len() + 1);
    for group in ordered {
        let members: Vec<Leaf> = group
            .member_leaf_ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|leaf| (*leaf).clone()))
            .collect();
        assigned.extend(members.iter().map(|l| l.id));
        groups.push(GroupNode {
            key: GroupKey::Manual(group.id.clone()),
            label: group.name.clone(),
            entity: None,
            authors: split_by_author(members),
        });
    }

    let unassigned: Vec<Leaf> = leaves
        .iter()
        .filter(|l| !assigned.contains(&l.id))
        .cloned()
        .collect();
    groups.push(GroupNode {
        key: GroupKey::Unassigned,
        label: "Unassigned".to_string(),
        entity: None,
        authors: split_by_author(unassigned),
    });

    GroupingTree {
        mode: GroupingMode::Manual,
        depth: None,
        groups,
        unresolved_count: 0,
    }
}

/// Build the ancestor tree from per-leaf placements. `None` means unresolved.
fn assemble_ancestor_tree<F>(leaves: &[Leaf], depth: usize, mut placement: F) -> GroupingTree
where
    F: FnMut(&Leaf) -> Option<Entity>,
{
    let mut buckets: HashMap<EntityId, (Entity, Vec<Leaf>)> = HashMap::new();
    let mut unresolved: Vec<Leaf> = Vec::new();

    for leaf in leaves {
        match placement(leaf) {
            Some(ancestor) => buckets
                .entry(ancestor.id)
                .or_insert_with(|| (ancestor, Vec::new()))
                .1
                .push(leaf.clone()),
            None => unresolved.push(leaf.clone()),
        }
    }

    let mut entries: Vec<(Entity, Vec<Leaf>)> = buckets.into_values().collect();
    entries.sort_by(|a, b| b.0.id.cmp(&a.0.id));

    let unresolved_count = unresolved.len();
    let mut groups: Vec<GroupNode> = entries
        .into_iter()
        .map(|(entity, members)| GroupNode {
            key: GroupKey::Entity(entity.id),
            label: entity.title.clone(),
            entity: Some(entity),
            authors: split_by_author(members),
        })
        .collect();

    if !unresolved.is_empty() {
        groups.push(GroupNode {
            key: GroupKey::Unresolved,
            label: "Unresolved".to_string(),
            entity: None,
            authors: split_by_author(unresolved),
        });
    }

    GroupingTree {
        mode: GroupingMode::ByAncestorAtDepth,
        depth: Some(depth),
        groups,
        unresolved_count,
    }
}

pub struct GroupingEngine {
    source: Arc<dyn LeafSource>,
    links: LeafEntityCache,
    chains: ChainCache,
    concurrency: usize,
}

impl GroupingEngine {
    pub fn new(source: Arc<dyn LeafSource>) -> Self {
        Self::with_caches(source, LeafEntityCache::new(), ChainCache::new())
    }

    /// Use caches built elsewhere, e.g. pre-warmed ones.
    pub fn with_caches(source: Arc<dyn LeafSource>, links: LeafEntityCache, chains: ChainCache) -> Self {
        Self {
            source,
            links,
            chains,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn source(&self) -> &Arc<dyn LeafSource> {
        &self.source
    }

    pub fn links(&self) -> &LeafEntityCache {
        &self.links
    }

    pub fn chains(&self) -> &ChainCache {
        &self.chains
    }

    /// Partition `leaves` according to `mode`. `depth` only matters for the
    /// ancestor partition, `manual_groups` only for the manual one.
    pub async fn compute_grouping(
        &self,
        leaves: &[Leaf],
        mode: GroupingMode,
        depth: usize,
        manual_groups: &[ManualGroup],
    ) -> GroupingTree {
        match mode {
            GroupingMode::ByAuthor => group_by_author(leaves),
            GroupingMode::Manual => group_manual(leaves, manual_groups),
            GroupingMode::ByAncestorAtDepth => self.group_by_ancestor(leaves, depth).await,
        }
    }

    /// Resolve every leaf's ancestor at `depth`, fetching whatever the caches
    /// lack. Cost is bounded by the number of distinct entities that need a
    /// fresh walk, not by the number of leaves.
    pub async fn group_by_ancestor(&self, leaves: &[Leaf], depth: usize) -> GroupingTree {
        let start = Instant::now();

        let leaf_ids: Vec<LeafId> = leaves.iter().map(|l| l.id).collect();
        let placements: HashMap<LeafId, Option<Entity>> = stream::iter(leaf_ids)
            .map(|leaf_id| async move { (leaf_id, self.place_leaf(leaf_id, depth).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let tree = assemble_ancestor_tree(leaves, depth, |leaf| placements.get(&leaf.id).cloned().flatten());
        info!(
            "[Grouping] Depth {}: {} groups, {} of {} leaves unresolved in {}ms",
            depth,
            tree.groups.len(),
            tree.unresolved_count,
            leaves.len(),
            start.elapsed().as_millis()
        );
        tree
    }

    /// Rebuild the ancestor tree from the caches alone. Returns `None` as
    /// soon as any leaf would need the resolver.
    pub fn replay_by_ancestor(&self, leaves: &[Leaf], depth: usize) -> Option<GroupingTree> {
        let mut placements: HashMap<LeafId, Option<Entity>> = HashMap::with_capacity(leaves.len());
        for leaf in leaves {
            let placement = match self.links.get(leaf.id)? {
                None => None,
                Some(entity_id) => self.chains.peek_at_depth(entity_id, depth)?,
            };
            placements.insert(leaf.id, placement);
        }

        debug!("[Grouping] Replayed depth {} from cache for {} leaves", depth, leaves.len());
        Some(assemble_ancestor_tree(leaves, depth, |leaf| placements.remove(&leaf.id).flatten()))
    }

    async fn place_leaf(&self, leaf_id: LeafId, depth: usize) -> Option<Entity> {
        let link = match self.links.get(leaf_id) {
            Some(link) => link,
            None => match self.source.fetch_entity_link(leaf_id).await {
                Ok(link) => {
                    self.links.set(leaf_id, link);
                    link
                }
                Err(e) => {
                    debug!("[Grouping] Leaf {} link lookup failed: {}", leaf_id, e);
                    return None;
                }
            },
        };

        let entity_id = link?;
        match self.chains.resolve_at_depth(&self.source, entity_id, depth).await {
            Ok(ancestor) => ancestor,
            Err(e) => {
                debug!("[Grouping] Leaf {} entity {} chain failed: {}", leaf_id, entity_id, e);
                None
            }
        }
    }
}
