use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

pub type LeafId = i64;
pub type EntityId = i64;

/// A review request, the unit being grouped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Leaf {
    pub id: LeafId,
    pub author_name: String,
    #[serde(default)]
    pub title: String,
}

impl Leaf {
    pub fn new(id: LeafId, author_name: &str, title: &str) -> Self {
        Self {
            id,
            author_name: author_name.to_string(),
            title: title.to_string(),
        }
    }
}

/// A node in the external work item hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub title: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
}

/// An entity followed by its ancestors, indexed by depth.
///
/// `terminated` is set once the walk is known to be complete: the last
/// entity has no parent, the resolver knew nothing about the entity, or the
/// walk ran into an entity it had already visited. A terminated chain can
/// answer every depth without another resolver call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AncestorChain {
    levels: Vec<Entity>,
    terminated: bool,
}

impl AncestorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from raw resolver output, keeping at most
    /// `max_depth + 1` levels.
    pub fn from_walk(walk: Vec<Entity>, max_depth: usize) -> Self {
        let mut chain = Self::new();
        chain.extend_walk(walk, max_depth);
        chain
    }

    /// Append a continuation walk that starts at the parent of the current
    /// deepest level. Stops at the first entity already present in the chain.
    /// An empty walk means the resolver knows nothing further up.
    pub fn extend_walk(&mut self, walk: Vec<Entity>, max_depth: usize) {
        if walk.is_empty() {
            self.terminated = true;
            return;
        }
        let mut visited: HashSet<EntityId> = self.levels.iter().map(|e| e.id).collect();

        for entity in walk {
            if self.levels.len() > max_depth {
                break;
            }
            if !visited.insert(entity.id) {
                self.terminated = true;
                return;
            }
            self.levels.push(entity);
        }

        // A parent already in the chain never yields a new level.
        let walk_ended = match self.levels.last().map(|e| e.parent_id) {
            Some(None) => true,
            Some(Some(parent)) => visited.contains(&parent),
            None => false,
        };
        if walk_ended {
            self.terminated = true;
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Deepest level held, `None` for an empty chain.
    pub fn max_depth(&self) -> Option<usize> {
        self.levels.len().checked_sub(1)
    }

    pub fn at(&self, depth: usize) -> Option<&Entity> {
        self.levels.get(depth)
    }

    pub fn last(&self) -> Option<&Entity> {
        self.levels.last()
    }

    pub fn levels(&self) -> &[Entity] {
        &self.levels
    }

    /// What this chain knows about `depth`:
    /// `Some(Some(entity))` when the level is held, `Some(None)` when the
    /// chain is terminated short of it, `None` when more levels must be fetched.
    pub fn answer(&self, depth: usize) -> Option<Option<&Entity>> {
        match self.levels.get(depth) {
            Some(entity) => Some(Some(entity)),
            None if self.terminated => Some(None),
            None => None,
        }
    }

    /// Whether this chain holds strictly more information than `other`.
    pub fn supersedes(&self, other: &AncestorChain) -> bool {
        self.levels.len() > other.levels.len()
            || (self.levels.len() == other.levels.len() && self.terminated && !other.terminated)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum GroupingMode {
    #[default]
    ByAuthor,
    ByAncestorAtDepth,
    Manual,
}

impl GroupingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingMode::ByAuthor => "author",
            GroupingMode::ByAncestorAtDepth => "ancestor",
            GroupingMode::Manual => "manual",
        }
    }
}

impl FromStr for GroupingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(GroupingMode::ByAuthor),
            "ancestor" => Ok(GroupingMode::ByAncestorAtDepth),
            "manual" => Ok(GroupingMode::Manual),
            other => Err(format!("unknown mode '{}' (author, ancestor, manual)", other)),
        }
    }
}

impl fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source or target of a manual move: a named group or the implicit
/// "unassigned" bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bucket {
    Unassigned,
    Group(String),
}

impl Bucket {
    pub fn parse(s: &str) -> Self {
        if s == "unassigned" {
            Bucket::Unassigned
        } else {
            Bucket::Group(s.to_string())
        }
    }
}
