use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::lock;
use crate::error::SourceError;
use crate::model::{AncestorChain, Entity, EntityId};
use crate::source::LeafSource;

type PendingChain = Shared<BoxFuture<'static, Result<AncestorChain, SourceError>>>;

/// Memoizes, per entity, the deepest ancestor chain fetched so far.
///
/// The cache keeps the union of every depth ever requested: asking for a
/// shallower depth than one already walked never reaches the resolver, and
/// asking for a deeper one only fetches the levels above the cached top.
///
/// Concurrent requests for the same uncached entity share one in-flight
/// fetch. The fetch writes its chain into the cache and clears its pending
/// entry before it completes, so a waiter that wakes up always sees the
/// result in the cache.
#[derive(Clone, Default)]
pub struct ChainCache {
    chains: Arc<Mutex<HashMap<EntityId, AncestorChain>>>,
    pending: Arc<Mutex<HashMap<EntityId, PendingChain>>>,
}

impl ChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<AncestorChain> {
        lock(&self.chains).get(&entity_id).cloned()
    }

    /// Store `chain` unless the cache already holds a longer one.
    pub fn set(&self, entity_id: EntityId, chain: AncestorChain) {
        store_longer(&self.chains, entity_id, chain);
    }

    /// Deepest level cached for `entity_id`; `None` when nothing is cached.
    pub fn max_cached_depth(&self, entity_id: EntityId) -> Option<usize> {
        lock(&self.chains).get(&entity_id).and_then(AncestorChain::max_depth)
    }

    pub fn len(&self) -> usize {
        lock(&self.chains).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer from the cache alone. `None` means the resolver would be needed.
    pub fn peek_at_depth(&self, entity_id: EntityId, depth: usize) -> Option<Option<Entity>> {
        let chains = lock(&self.chains);
        chains
            .get(&entity_id)
            .and_then(|chain| chain.answer(depth))
            .map(|answer| answer.cloned())
    }

    /// The ancestor of `entity_id` at `depth`, or `None` when the chain ends
    /// (or stops in a cycle) before that depth.
    pub async fn resolve_at_depth(
        &self,
        source: &Arc<dyn LeafSource>,
        entity_id: EntityId,
        depth: usize,
    ) -> Result<Option<Entity>, SourceError> {
        loop {
            let (fetch, owner) = {
                // pending before chains; the fetch never holds both
                let mut pending = lock(&self.pending);
                let base = {
                    let chains = lock(&self.chains);
                    let cached = chains.get(&entity_id);
                    if let Some(answer) = cached.and_then(|chain| chain.answer(depth)) {
                        return Ok(answer.cloned());
                    }
                    cached.cloned()
                };
                match pending.get(&entity_id) {
                    Some(inflight) => (inflight.clone(), false),
                    None => {
                        let fetch = self.start_fetch(Arc::clone(source), entity_id, depth, base);
                        pending.insert(entity_id, fetch.clone());
                        (fetch, true)
                    }
                }
            };

            let chain = fetch.await?;
            match chain.answer(depth) {
                Some(answer) => return Ok(answer.cloned()),
                // the resolver returned fewer levels than asked for
                None if owner => return Ok(None),
                // someone else's fetch was shallower than what we need
                None => continue,
            }
        }
    }

    fn start_fetch(
        &self,
        source: Arc<dyn LeafSource>,
        entity_id: EntityId,
        depth: usize,
        base: Option<AncestorChain>,
    ) -> PendingChain {
        let chains = Arc::clone(&self.chains);
        let pending = Arc::clone(&self.pending);

        async move {
            let result = fetch_levels(source.as_ref(), entity_id, depth, base).await;
            let result = result.map(|chain| store_longer(&chains, entity_id, chain));
            lock(&pending).remove(&entity_id);
            result
        }
        .boxed()
        .shared()
    }
}

/// Returns whichever chain ends up cached.
fn store_longer(
    chains: &Mutex<HashMap<EntityId, AncestorChain>>,
    entity_id: EntityId,
    chain: AncestorChain,
) -> AncestorChain {
    let mut chains = lock(chains);
    match chains.get(&entity_id) {
        Some(existing) if !chain.supersedes(existing) => existing.clone(),
        _ => {
            chains.insert(entity_id, chain.clone());
            chain
        }
    }
}

/// Fetch only the levels `base` is missing, up to `depth`.
async fn fetch_levels(
    source: &dyn LeafSource,
    entity_id: EntityId,
    depth: usize,
    base: Option<AncestorChain>,
) -> Result<AncestorChain, SourceError> {
    let mut chain = match base {
        Some(chain) if !chain.is_empty() => chain,
        _ => {
            debug!("[ChainCache] Fetching entity {} up to depth {}", entity_id, depth);
            let walk = source.fetch_ancestor_chain(entity_id, depth).await?;
            check_walk_start(entity_id, &walk)?;
            return Ok(AncestorChain::from_walk(walk, depth));
        }
    };

    let Some(parent_id) = chain.last().and_then(|top| top.parent_id) else {
        return Ok(chain);
    };
    let remaining = depth.saturating_sub(chain.len());
    debug!(
        "[ChainCache] Extending entity {} from depth {} via parent {} ({} more levels)",
        entity_id,
        chain.len() - 1,
        parent_id,
        remaining + 1
    );
    let walk = source.fetch_ancestor_chain(parent_id, remaining).await?;
    check_walk_start(parent_id, &walk)?;
    chain.extend_walk(walk, depth);
    Ok(chain)
}

fn check_walk_start(requested: EntityId, walk: &[Entity]) -> Result<(), SourceError> {
    match walk.first() {
        Some(first) if first.id != requested => Err(SourceError::Malformed {
            entity_id: requested,
            reason: format!("chain starts at {}", first.id),
        }),
        _ => Ok(()),
    }
}
