//! In-memory caches that make regrouping cheap.
//!
//! Two layers: which entity a leaf points to ([`LeafEntityCache`]), and how
//! far up each entity's ancestor chain has been walked ([`ChainCache`]).
//! Many leaves share one entity, so the second layer is where resolver
//! traffic is saved.

mod chain;
mod leaf_entity;

pub use chain::ChainCache;
pub use leaf_entity::LeafEntityCache;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// A panicked writer leaves the maps structurally valid, so keep going.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
