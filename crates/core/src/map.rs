//! Mutex-guarded ordered map of live middleware objects.

use std::collections::BTreeMap;
use std::mem;

use gantry_middleware::HandleId;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// An ordered map keyed by [`HandleId`], serialized by a single mutex.
///
/// Each session keeps one of these per object kind. The operations worth
/// calling out:
///
/// - [`SyncMap::for_one`] runs its callback *with the map lock held*, which
///   is what makes "neutralize the callbacks of an object that is still
///   indexed" atomic with respect to a concurrent remove.
/// - [`SyncMap::drain`] empties the map under the lock but runs the
///   per-value callback outside it, so per-element work (which typically
///   enqueues onto a session queue) never runs under the map mutex.
pub struct SyncMap<V> {
    tree: Mutex<BTreeMap<HandleId, V>>,
}

impl<V> SyncMap<V> {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add an entry. Keys are unique by caller contract.
    pub fn insert(&self, key: HandleId, value: V) {
        let prev = self.tree.lock().insert(key, value);
        debug_assert!(prev.is_none(), "duplicate key {key} inserted");
    }

    /// Detach and return the value for `key`, if present.
    pub fn remove(&self, key: HandleId) -> Option<V> {
        self.tree.lock().remove(&key)
    }

    /// Look up `key` and invoke `f` on the value while the map lock is
    /// held. Returns [`Error::NotFound`] if the key is absent.
    pub fn for_one(&self, key: HandleId, f: impl FnOnce(&V) -> Result<()>) -> Result<()> {
        let tree = self.tree.lock();
        match tree.get(&key) {
            Some(value) => f(value),
            None => Err(Error::NotFound),
        }
    }

    /// Invoke `f` on every value, in key order, under the map lock.
    ///
    /// When `ignore_errors` is false the first non-OK result aborts the
    /// iteration; either way the first error observed is returned.
    pub fn for_each(&self, mut f: impl FnMut(&V) -> Result<()>, ignore_errors: bool) -> Result<()> {
        let tree = self.tree.lock();
        let mut ret = Ok(());
        for value in tree.values() {
            let r = f(value);
            if ret.is_ok() {
                ret = r;
            }
            if !ignore_errors && ret.is_err() {
                break;
            }
        }
        ret
    }

    /// Atomically take every entry, leaving the map empty, then invoke `f`
    /// on each drained value outside the lock.
    ///
    /// A concurrent remove observes the map as empty the moment the
    /// critical section ends; the drained values are stable by then. Every
    /// value is visited even after a failure; the first error is returned.
    pub fn drain(&self, mut f: impl FnMut(V) -> Result<()>) -> Result<()> {
        let drained: SmallVec<[V; 8]> = {
            let mut tree = self.tree.lock();
            mem::take(&mut *tree).into_values().collect()
        };
        let mut ret = Ok(());
        for value in drained {
            let r = f(value);
            if ret.is_ok() {
                ret = r;
            }
        }
        ret
    }

    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }
}

impl<V> Default for SyncMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
