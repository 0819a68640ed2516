// This file is part of Substrate.

// Copyright (C) 2017-2020 Parity Technologies (UK) Ltd.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The transaction object (SPEC_FULL.md §4.3): a mutation staging buffer plus a
//! snapshot-overlay reader, nestable onto either an [`crate::ObjectStore`] or another
//! open `Transaction`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::index::{IndexHandle, IndexOverlay, KeyPath};
use crate::object_store::ObjectStoreInner;
use crate::overlay::{max_modified, merge_keys, min_modified};
use crate::table::Table;
use crate::{Error, Key, KeyRange, Result, Value};

/// The default watchdog deadline: abort an open transaction that outlives 10 seconds.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);

/// A transaction's terminal (or non-terminal) state. Exactly one of `Committed`, `Aborted`,
/// `Conflicted` is reachable from `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
    Conflicted,
}

/// Where a transaction's reads come from.
#[derive(Clone)]
pub(crate) enum ReadBackend {
    Table(Arc<dyn Table>),
    Parent(Arc<Mutex<Transaction>>),
}

/// Where a transaction's `commit`/`abort` are routed.
#[derive(Clone)]
pub(crate) enum CommitBackend {
    Store(Arc<ObjectStoreInner>),
    Parent(Arc<Mutex<Transaction>>),
}

/// A staged, snapshot-isolated set of mutations against one object store (or, nested, against
/// another open transaction). See SPEC_FULL.md §3 for the field-level invariants.
pub struct Transaction {
    id: u64,
    store_name: String,
    read_backend: ReadBackend,
    commit_backend: CommitBackend,
    modified: BTreeMap<Key, Value>,
    removed: BTreeSet<Key>,
    old_values: HashMap<Key, Option<Value>>,
    truncated: bool,
    indices: HashMap<String, IndexOverlay>,
    state: TransactionState,
    deadline: Option<Instant>,
    registered_with: Option<Arc<ObjectStoreInner>>,
}

impl Transaction {
    pub(crate) fn new_root(
        id: u64,
        store_name: String,
        table: Arc<dyn Table>,
        store: Arc<ObjectStoreInner>,
        indices: HashMap<String, IndexOverlay>,
        watchdog: Option<Duration>,
    ) -> Self {
        Transaction {
            id,
            store_name,
            read_backend: ReadBackend::Table(table),
            commit_backend: CommitBackend::Store(store.clone()),
            modified: BTreeMap::new(),
            removed: BTreeSet::new(),
            old_values: HashMap::new(),
            truncated: false,
            indices,
            state: TransactionState::Open,
            deadline: watchdog.map(|d| Instant::now() + d),
            registered_with: Some(store),
        }
    }

    /// Open a child transaction whose reads and commit both route through `parent`, which must
    /// outlive this transaction (enforced by `parent` being an owned `Arc`, not a borrow).
    pub fn nested(
        id: u64,
        store_name: String,
        parent: Arc<Mutex<Transaction>>,
        indices: HashMap<String, IndexOverlay>,
        watchdog: Option<Duration>,
    ) -> Self {
        Transaction {
            id,
            store_name,
            read_backend: ReadBackend::Parent(parent.clone()),
            commit_backend: CommitBackend::Parent(parent),
            modified: BTreeMap::new(),
            removed: BTreeSet::new(),
            old_values: HashMap::new(),
            truncated: false,
            indices,
            state: TransactionState::Open,
            deadline: watchdog.map(|d| Instant::now() + d),
            registered_with: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn index(&self, name: &str) -> Result<IndexHandle<'_>> {
        self.indices
            .get(name)
            .map(IndexHandle::new)
            .ok_or_else(|| Error::UnknownIndex(self.store_name.clone(), name.to_string()))
    }

    /// `create_index` is never allowed from an open transaction; indices are schema, and
    /// schema changes belong to `ObjectStore::create_index` before the owning database connects.
    pub fn create_index(&mut self, _name: &str, _key_path: KeyPath) -> Result<()> {
        Err(Error::SchemaChangeNotInTransaction)
    }

    // ---- reads -----------------------------------------------------------------------

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.check_watchdog()?;
        if self.removed.contains(key) {
            return Ok(None);
        }
        if let Some(v) = self.modified.get(key) {
            return Ok(Some(v.clone()));
        }
        if self.truncated {
            return Ok(None);
        }
        match &self.read_backend {
            ReadBackend::Table(t) => t.get(key),
            ReadBackend::Parent(p) => p.lock().get(key),
        }
    }

    pub fn keys(&mut self, range: &KeyRange) -> Result<Vec<Key>> {
        self.check_watchdog()?;
        let backend_keys = self.backend_keys(range)?;
        Ok(merge_keys(backend_keys, &self.removed, self.modified.keys(), range))
    }

    pub fn values(&mut self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        let keys = self.keys(range)?;
        keys.into_iter()
            .map(|k| {
                let v = self.get(&k)?.unwrap_or_default();
                Ok((k, v))
            })
            .collect()
    }

    pub fn count(&mut self, range: &KeyRange) -> Result<usize> {
        Ok(self.keys(range)?.len())
    }

    /// Greatest surviving key in `range`. Restarts the backend search with a tightened upper
    /// bound whenever the backend's candidate has been staged for removal, then compares the
    /// result against `modified`, preferring the larger of the two.
    pub fn max_key(&mut self, range: &KeyRange) -> Result<Option<Key>> {
        self.check_watchdog()?;
        let backend_candidate = self.backend_max_key(range)?;
        let modified_candidate = max_modified(self.modified.keys(), range).cloned();
        Ok(larger(backend_candidate, modified_candidate))
    }

    /// Smallest surviving key in `range`; symmetric to [`Self::max_key`].
    pub fn min_key(&mut self, range: &KeyRange) -> Result<Option<Key>> {
        self.check_watchdog()?;
        let backend_candidate = self.backend_min_key(range)?;
        let modified_candidate = min_modified(self.modified.keys(), range).cloned();
        Ok(smaller(backend_candidate, modified_candidate))
    }

    fn backend_keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        if self.truncated {
            return Ok(Vec::new());
        }
        match &self.read_backend {
            ReadBackend::Table(t) => t.keys(range),
            ReadBackend::Parent(p) => p.lock().keys(range),
        }
    }

    fn backend_max_key(&mut self, range: &KeyRange) -> Result<Option<Key>> {
        if self.truncated {
            return Ok(None);
        }
        let mut search_range = range.clone();
        loop {
            let candidate = match &self.read_backend {
                ReadBackend::Table(t) => t.max_key(&search_range)?,
                ReadBackend::Parent(p) => p.lock().max_key(&search_range)?,
            };
            match candidate {
                Some(k) if self.removed.contains(&k) => search_range = search_range.capped_below(&k),
                other => return Ok(other),
            }
        }
    }

    fn backend_min_key(&mut self, range: &KeyRange) -> Result<Option<Key>> {
        if self.truncated {
            return Ok(None);
        }
        let mut search_range = range.clone();
        loop {
            let candidate = match &self.read_backend {
                ReadBackend::Table(t) => t.min_key(&search_range)?,
                ReadBackend::Parent(p) => p.lock().min_key(&search_range)?,
            };
            match candidate {
                Some(k) if self.removed.contains(&k) => search_range = search_range.capped_above(&k),
                other => return Ok(other),
            }
        }
    }

    // ---- writes (OPEN only) -----------------------------------------------------------

    pub fn put(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.check_open()?;
        self.check_watchdog()?;
        self.put_internal(key, value)
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_watchdog()?;
        self.remove_internal(key)
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.check_open()?;
        self.check_watchdog()?;
        self.truncate_internal();
        Ok(())
    }

    /// The "Transaction already closed" check is deliberately skipped here: this is the path
    /// `apply_child` uses to merge a committed child into a still-open parent, and the parent's
    /// own `state` must not gate it (SPEC_FULL.md §9).
    fn put_internal(&mut self, key: &[u8], value: Value) -> Result<()> {
        let old = self.capture_old_value(key)?;
        self.removed.remove(key);
        self.modified.insert(key.to_vec(), value.clone());
        for overlay in self.indices.values_mut() {
            overlay.put(key, old.as_ref(), &value);
        }
        Ok(())
    }

    fn remove_internal(&mut self, key: &[u8]) -> Result<()> {
        let old = self.capture_old_value(key)?;
        self.modified.remove(key);
        self.removed.insert(key.to_vec());
        for overlay in self.indices.values_mut() {
            overlay.remove(key, old.as_ref());
        }
        Ok(())
    }

    fn truncate_internal(&mut self) {
        self.truncated = true;
        self.modified.clear();
        self.removed.clear();
        self.old_values.clear();
        for overlay in self.indices.values_mut() {
            overlay.truncate();
        }
    }

    /// `oldValues[k]` is captured at most once per key, the first time it is mutated, so that
    /// later mutations of the same key within this transaction don't clobber the pre-transaction
    /// snapshot used for conflict detection and index maintenance.
    fn capture_old_value(&mut self, key: &[u8]) -> Result<Option<Value>> {
        if !self.old_values.contains_key(key) {
            let v = self.get(key)?;
            self.old_values.insert(key.to_vec(), v.clone());
            Ok(v)
        } else {
            Ok(self.old_values.get(key).cloned().unwrap_or(None))
        }
    }

    /// Merge a just-committed child's overlay into this (still open) parent, using the internal
    /// write paths so the parent's own `state` is never consulted.
    pub(crate) fn apply_child(&mut self, child: &Transaction) -> Result<()> {
        if child.truncated {
            self.truncate_internal();
        }
        for (k, v) in &child.modified {
            self.put_internal(k, v.clone())?;
        }
        for k in &child.removed {
            self.remove_internal(k)?;
        }
        Ok(())
    }

    // ---- lifecycle ---------------------------------------------------------------------

    pub fn commit(&mut self) -> Result<bool> {
        self.check_open()?;
        self.check_watchdog()?;
        self.deadline = None;
        let backend = self.commit_backend.clone();
        let outcome = match backend {
            CommitBackend::Store(store) => store.commit(self)?,
            CommitBackend::Parent(parent) => {
                let mut guard = parent.lock();
                if guard.state != TransactionState::Open {
                    return Err(Error::InvalidState(guard.state));
                }
                guard.apply_child(self)?;
                true
            }
        };
        self.state = if outcome { TransactionState::Committed } else { TransactionState::Conflicted };
        log::debug!(
            "transaction {} on {:?} terminated with state {:?}",
            self.id,
            self.store_name,
            self.state
        );
        self.deregister();
        Ok(outcome)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.check_open()?;
        self.deadline = None;
        let backend = self.commit_backend.clone();
        if let CommitBackend::Store(store) = backend {
            store.abort(self)?;
        }
        self.state = TransactionState::Aborted;
        self.deregister();
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state))
        }
    }

    /// Checked at every suspension point (SPEC_FULL.md §5). Firing transitions the transaction
    /// to `Aborted` and surfaces `WatchdogTimeout`, matching "the watchdog is the only
    /// preemption source".
    fn check_watchdog(&mut self) -> Result<()> {
        if self.state != TransactionState::Open {
            return Ok(());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                log::warn!("transaction {} on {:?} hit its watchdog deadline", self.id, self.store_name);
                self.state = TransactionState::Aborted;
                self.deregister();
                return Err(Error::WatchdogTimeout(self.id));
            }
        }
        Ok(())
    }

    fn deregister(&mut self) {
        if let Some(store) = self.registered_with.take() {
            store.forget_transaction(self.id);
        }
    }

    // ---- accessors used by ObjectStoreInner's commit path -------------------------------

    pub(crate) fn old_values_ref(&self) -> &HashMap<Key, Option<Value>> {
        &self.old_values
    }

    pub(crate) fn modified_ref(&self) -> &BTreeMap<Key, Value> {
        &self.modified
    }

    pub(crate) fn removed_ref(&self) -> &BTreeSet<Key> {
        &self.removed
    }

    pub(crate) fn indices_ref(&self) -> &HashMap<String, IndexOverlay> {
        &self.indices
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    /// The object store this transaction would commit into, if it's a root (non-nested)
    /// transaction. Used by the combined-commit coordinator, which requires every participant
    /// to be a root transaction against a sibling store of the same database.
    pub(crate) fn commit_store(&self) -> Result<Arc<ObjectStoreInner>> {
        match &self.commit_backend {
            CommitBackend::Store(store) => Ok(store.clone()),
            CommitBackend::Parent(_) => {
                Err(Error::TypeError("nested transactions cannot take part in a combined commit"))
            }
        }
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
        self.deadline = None;
        self.deregister();
    }

    pub(crate) fn mark_conflicted(&mut self) {
        self.state = TransactionState::Conflicted;
        self.deadline = None;
        self.deregister();
    }
}

fn larger(a: Option<Key>, b: Option<Key>) -> Option<Key> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn smaller(a: Option<Key>, b: Option<Key>) -> Option<Key> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b < a { b } else { a }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
