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

//! `ObjectStore` (SPEC_FULL.md §4.2): one named, ordered key/value namespace plus its secondary
//! indices, the `Transaction` factory, and the actual commit logic a `Transaction` calls into.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cache::CachedTable;
use crate::index::{IndexDef, IndexOverlay, KeyPath};
use crate::table::{BackendKind, BatchFragment, Table};
use crate::transaction::{Transaction, DEFAULT_WATCHDOG};
use crate::{Error, Key, KeyRange, Result, Value};

/// Tuning knobs accepted by `Database::create_object_store`, mirroring the spec's
/// `createObjectStore(name, options)` options bag.
#[derive(Clone, Debug, Default)]
pub struct ObjectStoreOptions {
    /// Back this store with the volatile in-memory table instead of the database's persistent
    /// engine (the spec's `persistent: false`).
    pub in_memory: bool,
    pub enable_lru_cache: bool,
    pub raw_lru_cache_size: Option<usize>,
    /// Overrides the crate-wide `DEFAULT_WATCHDOG` for transactions opened against this store.
    /// `Some(Duration::ZERO)` or similar short deadlines are useful in tests; `None` here means
    /// "use the default", not "no watchdog" — there is no supported way to disable it entirely,
    /// matching the spec's "the watchdog always runs" invariant.
    pub watchdog: Option<Duration>,
}

/// The user-supplied extractor plus uniqueness/cardinality flags for `create_index`.
pub struct IndexOptions {
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

/// A cheaply-cloneable handle to one object store. Every clone shares the same backend and
/// bookkeeping; `ObjectStore` is the public surface, [`ObjectStoreInner`] the shared state.
#[derive(Clone)]
pub struct ObjectStore(Arc<ObjectStoreInner>);

impl ObjectStore {
    pub(crate) fn new(
        name: String,
        backend_kind: BackendKind,
        connected: Arc<AtomicBool>,
        next_tx_id: Arc<AtomicU64>,
        options: ObjectStoreOptions,
    ) -> Self {
        let mut table = backend_kind.make_table(format!("{}:", name).into_bytes());
        if options.enable_lru_cache {
            table = Arc::new(CachedTable::new(table, options.raw_lru_cache_size.unwrap_or(1024)));
        }
        ObjectStore(Arc::new(ObjectStoreInner {
            name,
            table,
            backend_kind,
            index_defs: RwLock::new(HashMap::new()),
            index_tables: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            open_transactions: Mutex::new(HashSet::new()),
            next_tx_id,
            connected,
            watchdog: options.watchdog.or(Some(DEFAULT_WATCHDOG)),
        }))
    }

    /// Build a standalone store with its own connection state and id counter, for use without a
    /// surrounding `Database` (and by this crate's own tests).
    pub fn standalone(name: String, table: Arc<dyn Table>, watchdog: Option<Duration>) -> Self {
        ObjectStore(Arc::new(ObjectStoreInner {
            name,
            backend_kind: BackendKind::InMemory,
            table,
            index_defs: RwLock::new(HashMap::new()),
            index_tables: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            open_transactions: Mutex::new(HashSet::new()),
            next_tx_id: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(AtomicBool::new(false)),
            watchdog: watchdog.or(Some(DEFAULT_WATCHDOG)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Declare a secondary index. Only valid before the owning database connects — matches
    /// `Transaction::create_index`'s `SchemaChangeNotInTransaction`, the mirror-image error for
    /// the right place to call this.
    pub fn create_index(&self, name: &str, options: IndexOptions) -> Result<()> {
        if self.0.connected.load(Ordering::SeqCst) {
            return Err(Error::SchemaChangeWhileConnected);
        }
        let def = IndexDef {
            name: name.to_string(),
            key_path: options.key_path,
            unique: options.unique,
            multi_entry: options.multi_entry,
        };
        let prefix = format!("_{}-{}:", self.0.name, name).into_bytes();
        let table = self.0.backend_kind.make_table(prefix);
        self.0.index_tables.write().insert(name.to_string(), table);
        self.0.index_defs.write().insert(name.to_string(), def);
        Ok(())
    }

    /// Open a new root transaction against this store, with a fresh overlay for every declared
    /// index.
    pub fn transaction(&self) -> Transaction {
        let id = self.0.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let indices = self.0.snapshot_index_overlays();
        self.0.open_transactions.lock().insert(id);
        Transaction::new_root(
            id,
            self.0.name.clone(),
            self.0.table.clone(),
            self.0.clone(),
            indices,
            self.0.watchdog,
        )
    }

    /// A transaction meant to be opened, mutated and committed within a single call stack. Its
    /// watchdog is disabled: there is no suspension point at which it could meaningfully fire.
    pub fn synchronous_transaction(&self) -> Transaction {
        let id = self.0.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let indices = self.0.snapshot_index_overlays();
        self.0.open_transactions.lock().insert(id);
        Transaction::new_root(id, self.0.name.clone(), self.0.table.clone(), self.0.clone(), indices, None)
    }

    // ---- non-transactional reads: a convenience snapshot straight off the backend ----------

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.0.table.get(key)
    }

    pub fn keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        self.0.table.keys(range)
    }

    pub fn values(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        self.0.table.values(range)
    }

    pub fn min_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        self.0.table.min_key(range)
    }

    pub fn max_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        self.0.table.max_key(range)
    }

    pub fn count(&self, range: &KeyRange) -> Result<usize> {
        self.0.table.count(range)
    }

    pub fn index(&self, name: &str) -> Result<IndexHandleOwned> {
        if !self.0.index_defs.read().contains_key(name) {
            return Err(Error::UnknownIndex(self.0.name.clone(), name.to_string()));
        }
        Ok(IndexHandleOwned { store: self.0.clone(), name: name.to_string() })
    }

    pub(crate) fn inner(&self) -> &Arc<ObjectStoreInner> {
        &self.0
    }
}

/// An index handle usable outside of any open transaction, reading straight off the index's own
/// backend table (no overlay, since there's no transaction to overlay onto).
pub struct IndexHandleOwned {
    store: Arc<ObjectStoreInner>,
    name: String,
}

impl IndexHandleOwned {
    pub fn get(&self, index_key: &[u8]) -> Result<Option<Key>> {
        let defs = self.store.index_defs.read();
        let def = defs.get(&self.name).expect("index existence checked at construction");
        if !def.unique {
            return Err(Error::TypeError("index is not unique; use `get_all`"));
        }
        drop(defs);
        Ok(self.get_all(index_key)?.into_iter().next())
    }

    pub fn get_all(&self, index_key: &[u8]) -> Result<Vec<Key>> {
        let tables = self.store.index_tables.read();
        let table = tables.get(&self.name).expect("index existence checked at construction");
        let overlay = IndexOverlay::new(
            self.store.index_defs.read().get(&self.name).expect("checked above").clone(),
            table.clone(),
        );
        overlay.primary_keys_for(index_key)
    }
}

/// The state shared by every clone of an [`ObjectStore`], and the type a [`Transaction`] holds
/// a handle back to in order to commit.
pub struct ObjectStoreInner {
    name: String,
    table: Arc<dyn Table>,
    backend_kind: BackendKind,
    index_defs: RwLock<HashMap<String, IndexDef>>,
    index_tables: RwLock<HashMap<String, Arc<dyn Table>>>,
    /// Serializes `commit` the way the spec's "commits against one store are serialized"
    /// invariant requires; conflict detection and batch application happen while held.
    commit_lock: Mutex<()>,
    open_transactions: Mutex<HashSet<u64>>,
    next_tx_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    watchdog: Option<Duration>,
}

impl ObjectStoreInner {
    fn snapshot_index_overlays(&self) -> HashMap<String, IndexOverlay> {
        let defs = self.index_defs.read();
        let tables = self.index_tables.read();
        defs.iter()
            .filter_map(|(name, def)| {
                tables.get(name).map(|t| (name.clone(), IndexOverlay::new(def.clone(), t.clone())))
            })
            .collect()
    }

    pub(crate) fn forget_transaction(&self, id: u64) {
        self.open_transactions.lock().remove(&id);
    }

    pub(crate) fn root_engine(&self) -> Option<Arc<dyn kvdb::KeyValueDB>> {
        self.backend_kind.root_engine()
    }

    /// Acquire this store's commit guard without using it for anything — the same mutex
    /// `commit()` locks below, exposed so the combined-commit coordinator can hold it across
    /// every participant store for the whole conflict-check-then-apply window, matching the
    /// single-store `commit()` path's serialisation (SPEC_FULL.md §5).
    pub(crate) fn commit_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Commit a single-store transaction: optimistic conflict check against the live backend,
    /// then apply the overlay (primary table and every touched index) as one batch per table.
    pub(crate) fn commit(&self, tx: &mut Transaction) -> Result<bool> {
        let _guard = self.commit_lock.lock();
        if self.has_conflict(tx)? {
            log::debug!("commit conflict on object store {:?}", self.name);
            return Ok(false);
        }
        self.apply(tx)?;
        log::debug!("committed transaction {} on object store {:?}", tx.id(), self.name);
        Ok(true)
    }

    pub(crate) fn abort(&self, _tx: &mut Transaction) -> Result<()> {
        // The overlay never touched the backend; there is nothing to undo.
        Ok(())
    }

    fn has_conflict(&self, tx: &Transaction) -> Result<bool> {
        for (k, old) in tx.old_values_ref() {
            let current = self.table.get(k)?;
            if &current != old {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn apply(&self, tx: &Transaction) -> Result<()> {
        use crate::table::TableBatch;
        let batch = TableBatch {
            puts: tx.modified_ref().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            removes: tx.removed_ref().iter().cloned().collect(),
            truncate: tx.truncated(),
        };
        if !batch.is_empty() {
            self.table.write_batch(batch)?;
        }
        let tables = self.index_tables.read();
        for (name, overlay) in tx.indices_ref() {
            if let Some(table) = tables.get(name) {
                let ibatch = overlay.to_table_batch();
                if !ibatch.is_empty() {
                    table.write_batch(ibatch)?;
                }
            }
        }
        Ok(())
    }

    /// Conflict-check this transaction's overlay against the live backend, without applying it,
    /// and describe the would-be write as batch fragments for the combined-commit coordinator.
    /// `Ok(None)` means the transaction conflicts and must not be applied.
    pub(crate) fn apply_combined(&self, tx: &Transaction) -> Result<Option<Vec<BatchFragment>>> {
        if self.has_conflict(tx)? {
            return Ok(None);
        }
        use crate::table::TableBatch;
        let mut fragments = Vec::new();
        let batch = TableBatch {
            puts: tx.modified_ref().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            removes: tx.removed_ref().iter().cloned().collect(),
            truncate: tx.truncated(),
        };
        if !batch.is_empty() {
            fragments.push(Arc::clone(&self.table).batch_fragment(batch)?);
        }
        let tables = self.index_tables.read();
        for (name, overlay) in tx.indices_ref() {
            if let Some(table) = tables.get(name) {
                let ibatch = overlay.to_table_batch();
                if !ibatch.is_empty() {
                    fragments.push(Arc::clone(table).batch_fragment(ibatch)?);
                }
            }
        }
        Ok(Some(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::InMemoryTable;
    use std::sync::Arc as StdArc;

    #[test]
    fn index_lookup_through_transaction_and_store() {
        let store = ObjectStore::standalone("people".to_string(), StdArc::new(InMemoryTable::new()), None);
        store
            .create_index(
                "by_initial",
                IndexOptions {
                    key_path: StdArc::new(|v: &[u8]| if v.is_empty() { vec![] } else { vec![vec![v[0]]] }),
                    unique: false,
                    multi_entry: false,
                },
            )
            .unwrap();

        let mut tx = store.transaction();
        tx.put(b"alice", b"Alice".to_vec()).unwrap();
        tx.put(b"aaron", b"Aaron".to_vec()).unwrap();
        tx.put(b"bob", b"Bob".to_vec()).unwrap();
        {
            let ix = tx.index("by_initial").unwrap();
            let mut got = ix.get_all(b"A").unwrap();
            got.sort();
            assert_eq!(got, vec![b"aaron".to_vec(), b"alice".to_vec()]);
        }
        assert!(tx.commit().unwrap());

        let ix = store.index("by_initial").unwrap();
        let mut got = ix.get_all(b"A").unwrap();
        got.sort();
        assert_eq!(got, vec![b"aaron".to_vec(), b"alice".to_vec()]);
        assert_eq!(ix.get_all(b"B").unwrap(), vec![b"bob".to_vec()]);
    }

    #[test]
    fn create_index_after_connect_is_rejected() {
        let store = ObjectStore::standalone("s".to_string(), StdArc::new(InMemoryTable::new()), None);
        store.0.connected.store(true, Ordering::SeqCst);
        match store.create_index(
            "ix",
            IndexOptions { key_path: StdArc::new(|_| vec![]), unique: false, multi_entry: false },
        ) {
            Err(Error::SchemaChangeWhileConnected) => {}
            other => panic!("expected SchemaChangeWhileConnected, got {:?}", other.map(|_| ())),
        }
    }
}
