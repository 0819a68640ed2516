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

//! The `Store` backend contract (SPEC_FULL.md §4.1) and its two genuine implementations.
//!
//! `InMemoryTable` and `KvdbTable` are the "volatile in-memory map" and "persistent B-tree/LSM"
//! collaborators the spec calls out as out of scope to reimplement: the first is a plain
//! `BTreeMap`, the second drives `kvdb::KeyValueDB` (backed by `kvdb-memorydb` or, behind the
//! `with-kvdb-rocksdb` feature, `kvdb-rocksdb`). Neither hand-rolls a storage engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use kvdb::{DBTransaction, KeyValueDB};
use parking_lot::Mutex;

use crate::{Error, Key, KeyRange, Result, Value};

/// A batch of mutations to apply atomically to a single table.
#[derive(Debug, Default, Clone)]
pub struct TableBatch {
    pub puts: Vec<(Key, Value)>,
    pub removes: Vec<Key>,
    pub truncate: bool,
}

impl TableBatch {
    pub fn is_empty(&self) -> bool {
        !self.truncate && self.puts.is_empty() && self.removes.is_empty()
    }
}

/// One raw operation destined for the shared root `KeyValueDB`'s atomic write, used by the
/// combined-commit coordinator to merge several tables' batches into a single `DBTransaction`.
#[derive(Debug, Clone)]
pub struct KvOp {
    pub col: u32,
    pub key: Vec<u8>,
    /// `None` is a delete.
    pub value: Option<Vec<u8>>,
}

/// What `Table::batch_fragment` hands back to the combined-commit coordinator
/// (SPEC_FULL.md §4.6): either raw ops for the shared engine, or a closure to run once the
/// shared write has landed. Persistent tables produce the former; in-memory tables, which have
/// no shared engine to batch into, produce the latter.
pub enum BatchFragment {
    Kv(Vec<KvOp>),
    Deferred(Box<dyn FnOnce() -> Result<()> + Send>),
}

/// An ordered key/value namespace as exposed to a [`crate::Transaction`]'s overlay.
///
/// All query results are ordered by unsigned lexicographic key comparison; `keys(range)`
/// returns exactly the keys `k` for which `range.includes(k)`.
pub trait Table: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    fn keys(&self, range: &KeyRange) -> Result<Vec<Key>>;

    fn min_key(&self, range: &KeyRange) -> Result<Option<Key>>;

    fn max_key(&self, range: &KeyRange) -> Result<Option<Key>>;

    /// Default implementation is correct for every backend; override only for a faster count.
    fn count(&self, range: &KeyRange) -> Result<usize> {
        Ok(self.keys(range)?.len())
    }

    fn values(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        self.keys(range)?
            .into_iter()
            .map(|k| {
                let v = self.get(&k)?.unwrap_or_default();
                Ok((k, v))
            })
            .collect()
    }

    /// Apply a batch synchronously against this table alone.
    fn write_batch(&self, batch: TableBatch) -> Result<()>;

    /// Clear the table (used by truncate outside of the overlay, e.g. upgrade migrations).
    fn truncate(&self) -> Result<()> {
        self.write_batch(TableBatch { truncate: true, ..Default::default() })
    }

    /// Describe `batch` without applying it, for the combined-commit coordinator.
    ///
    /// Takes `self` by `Arc` (rather than `&self`) because an in-memory table's fragment is a
    /// `'static` closure that must own a handle back to the table to run later.
    fn batch_fragment(self: Arc<Self>, batch: TableBatch) -> Result<BatchFragment>;
}

/// The volatile, non-persistent table variant: a plain ordered map, guarded by a mutex so it
/// can be shared across `ObjectStore` clones. Used for `persistent: false` object stores and
/// throughout this crate's own test suite.
pub struct InMemoryTable {
    data: Mutex<BTreeMap<Key, Value>>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        InMemoryTable { data: Mutex::new(BTreeMap::new()) }
    }

    fn apply(data: &mut BTreeMap<Key, Value>, batch: &TableBatch) {
        if batch.truncate {
            data.clear();
        }
        for k in &batch.removes {
            data.remove(k);
        }
        for (k, v) in &batch.puts {
            data.insert(k.clone(), v.clone());
        }
    }
}

impl Default for InMemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Table for InMemoryTable {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        Ok(self
            .data
            .lock()
            .range((range.lower().clone(), range.upper().clone()))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn min_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        Ok(self
            .data
            .lock()
            .range((range.lower().clone(), range.upper().clone()))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn max_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        Ok(self
            .data
            .lock()
            .range((range.lower().clone(), range.upper().clone()))
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    fn values(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        Ok(self
            .data
            .lock()
            .range((range.lower().clone(), range.upper().clone()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: TableBatch) -> Result<()> {
        Self::apply(&mut self.data.lock(), &batch);
        Ok(())
    }

    fn batch_fragment(self: Arc<Self>, batch: TableBatch) -> Result<BatchFragment> {
        // No shared engine backs this table: the mutation itself is the deferred side effect,
        // executed by the combined-commit coordinator only after the shared write succeeds.
        Ok(BatchFragment::Deferred(Box::new(move || self.write_batch(batch))))
    }
}

/// The persistent table variant: a namespace within a shared `kvdb::KeyValueDB` column.
/// Every key this table reads or writes is `prefix || key` in `col`; iteration is bounded to
/// that prefix so one column can hold every object-store table (mirroring how `sc-client-db`
/// multiplexes logical tables across a handful of RocksDB column families).
pub struct KvdbTable {
    db: Arc<dyn KeyValueDB>,
    col: u32,
    prefix: Vec<u8>,
}

impl KvdbTable {
    pub fn new(db: Arc<dyn KeyValueDB>, col: u32, prefix: Vec<u8>) -> Self {
        KvdbTable { db, col, prefix }
    }

    fn absolute(&self, key: &[u8]) -> Vec<u8> {
        let mut abs = Vec::with_capacity(self.prefix.len() + key.len());
        abs.extend_from_slice(&self.prefix);
        abs.extend_from_slice(key);
        abs
    }

    fn strip<'a>(&self, abs: &'a [u8]) -> Option<&'a [u8]> {
        abs.strip_prefix(self.prefix.as_slice())
    }

    // `KeyValueDB::iter_with_prefix` yields plain `(Box<[u8]>, Box<[u8]>)` pairs, not a
    // `Result` — the underlying engine has no per-item failure mode during iteration, only
    // the batched `write` can fail.
    fn scan(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        let mut out = Vec::new();
        for (abs_key, value) in self.db.iter_with_prefix(self.col, &self.prefix) {
            let k = match self.strip(&abs_key) {
                Some(k) => k,
                None => break,
            };
            if range.includes(k) {
                out.push((k.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    fn existing_keys_for_truncate(&self) -> Result<Vec<Key>> {
        let mut out = Vec::new();
        for (abs_key, _) in self.db.iter_with_prefix(self.col, &self.prefix) {
            match self.strip(&abs_key) {
                Some(k) => out.push(k.to_vec()),
                None => break,
            }
        }
        Ok(out)
    }

    fn ops_for(&self, batch: &TableBatch) -> Result<Vec<KvOp>> {
        let mut ops = Vec::new();
        if batch.truncate {
            for k in self.existing_keys_for_truncate()? {
                ops.push(KvOp { col: self.col, key: self.absolute(&k), value: None });
            }
        }
        for k in &batch.removes {
            ops.push(KvOp { col: self.col, key: self.absolute(k), value: None });
        }
        for (k, v) in &batch.puts {
            ops.push(KvOp { col: self.col, key: self.absolute(k), value: Some(v.clone()) });
        }
        Ok(ops)
    }
}

impl Table for KvdbTable {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.db.get(self.col, &self.absolute(key))?)
    }

    fn keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        Ok(self.scan(range)?.into_iter().map(|(k, _)| k).collect())
    }

    fn min_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        Ok(self.scan(range)?.into_iter().map(|(k, _)| k).next())
    }

    fn max_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        Ok(self.scan(range)?.into_iter().map(|(k, _)| k).last())
    }

    fn values(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        self.scan(range)
    }

    fn write_batch(&self, batch: TableBatch) -> Result<()> {
        let ops = self.ops_for(&batch)?;
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = DBTransaction::new();
        for op in ops {
            match op.value {
                Some(v) => tx.put(op.col, &op.key, &v),
                None => tx.delete(op.col, &op.key),
            }
        }
        self.db.write(tx)?;
        Ok(())
    }

    fn batch_fragment(self: Arc<Self>, batch: TableBatch) -> Result<BatchFragment> {
        Ok(BatchFragment::Kv(self.ops_for(&batch)?))
    }
}

/// Which concrete `Table` an [`crate::object_store::ObjectStore`] (or one of its indices) is
/// backed by, shared from the owning [`crate::database::Database`] so every table it creates —
/// object stores and their indices alike — lands in the same underlying engine.
#[derive(Clone)]
pub enum BackendKind {
    /// `persistent: false` object stores, and every crate-internal test.
    InMemory,
    /// `persistent: true` object stores, namespaced by column and key prefix within one shared
    /// `kvdb::KeyValueDB`.
    Kvdb { db: Arc<dyn KeyValueDB>, col: u32 },
}

impl BackendKind {
    pub fn make_table(&self, prefix: Vec<u8>) -> Arc<dyn Table> {
        match self {
            BackendKind::InMemory => Arc::new(InMemoryTable::new()),
            BackendKind::Kvdb { db, col } => Arc::new(KvdbTable::new(db.clone(), *col, prefix)),
        }
    }

    /// The shared root engine backing this table, if any — `None` for `InMemory`, which has
    /// nothing to batch a combined commit's `Kv` fragments into.
    pub fn root_engine(&self) -> Option<Arc<dyn KeyValueDB>> {
        match self {
            BackendKind::InMemory => None,
            BackendKind::Kvdb { db, .. } => Some(db.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_table_round_trips() {
        let table = InMemoryTable::new();
        table
            .write_batch(TableBatch {
                puts: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
                removes: vec![],
                truncate: false,
            })
            .unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.keys(&KeyRange::all()).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(table.max_key(&KeyRange::all()).unwrap(), Some(b"b".to_vec()));
        assert_eq!(table.min_key(&KeyRange::all()).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn in_memory_table_truncate_then_put() {
        let table = InMemoryTable::new();
        table
            .write_batch(TableBatch {
                puts: vec![(b"a".to_vec(), b"1".to_vec())],
                removes: vec![],
                truncate: false,
            })
            .unwrap();
        table
            .write_batch(TableBatch {
                puts: vec![(b"b".to_vec(), b"2".to_vec())],
                removes: vec![],
                truncate: true,
            })
            .unwrap();
        assert_eq!(table.keys(&KeyRange::all()).unwrap(), vec![b"b".to_vec()]);
    }

    fn kvdb_table() -> KvdbTable {
        let db: Arc<dyn KeyValueDB> = Arc::new(kvdb_memorydb::create(1));
        KvdbTable::new(db, 0, b"t:".to_vec())
    }

    #[test]
    fn kvdb_table_namespaces_by_prefix() {
        let a = KvdbTable::new(
            {
                let db: Arc<dyn KeyValueDB> = Arc::new(kvdb_memorydb::create(1));
                db
            },
            0,
            b"a:".to_vec(),
        );
        a.write_batch(TableBatch {
            puts: vec![(b"x".to_vec(), b"1".to_vec())],
            removes: vec![],
            truncate: false,
        })
        .unwrap();
        assert_eq!(a.keys(&KeyRange::all()).unwrap(), vec![b"x".to_vec()]);
    }

    #[test]
    fn kvdb_table_round_trips() {
        let table = kvdb_table();
        table
            .write_batch(TableBatch {
                puts: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
                removes: vec![],
                truncate: false,
            })
            .unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.keys(&KeyRange::all()).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);

        table
            .write_batch(TableBatch { puts: vec![], removes: vec![b"a".to_vec()], truncate: false })
            .unwrap();
        assert_eq!(table.get(b"a").unwrap(), None);
        assert_eq!(table.keys(&KeyRange::all()).unwrap(), vec![b"b".to_vec()]);
    }

    #[test]
    fn kvdb_table_truncate_clears_only_its_prefix() {
        let db: Arc<dyn KeyValueDB> = Arc::new(kvdb_memorydb::create(1));
        let a = KvdbTable::new(db.clone(), 0, b"a:".to_vec());
        let b = KvdbTable::new(db, 0, b"b:".to_vec());
        a.write_batch(TableBatch {
            puts: vec![(b"x".to_vec(), b"1".to_vec())],
            removes: vec![],
            truncate: false,
        })
        .unwrap();
        b.write_batch(TableBatch {
            puts: vec![(b"y".to_vec(), b"2".to_vec())],
            removes: vec![],
            truncate: false,
        })
        .unwrap();
        a.truncate().unwrap();
        assert_eq!(a.keys(&KeyRange::all()).unwrap(), Vec::<Key>::new());
        assert_eq!(b.keys(&KeyRange::all()).unwrap(), vec![b"y".to_vec()]);
    }

    /// Same contract, against a real on-disk RocksDB instance rather than `kvdb-memorydb`, for
    /// the persistent variant named in SPEC_FULL.md §4.1. Gated behind `with-kvdb-rocksdb`
    /// since that's an optional, heavier dependency most development builds don't need.
    #[cfg(feature = "with-kvdb-rocksdb")]
    #[test]
    fn kvdb_table_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = kvdb_rocksdb::DatabaseConfig::with_columns(1);
        let db: Arc<dyn KeyValueDB> =
            Arc::new(kvdb_rocksdb::Database::open(&config, dir.path().to_str().unwrap()).unwrap());
        let table = KvdbTable::new(db, 0, b"t:".to_vec());
        table
            .write_batch(TableBatch {
                puts: vec![(b"a".to_vec(), b"1".to_vec())],
                removes: vec![],
                truncate: false,
            })
            .unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
