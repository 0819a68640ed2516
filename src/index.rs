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

//! Secondary indices and their per-transaction overlay (SPEC_FULL.md §4.4).
//!
//! An index is persisted as its own [`crate::table::Table`] mapping a composite key
//! `index_key || 0x00 || primary_key` to the primary key, so a single index table can hold
//! either a unique index (at most one primary key per index key) or a multi-entry / non-unique
//! index (many primary keys sharing an index key) without changing representation.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::overlay::merge_keys;
use crate::table::{Table, TableBatch};
use crate::{Error, Key, KeyRange, Result, Value};

/// Extracts zero or more index keys from a stored value. Returning zero keys means "no entry
/// for this value", matching the spec's "a missing value extract equates to no entry".
///
/// A plain field accessor returns exactly one key; a multi-entry index's extractor can return
/// several (e.g. one per tag in a tag list).
pub type KeyPath = Arc<dyn Fn(&[u8]) -> Vec<Key> + Send + Sync>;

/// Static definition of a secondary index, supplied to `ObjectStore::create_index`.
#[derive(Clone)]
pub struct IndexDef {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl std::fmt::Debug for IndexDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDef")
            .field("name", &self.name)
            .field("unique", &self.unique)
            .field("multi_entry", &self.multi_entry)
            .finish()
    }
}

/// A `KeyRange` matching every key that starts with `prefix`, using the standard
/// "increment the last non-0xff byte, drop the rest" trick to build the exclusive upper bound.
/// Falls back to unbounded above if `prefix` is empty or all `0xff` (no finite successor).
fn prefix_range(prefix: Vec<u8>) -> KeyRange {
    let mut upper = prefix.clone();
    while let Some(&last) = upper.last() {
        if last != 0xff {
            *upper.last_mut().unwrap() += 1;
            return KeyRange::bound(prefix, upper, false, true);
        }
        upper.pop();
    }
    KeyRange::lower_bound(prefix, false)
}

fn composite_key(index_key: &[u8], primary_key: &[u8]) -> Key {
    let mut k = Vec::with_capacity(index_key.len() + 1 + primary_key.len());
    k.extend_from_slice(index_key);
    k.push(0);
    k.extend_from_slice(primary_key);
    k
}

/// Splits a composite `index_key || 0x00 || primary_key` back into its two parts. Index keys
/// must not themselves contain a `0x00` byte; callers that need binary-safe index keys should
/// length-prefix them before handing them to the key path extractor.
fn split_composite(composite: &[u8]) -> (&[u8], &[u8]) {
    let at = composite.iter().position(|b| *b == 0).unwrap_or(composite.len());
    let (idx, rest) = composite.split_at(at);
    (idx, rest.get(1..).unwrap_or(&[]))
}

/// The per-transaction overlay for one index: a primary-overlay, but over composite keys.
pub struct IndexOverlay {
    def: IndexDef,
    backend: Arc<dyn Table>,
    modified: BTreeSet<Key>,
    removed: BTreeSet<Key>,
    truncated: bool,
}

impl IndexOverlay {
    pub fn new(def: IndexDef, backend: Arc<dyn Table>) -> Self {
        IndexOverlay { def, backend, modified: BTreeSet::new(), removed: BTreeSet::new(), truncated: false }
    }

    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Record the effect of a primary `put(key, old_value, new_value)` on this index.
    pub fn put(&mut self, primary_key: &[u8], old_value: Option<&Value>, new_value: &Value) {
        let old_keys: Vec<Key> = old_value.map(|v| (self.def.key_path)(v)).unwrap_or_default();
        let new_keys = (self.def.key_path)(new_value);

        for old_key in &old_keys {
            if !new_keys.contains(old_key) {
                self.erase(old_key, primary_key);
            }
        }
        for new_key in &new_keys {
            if !old_keys.contains(new_key) {
                self.insert(new_key, primary_key);
            }
        }
    }

    /// Record the effect of a primary `remove(key, old_value)` on this index.
    pub fn remove(&mut self, primary_key: &[u8], old_value: Option<&Value>) {
        let old_keys: Vec<Key> = old_value.map(|v| (self.def.key_path)(v)).unwrap_or_default();
        for old_key in &old_keys {
            self.erase(old_key, primary_key);
        }
    }

    pub fn truncate(&mut self) {
        self.truncated = true;
        self.modified.clear();
        self.removed.clear();
    }

    fn insert(&mut self, index_key: &[u8], primary_key: &[u8]) {
        let composite = composite_key(index_key, primary_key);
        self.removed.remove(&composite);
        self.modified.insert(composite);
    }

    fn erase(&mut self, index_key: &[u8], primary_key: &[u8]) {
        let composite = composite_key(index_key, primary_key);
        self.modified.remove(&composite);
        self.removed.insert(composite);
    }

    /// Every `(index_key, primary_key)` pair currently visible through this overlay, in
    /// composite-key order, restricted to `range` over the *composite* keyspace.
    fn composite_keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        let backend_keys = if self.truncated { Vec::new() } else { self.backend.keys(range)? };
        Ok(merge_keys(backend_keys, &self.removed, self.modified.iter(), range))
    }

    /// All primary keys currently filed under `index_key`.
    pub fn primary_keys_for(&self, index_key: &[u8]) -> Result<Vec<Key>> {
        let range = prefix_range(composite_key(index_key, &[]));
        Ok(self
            .composite_keys(&range)?
            .into_iter()
            .filter(|c| split_composite(c).0 == index_key)
            .map(|c| split_composite(&c).1.to_vec())
            .collect())
    }

    /// The single primary key under `index_key`, for a unique index. Returns `Ok(None)` if
    /// absent, and does not itself enforce uniqueness (callers that declared `unique: true`
    /// are trusted not to feed in colliding values; ties are resolved by "first in composite
    /// order" for robustness rather than panicking).
    pub fn primary_key_for(&self, index_key: &[u8]) -> Result<Option<Key>> {
        Ok(self.primary_keys_for(index_key)?.into_iter().next())
    }

    /// Flatten this overlay into a batch for the index's own backend table, for commit.
    pub fn to_table_batch(&self) -> TableBatch {
        TableBatch {
            puts: self.modified.iter().map(|c| (c.clone(), split_composite(c).1.to_vec())).collect(),
            removes: self.removed.iter().cloned().collect(),
            truncate: self.truncated,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Table> {
        &self.backend
    }
}

/// A read-only handle to a single index as seen through an open transaction, returned by
/// `Transaction::index(name)`.
pub struct IndexHandle<'a> {
    overlay: &'a IndexOverlay,
}

impl<'a> IndexHandle<'a> {
    pub(crate) fn new(overlay: &'a IndexOverlay) -> Self {
        IndexHandle { overlay }
    }

    pub fn get(&self, index_key: &[u8]) -> Result<Option<Key>> {
        if !self.overlay.def.unique {
            return Err(Error::TypeError("index is not unique; use `get_all`"));
        }
        self.overlay.primary_key_for(index_key)
    }

    pub fn get_all(&self, index_key: &[u8]) -> Result<Vec<Key>> {
        self.overlay.primary_keys_for(index_key)
    }
}
