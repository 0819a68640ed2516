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

//! An LRU point-read cache decorating any [`Table`], matching `createObjectStore`'s
//! `enableLruCache`/`rawLruCacheSize` options. Range queries (`keys`/`values`/`min_key`/
//! `max_key`/`count`) always go straight to the inner table: caching those would mean caching
//! query results keyed on arbitrary `KeyRange`s, which this crate's caller never asked for.

use std::sync::Arc;

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::table::{BatchFragment, Table, TableBatch};
use crate::{Key, KeyRange, Result, Value};

/// Wraps a [`Table`] with a bounded LRU cache of raw (pre-codec) `get` results, the
/// `rawLruCacheSize` collaborator named in the spec's `createObjectStore` options.
pub struct CachedTable {
    inner: Arc<dyn Table>,
    cache: Mutex<LinkedHashMap<Key, Option<Value>>>,
    capacity: usize,
}

impl CachedTable {
    pub fn new(inner: Arc<dyn Table>, capacity: usize) -> Self {
        CachedTable { inner, cache: Mutex::new(LinkedHashMap::new()), capacity }
    }

    fn remember(&self, key: Key, value: Option<Value>) {
        if self.capacity == 0 {
            return;
        }
        let mut cache = self.cache.lock();
        cache.insert(key, value);
        while cache.len() > self.capacity {
            cache.pop_front();
        }
    }

    fn forget(&self, key: &[u8]) {
        self.cache.lock().remove(key);
    }
}

impl Table for CachedTable {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if let Some(hit) = self.cache.lock().get_refresh(key) {
            return Ok(hit.clone());
        }
        let value = self.inner.get(key)?;
        self.remember(key.to_vec(), value.clone());
        Ok(value)
    }

    fn keys(&self, range: &KeyRange) -> Result<Vec<Key>> {
        self.inner.keys(range)
    }

    fn min_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        self.inner.min_key(range)
    }

    fn max_key(&self, range: &KeyRange) -> Result<Option<Key>> {
        self.inner.max_key(range)
    }

    fn count(&self, range: &KeyRange) -> Result<usize> {
        self.inner.count(range)
    }

    fn values(&self, range: &KeyRange) -> Result<Vec<(Key, Value)>> {
        self.inner.values(range)
    }

    fn write_batch(&self, batch: TableBatch) -> Result<()> {
        if batch.truncate {
            self.cache.lock().clear();
        } else {
            for k in &batch.removes {
                self.forget(k);
            }
            for (k, _) in &batch.puts {
                self.forget(k);
            }
        }
        self.inner.write_batch(batch)
    }

    fn batch_fragment(self: Arc<Self>, batch: TableBatch) -> Result<BatchFragment> {
        if batch.truncate {
            self.cache.lock().clear();
        } else {
            for k in &batch.removes {
                self.forget(k);
            }
            for (k, _) in &batch.puts {
                self.forget(k);
            }
        }
        Arc::clone(&self.inner).batch_fragment(batch)
    }
}
