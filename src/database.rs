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

//! `Database` (SPEC_FULL.md §4.5/§4.6): the owner of the shared backend engine, the schema
//! (which object stores and indices exist), the version/upgrade protocol, and the combined
//! atomic commit coordinator spanning several sibling stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::object_store::{ObjectStore, ObjectStoreInner, ObjectStoreOptions};
use crate::table::{BackendKind, BatchFragment};
use crate::transaction::{Transaction, TransactionState};
use crate::{Error, Result};

const DB_VERSION_KEY: &[u8] = b"_dbVersion";
const STORE_REGISTRY_KEY: &[u8] = b"_stores";

/// Where a `Database`'s persistent tables live. `InMemory` is for tests and ephemeral nodes;
/// `Kvdb` drives a real `kvdb::KeyValueDB`, opened by the caller (so this crate never decides
/// *how* RocksDB gets configured, only *that* it's a `KeyValueDB`).
pub enum DatabaseBackend {
    InMemory,
    Kvdb { db: Arc<dyn kvdb::KeyValueDB>, col: u32 },
}

/// Connection-time settings, analogous to the spec's `DatabaseSettings`.
pub struct DatabaseSettings {
    pub name: String,
    pub backend: DatabaseBackend,
}

/// Options accepted by `Database::delete_object_store`, mirroring the spec's
/// `deleteObjectStore(name, {upgradeCondition, indexNames})` (SPEC_FULL.md §6).
pub struct DeleteOptions {
    /// Index tables, besides the primary one, to drop alongside the store.
    pub index_names: Vec<String>,
    /// The store is only actually dropped if this holds for the version being upgraded *from*.
    /// Evaluated immediately, against `Database::version()`, when `delete_object_store` is called.
    pub upgrade_condition: Box<dyn Fn(u32) -> bool + Send>,
}

/// A named collection of sibling object stores sharing one backend engine, one version, and one
/// atomic combined-commit coordinator.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    name: String,
    backend_kind: BackendKind,
    meta: Arc<dyn crate::table::Table>,
    stores: RwLock<HashMap<String, ObjectStore>>,
    connected: Arc<AtomicBool>,
    next_tx_id: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl Database {
    /// Open (or create) the database, running the upgrade protocol if `version` is newer than
    /// whatever was last persisted:
    ///
    /// 1. `declare_stores` runs — the one place `create_object_store`/`delete_object_store`/
    ///    `ObjectStore::create_index` may be called, matching IndexedDB's "schema changes only
    ///    inside onupgradeneeded" rule, except here it always runs so that re-opening at an
    ///    unchanged version still reconstructs the in-process `ObjectStore` handles. Any
    ///    `delete_object_store` call made from here evaluates its `upgrade_condition` against
    ///    `Database::version()` immediately — which at this point still reads the pre-upgrade
    ///    stored version, since step 3 below hasn't run yet — and truncates the store and its
    ///    indices right away if it holds;
    /// 2. (skipped if `version == stored_version`) `on_upgrade_needed` runs, for one-time data
    ///    migrations that aren't schema declarations;
    /// 3. (skipped if `version == stored_version`) the new version is persisted.
    ///
    /// After this returns, the database is connected: further `create_object_store`,
    /// `delete_object_store` or `ObjectStore::create_index` calls are rejected with
    /// `SchemaChangeWhileConnected`.
    pub fn open<F1, F2>(
        settings: DatabaseSettings,
        version: u32,
        declare_stores: F1,
        on_upgrade_needed: F2,
    ) -> Result<Database>
    where
        F1: FnOnce(&Database) -> Result<()>,
        F2: FnOnce(u32, u32, &Database) -> Result<()>,
    {
        let backend_kind = match settings.backend {
            DatabaseBackend::InMemory => BackendKind::InMemory,
            DatabaseBackend::Kvdb { db, col } => BackendKind::Kvdb { db, col },
        };
        let meta = backend_kind.make_table(b"_meta:".to_vec());
        let stored_version = read_version(&*meta)?;

        let db = Database {
            inner: Arc::new(DatabaseInner {
                name: settings.name,
                backend_kind,
                meta,
                stores: RwLock::new(HashMap::new()),
                connected: Arc::new(AtomicBool::new(false)),
                next_tx_id: Arc::new(AtomicU64::new(0)),
                closed: AtomicBool::new(false),
            }),
        };

        if version > stored_version {
            log::info!(
                "upgrading database {:?} from version {} to {}",
                db.inner.name,
                stored_version,
                version
            );
        }

        declare_stores(&db)?;

        if version > stored_version {
            on_upgrade_needed(stored_version, version, &db)?;
            write_version(&*db.inner.meta, version)?;
        }

        db.inner.connected.store(true, Ordering::SeqCst);
        Ok(db)
    }

    fn run_deletion(&self, name: &str, index_names: &[String]) -> Result<()> {
        use crate::table::Table;
        log::info!("dropping object store {:?}", name);
        let prefix = format!("{}:", name).into_bytes();
        self.inner.backend_kind.make_table(prefix).truncate()?;
        for index_name in index_names {
            let prefix = format!("_{}-{}:", name, index_name).into_bytes();
            self.inner.backend_kind.make_table(prefix).truncate()?;
        }
        self.inner.stores.write().remove(name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> Result<u32> {
        read_version(&*self.inner.meta)
    }

    /// Only callable from `declare_stores` (i.e. before this database connects).
    pub fn create_object_store(&self, name: &str, options: ObjectStoreOptions) -> Result<ObjectStore> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::SchemaChangeWhileConnected);
        }
        let backend_kind = if options.in_memory { BackendKind::InMemory } else { self.inner.backend_kind.clone() };
        let store = ObjectStore::new(
            name.to_string(),
            backend_kind,
            self.inner.connected.clone(),
            self.inner.next_tx_id.clone(),
            options,
        );
        self.inner.stores.write().insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Only callable from `declare_stores` (i.e. before this database connects). Drops `name`'s
    /// primary table and every table named in `options.index_names` if `options.upgrade_condition`
    /// holds for `Database::version()` — the version being upgraded *from*, read before step 3 of
    /// `open`'s upgrade protocol writes the new one. If the condition doesn't hold, this is a
    /// no-op: the store's handle (if any survives from a prior `declare_stores` call) is left
    /// alone, matching `createObjectStore`'s own condition-gated semantics in reverse.
    pub fn delete_object_store(&self, name: &str, options: DeleteOptions) -> Result<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::SchemaChangeWhileConnected);
        }
        let old_version = self.version()?;
        if (options.upgrade_condition)(old_version) {
            self.run_deletion(name, &options.index_names)?;
        }
        Ok(())
    }

    pub fn get_object_store(&self, name: &str) -> Result<ObjectStore> {
        self.check_open()?;
        self.inner
            .stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownObjectStore(name.to_string()))
    }

    /// Close this handle to the database: further `get_object_store`/`commit_combined` calls on
    /// it fail. Existing `ObjectStore`/`Transaction` handles already handed out keep working —
    /// this crate never owns the underlying `KeyValueDB`'s lifecycle (the caller opened it and
    /// keeps it alive via its own `Arc`), so `close` only retires *this* `Database`'s own
    /// bookkeeping rather than tearing down shared storage other handles still reference.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        log::info!("database {:?} closed", self.inner.name);
    }

    /// Close this database and erase every declared object store's contents, including their
    /// indices, plus the persisted schema version. Reuses the ordinary truncate-then-commit path
    /// rather than reaching past the overlay machinery, so index tables are cleared exactly the
    /// way a transactional `truncate()` already clears them.
    pub fn destroy(&self) -> Result<()> {
        let names: Vec<String> = self.inner.stores.read().keys().cloned().collect();
        for name in names {
            if let Some(store) = self.inner.stores.read().get(&name).cloned() {
                let mut tx = store.synchronous_transaction();
                tx.truncate()?;
                tx.commit()?;
            }
        }
        self.inner.meta.truncate()?;
        self.inner.stores.write().clear();
        self.close();
        log::info!("database {:?} destroyed", self.inner.name);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::DatabaseClosed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Atomically commit several root transactions against sibling stores of this database
    /// (SPEC_FULL.md §4.6): either every one of them ends up `Committed`, or every one of them
    /// ends up `Conflicted`. There is no partial outcome.
    pub fn commit_combined(&self, txs: &mut [&mut Transaction]) -> Result<bool> {
        self.check_open()?;
        if txs.len() < 2 {
            return Err(Error::TypeError("commit_combined requires at least two transactions"));
        }
        for tx in txs.iter() {
            if tx.state() != TransactionState::Open {
                return Err(Error::InvalidState(tx.state()));
            }
        }

        let stores: Vec<Arc<ObjectStoreInner>> =
            txs.iter().map(|tx| tx.commit_store()).collect::<Result<_>>()?;

        let mut root_engine = None;
        for store in &stores {
            if let Some(engine) = store.root_engine() {
                match &root_engine {
                    None => root_engine = Some(engine),
                    Some(existing) if !Arc::ptr_eq(existing, &engine) => {
                        return Err(Error::TypeError(
                            "commit_combined requires sibling stores of the same database",
                        ));
                    }
                    _ => {}
                }
            }
        }

        // Hold every distinct participant's commit guard for the whole conflict-check-then-apply
        // window below, exactly as a single-store `commit()` holds its own — otherwise a racing
        // ordinary `Transaction::commit()` against one of these stores could land between this
        // combined commit's conflict check and its final batch write. Lock in a deterministic
        // (pointer) order rather than participant order so two overlapping combined commits can
        // never deadlock on each other.
        let mut lock_order: Vec<usize> = (0..stores.len()).collect();
        lock_order.sort_by_key(|&i| Arc::as_ptr(&stores[i]) as *const () as usize);
        lock_order.dedup_by_key(|&mut i| Arc::as_ptr(&stores[i]) as *const () as usize);
        let _guards: Vec<_> = lock_order.iter().map(|&i| stores[i].commit_guard()).collect();

        let mut per_tx_fragments = Vec::with_capacity(txs.len());
        for (tx, store) in txs.iter().zip(stores.iter()) {
            match store.apply_combined(tx)? {
                Some(fragments) => per_tx_fragments.push(fragments),
                None => {
                    log::debug!("combined commit conflict in database {:?}", self.inner.name);
                    for tx in txs.iter_mut() {
                        tx.mark_conflicted();
                    }
                    return Ok(false);
                }
            }
        }

        let mut kv_ops = Vec::new();
        let mut deferred = Vec::new();
        for fragments in per_tx_fragments {
            for fragment in fragments {
                match fragment {
                    BatchFragment::Kv(ops) => kv_ops.extend(ops),
                    BatchFragment::Deferred(run) => deferred.push(run),
                }
            }
        }

        if !kv_ops.is_empty() {
            let engine = root_engine.expect("Kv fragments only come from a Kvdb-backed store");
            let mut dbtx = kvdb::DBTransaction::new();
            for op in kv_ops {
                match op.value {
                    Some(v) => dbtx.put(op.col, &op.key, &v),
                    None => dbtx.delete(op.col, &op.key),
                }
            }
            if let Err(err) = engine.write(dbtx) {
                log::error!("combined commit write failed in database {:?}: {}", self.inner.name, err);
                for tx in txs.iter_mut() {
                    tx.mark_conflicted();
                }
                return Ok(false);
            }
        }

        for run in deferred {
            if run().is_err() {
                for tx in txs.iter_mut() {
                    tx.mark_conflicted();
                }
                return Ok(false);
            }
        }

        for tx in txs.iter_mut() {
            tx.mark_committed();
        }
        log::debug!("combined commit succeeded across {} stores in database {:?}", txs.len(), self.inner.name);
        Ok(true)
    }
}

fn read_version(meta: &dyn crate::table::Table) -> Result<u32> {
    match meta.get(DB_VERSION_KEY)? {
        Some(bytes) if bytes.len() == 4 => {
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        _ => Ok(0),
    }
}

fn write_version(meta: &dyn crate::table::Table, version: u32) -> Result<()> {
    use crate::table::TableBatch;
    meta.write_batch(TableBatch {
        puts: vec![(DB_VERSION_KEY.to_vec(), version.to_be_bytes().to_vec())],
        removes: vec![],
        truncate: false,
    })
}

// Reserved for a future on-disk registry of declared store/index names (SPEC_FULL.md Open
// Questions); unused while `declare_stores` re-runs on every open.
#[allow(dead_code)]
fn registry_key() -> &'static [u8] {
    STORE_REGISTRY_KEY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyRange;
    use std::sync::Arc as StdArc;

    fn settings(name: &str) -> DatabaseSettings {
        DatabaseSettings { name: name.to_string(), backend: DatabaseBackend::InMemory }
    }

    fn kvdb_settings(name: &str) -> (DatabaseSettings, Arc<dyn kvdb::KeyValueDB>) {
        let db: Arc<dyn kvdb::KeyValueDB> = StdArc::new(kvdb_memorydb::create(1));
        (DatabaseSettings { name: name.to_string(), backend: DatabaseBackend::Kvdb { db: db.clone(), col: 0 } }, db)
    }

    #[test]
    fn first_open_always_upgrades_from_version_zero() {
        let upgraded = StdArc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = upgraded.clone();
        let db = Database::open(
            settings("d"),
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            move |old, new, _db| {
                assert_eq!(old, 0);
                assert_eq!(new, 1);
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();
        assert!(upgraded.load(Ordering::SeqCst));
        assert_eq!(db.version().unwrap(), 1);
        assert!(db.get_object_store("widgets").is_ok());
    }

    #[test]
    fn reopen_at_same_version_skips_upgrade_callback() {
        let (settings, engine) = kvdb_settings("d");
        Database::open(
            settings,
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();

        let settings = DatabaseSettings { name: "d".to_string(), backend: DatabaseBackend::Kvdb { db: engine, col: 0 } };
        let db = Database::open(
            settings,
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| panic!("on_upgrade_needed must not run when the version hasn't changed"),
        )
        .unwrap();
        assert_eq!(db.version().unwrap(), 1);
    }

    #[test]
    fn create_object_store_after_connect_is_rejected() {
        let db = Database::open(settings("d"), 1, |_| Ok(()), |_, _, _| Ok(())).unwrap();
        match db.create_object_store("late", ObjectStoreOptions::default()) {
            Err(Error::SchemaChangeWhileConnected) => {}
            other => panic!("expected SchemaChangeWhileConnected, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn close_rejects_further_lookups_but_not_existing_handles() {
        let db = Database::open(
            settings("d"),
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();
        let store = db.get_object_store("widgets").unwrap();
        db.close();
        match db.get_object_store("widgets") {
            Err(Error::DatabaseClosed(_)) => {}
            other => panic!("expected DatabaseClosed, got {:?}", other.map(|_| ())),
        }
        // A handle obtained before `close()` keeps working: this crate never owns the
        // underlying engine's lifecycle.
        let mut tx = store.transaction();
        tx.put(b"k", b"v".to_vec()).unwrap();
        assert!(tx.commit().unwrap());
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn destroy_clears_every_store_and_the_version() {
        let db = Database::open(
            settings("d"),
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();
        let store = db.get_object_store("widgets").unwrap();
        let mut tx = store.transaction();
        tx.put(b"k", b"v".to_vec()).unwrap();
        assert!(tx.commit().unwrap());

        db.destroy().unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        assert_eq!(db.version().unwrap(), 0);
        match db.get_object_store("widgets") {
            Err(Error::DatabaseClosed(_)) => {}
            other => panic!("expected DatabaseClosed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn delete_object_store_is_conditional_on_the_version_upgraded_from() {
        let (settings, engine) = kvdb_settings("d");
        Database::open(
            settings,
            1,
            |db| {
                db.create_object_store("widgets", ObjectStoreOptions::default())?;
                db.create_object_store("gadgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();
        {
            let reopen =
                DatabaseSettings { name: "d".to_string(), backend: DatabaseBackend::Kvdb { db: engine.clone(), col: 0 } };
            let db = Database::open(
                reopen,
                1,
                |db| {
                    db.create_object_store("widgets", ObjectStoreOptions::default())?;
                    db.create_object_store("gadgets", ObjectStoreOptions::default())?;
                    Ok(())
                },
                |_, _, _| Ok(()),
            )
            .unwrap();
            let widgets = db.get_object_store("widgets").unwrap();
            let mut tx = widgets.transaction();
            tx.put(b"k", b"w".to_vec()).unwrap();
            assert!(tx.commit().unwrap());
            let gadgets = db.get_object_store("gadgets").unwrap();
            let mut tx = gadgets.transaction();
            tx.put(b"k", b"g".to_vec()).unwrap();
            assert!(tx.commit().unwrap());
        }

        // Upgrading from version 1 to 2: `upgrade_condition` holds for "widgets" (dropped) but
        // not for "gadgets" (left alone, data intact).
        let settings = DatabaseSettings { name: "d".to_string(), backend: DatabaseBackend::Kvdb { db: engine, col: 0 } };
        let db = Database::open(
            settings,
            2,
            |db| {
                db.delete_object_store(
                    "widgets",
                    DeleteOptions { index_names: vec![], upgrade_condition: Box::new(|old| old < 2) },
                )?;
                db.delete_object_store(
                    "gadgets",
                    DeleteOptions { index_names: vec![], upgrade_condition: Box::new(|old| old >= 2) },
                )?;
                db.create_object_store("gadgets", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();

        assert!(db.get_object_store("widgets").is_err());
        let gadgets = db.get_object_store("gadgets").unwrap();
        assert_eq!(gadgets.get(b"k").unwrap(), Some(b"g".to_vec()));
    }

    #[test]
    fn combined_commit_is_all_or_nothing_across_sibling_stores() {
        let db = Database::open(
            settings("d"),
            1,
            |db| {
                db.create_object_store("a", ObjectStoreOptions::default())?;
                db.create_object_store("b", ObjectStoreOptions::default())?;
                Ok(())
            },
            |_, _, _| Ok(()),
        )
        .unwrap();
        let store_a = db.get_object_store("a").unwrap();
        let store_b = db.get_object_store("b").unwrap();

        let mut tx_a = store_a.transaction();
        let mut tx_b = store_b.transaction();
        tx_a.put(b"k", b"va".to_vec()).unwrap();
        tx_b.put(b"k", b"vb".to_vec()).unwrap();
        assert!(db.commit_combined(&mut [&mut tx_a, &mut tx_b]).unwrap());
        assert_eq!(store_a.get(b"k").unwrap(), Some(b"va".to_vec()));
        assert_eq!(store_b.get(b"k").unwrap(), Some(b"vb".to_vec()));

        // A conflicting pair must leave *both* stores untouched.
        let mut seed = store_a.transaction();
        seed.put(b"k", b"stale-read".to_vec()).unwrap();
        assert!(seed.commit().unwrap());

        let mut stale_a = store_a.transaction();
        stale_a.get(b"k").unwrap(); // captures the pre-seed value as its old_value baseline
        let mut fresh_b = store_b.transaction();

        let mut racer = store_a.transaction();
        racer.put(b"k", b"raced".to_vec()).unwrap();
        assert!(racer.commit().unwrap());

        stale_a.put(b"k", b"should-not-land".to_vec()).unwrap();
        fresh_b.put(b"k2", b"should-not-land-either".to_vec()).unwrap();
        assert!(!db.commit_combined(&mut [&mut stale_a, &mut fresh_b]).unwrap());
        assert_eq!(store_a.get(b"k").unwrap(), Some(b"raced".to_vec()));
        assert_eq!(store_b.get(b"k2").unwrap(), None);
        assert_eq!(store_b.keys(&KeyRange::all()).unwrap(), vec![b"k".to_vec()]);
    }
}
