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

//! A transactional, indexed object-store layer over an ordered key/value backend.
//!
//! A [`Database`] owns a set of named [`ObjectStore`]s (tables) sharing one backend engine and
//! one schema version. Each object store hands out snapshot-isolated [`Transaction`]s: mutations
//! are staged in the transaction's own overlay and only reach the backend on `commit()`, which
//! either succeeds outright or reports a conflict without touching the backend at all. Several
//! transactions against sibling stores of the same database can be committed atomically together
//! through [`Database::commit_combined`].
//!
//! ```
//! use sc_object_store::{InMemoryTable, ObjectStore};
//! use std::sync::Arc;
//!
//! let store = ObjectStore::standalone(
//!     "widgets".to_string(),
//!     Arc::new(InMemoryTable::new()),
//!     None,
//! );
//! let mut tx = store.transaction();
//! tx.put(b"a", b"1".to_vec()).unwrap();
//! assert!(tx.commit().unwrap());
//! assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
//! ```

mod cache;
mod codec;
mod database;
mod error;
mod index;
mod key_range;
mod object_store;
mod overlay;
mod table;
mod transaction;

/// A table key: opaque bytes, compared with unsigned lexicographic byte order everywhere in
/// this crate.
pub type Key = Vec<u8>;
/// An opaque, codec-encoded value. The core never interprets these bytes.
pub type Value = Vec<u8>;

pub use crate::cache::CachedTable;
pub use crate::codec::{Codec, IdentityCodec, ScaleCodec};
pub use crate::database::{Database, DatabaseBackend, DatabaseSettings, DeleteOptions};
pub use crate::error::{Error, Result};
pub use crate::index::{IndexDef, IndexHandle, KeyPath};
pub use crate::key_range::KeyRange;
pub use crate::object_store::{IndexHandleOwned, IndexOptions, ObjectStore, ObjectStoreOptions};
pub use crate::table::{BackendKind, BatchFragment, InMemoryTable, KvOp, KvdbTable, Table, TableBatch};
pub use crate::transaction::{Transaction, TransactionState, DEFAULT_WATCHDOG};
