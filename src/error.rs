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

//! Error taxonomy for the object-store layer.

use crate::transaction::TransactionState;

/// Everything that can go wrong talking to a [`crate::ObjectStore`] or [`crate::Transaction`].
///
/// `Conflict` is deliberately *not* a variant here: a failed optimistic commit is reported as
/// `Ok(false)` from [`crate::Transaction::commit`], not as an `Err`. Conflicts are expected,
/// not exceptional.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `put`/`remove`/`truncate`/`commit`/`abort` called on a transaction that isn't `Open`,
    /// or a nested commit attempted against a parent that has already reached a terminal state.
    #[error("transaction is not open (state: {0:?})")]
    InvalidState(TransactionState),

    /// A value that was expected to be a `Transaction` (e.g. passed to `commit_combined`) wasn't.
    #[error("expected a transaction: {0}")]
    TypeError(&'static str),

    /// `create_index` called on a transaction rather than on an `ObjectStore` before connect.
    #[error("indices can only be created on an object store before the database connects")]
    SchemaChangeNotInTransaction,

    /// `create_object_store`/`delete_object_store` called after the owning database connected.
    #[error("object stores can only be created or deleted before the database connects")]
    SchemaChangeWhileConnected,

    /// The watchdog deadline elapsed before the transaction reached a terminal state.
    #[error("transaction {0} exceeded its watchdog deadline and was aborted")]
    WatchdogTimeout(u64),

    /// No object store is registered under this name.
    #[error("no such object store: {0:?}")]
    UnknownObjectStore(String),

    /// The owning `Database` handle was `close()`d; further schema lookups through it are
    /// rejected even though already-issued `ObjectStore`/`Transaction` handles keep working.
    #[error("database {0:?} is closed")]
    DatabaseClosed(String),

    /// No index is registered under this name on the given object store.
    #[error("no such index {1:?} on object store {0:?}")]
    UnknownIndex(String, String),

    /// Propagated I/O failure from the underlying ordered key/value engine.
    #[error("backend I/O error: {0}")]
    Backend(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
