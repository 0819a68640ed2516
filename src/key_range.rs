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

//! Bounded intervals over lexicographically ordered byte-string keys.

use std::ops::Bound;

use crate::Key;

/// A (possibly unbounded on either side) interval of keys with explicit inclusivity.
///
/// Keys are compared with unsigned lexicographic byte order, matching the ordering
/// guarantee every backend in this crate makes for `keys`/`values`/`min_key`/`max_key`.
/// An unbounded `KeyRange` (`KeyRange::all()`) stands in for the "no query" case used
/// throughout the read API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    /// The unbounded range: matches every key. Used where the public API takes `query: None`.
    pub fn all() -> Self {
        KeyRange { lower: Bound::Unbounded, upper: Bound::Unbounded }
    }

    /// `k >= lo` (or `k > lo` if `exclusive`), unbounded above.
    pub fn lower_bound(lo: Key, exclusive: bool) -> Self {
        KeyRange {
            lower: if exclusive { Bound::Excluded(lo) } else { Bound::Included(lo) },
            upper: Bound::Unbounded,
        }
    }

    /// `k <= hi` (or `k < hi` if `exclusive`), unbounded below.
    pub fn upper_bound(hi: Key, exclusive: bool) -> Self {
        KeyRange {
            lower: Bound::Unbounded,
            upper: if exclusive { Bound::Excluded(hi) } else { Bound::Included(hi) },
        }
    }

    /// Fully explicit two-sided bound.
    pub fn bound(lo: Key, hi: Key, lo_exclusive: bool, hi_exclusive: bool) -> Self {
        KeyRange {
            lower: if lo_exclusive { Bound::Excluded(lo) } else { Bound::Included(lo) },
            upper: if hi_exclusive { Bound::Excluded(hi) } else { Bound::Included(hi) },
        }
    }

    /// Matches exactly one key.
    pub fn only(k: Key) -> Self {
        KeyRange { lower: Bound::Included(k.clone()), upper: Bound::Included(k) }
    }

    /// Total membership test; never panics regardless of how the bounds were built.
    pub fn includes(&self, k: &[u8]) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(lo) => k >= lo.as_slice(),
            Bound::Excluded(lo) => k > lo.as_slice(),
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(hi) => k <= hi.as_slice(),
            Bound::Excluded(hi) => k < hi.as_slice(),
        };
        above_lower && below_upper
    }

    pub fn lower(&self) -> &Bound<Key> {
        &self.lower
    }

    pub fn upper(&self) -> &Bound<Key> {
        &self.upper
    }

    /// A copy of this range with the upper bound tightened to exclude `k` and everything above it.
    /// Used to restart a `max_key` backend search around a key that turned out to be staged for removal.
    pub fn capped_below(&self, k: &[u8]) -> Self {
        KeyRange { lower: self.lower.clone(), upper: Bound::Excluded(k.to_vec()) }
    }

    /// A copy of this range with the lower bound tightened to exclude `k` and everything below it.
    /// Used to restart a `min_key` backend search around a key staged for removal.
    pub fn capped_above(&self, k: &[u8]) -> Self {
        KeyRange { lower: Bound::Excluded(k.to_vec()), upper: self.upper.clone() }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        KeyRange::all()
    }
}
