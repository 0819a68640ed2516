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

//! Property and scenario tests that exercise a `Transaction`'s overlay against a plain
//! in-memory model, checking the invariants from SPEC_FULL.md §8 hold for arbitrary sequences
//! of `put`/`remove`/`truncate` rather than just the hand-picked scenarios in the unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use quickcheck::{quickcheck, Arbitrary, Gen, TestResult};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sc_object_store::{InMemoryTable, KeyRange, ObjectStore};

const ALPHABET: &[u8] = b"abcdefghij";

/// One scripted mutation against both a real `Transaction` and a plain `BTreeMap` model.
#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8),
    Remove(u8),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        let key = u8::arbitrary(g) % 5;
        if bool::arbitrary(g) {
            Op::Put(key, u8::arbitrary(g))
        } else {
            Op::Remove(key)
        }
    }
}

fn apply_to_model(model: &mut BTreeMap<u8, u8>, op: &Op) {
    match op {
        Op::Put(k, v) => {
            model.insert(*k, *v);
        }
        Op::Remove(k) => {
            model.remove(k);
        }
    }
}

quickcheck! {
    /// For any sequence of staged `put`/`remove` calls, a transaction's overlay reads
    /// (`get`, `keys`) agree with a plain map replaying the same sequence, both before and
    /// after `commit()` (SPEC_FULL.md §8 invariants 1-3).
    fn overlay_matches_model_before_and_after_commit(ops: Vec<Op>) -> TestResult {
        let store = ObjectStore::standalone("model".to_string(), Arc::new(InMemoryTable::new()), None);
        let mut tx = store.transaction();
        let mut model: BTreeMap<u8, u8> = BTreeMap::new();

        for op in &ops {
            apply_to_model(&mut model, op);
            match op {
                Op::Put(k, v) => tx.put(&[*k], vec![*v]).unwrap(),
                Op::Remove(k) => {
                    // `remove` is only meaningful once a key could exist; calling it on an
                    // absent key is also valid (it just stages a no-op removal) and is exercised
                    // too, matching the spec's "delete-after-write removes from modified"
                    // invariant rather than skipping it.
                    tx.remove(&[*k]).unwrap();
                }
            }
        }

        for (&k, &v) in &model {
            if tx.get(&[k]).unwrap() != Some(vec![v]) {
                return TestResult::failed();
            }
        }
        let mut overlay_keys: Vec<u8> = tx.keys(&KeyRange::all()).unwrap().into_iter().map(|k| k[0]).collect();
        overlay_keys.sort();
        let mut model_keys: Vec<u8> = model.keys().copied().collect();
        model_keys.sort();
        if overlay_keys != model_keys {
            return TestResult::failed();
        }

        if !tx.commit().unwrap() {
            // A lone transaction against a fresh store never conflicts.
            return TestResult::failed();
        }
        for (&k, &v) in &model {
            if store.get(&[k]).unwrap() != Some(vec![v]) {
                return TestResult::failed();
            }
        }
        let mut backend_keys: Vec<u8> = store.keys(&KeyRange::all()).unwrap().into_iter().map(|k| k[0]).collect();
        backend_keys.sort();
        if backend_keys != model_keys {
            return TestResult::failed();
        }
        TestResult::passed()
    }
}

/// A longer, seeded randomized stress run (independent of quickcheck's own shrinking generator):
/// repeatedly open a transaction, apply a random burst of `put`/`remove` over a wider key
/// alphabet, commit, and check the store matches a plain model after every round. Deterministic
/// across runs via a fixed seed, so a failure is reproducible without needing quickcheck's
/// shrunk counterexample machinery.
#[test]
fn randomized_commit_sequence_matches_model() {
    let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
    let store = ObjectStore::standalone("stress".to_string(), Arc::new(InMemoryTable::new()), None);
    let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

    for _round in 0..200 {
        let mut tx = store.transaction();
        let burst = rng.gen_range(1, 8);
        for _ in 0..burst {
            let key = *ALPHABET.get(rng.gen_range(0, ALPHABET.len())).unwrap();
            let value = vec![rng.gen::<u8>(), rng.gen::<u8>()];
            if rng.gen_bool(0.75) {
                tx.put(&[key], value.clone()).unwrap();
                model.insert(key, value);
            } else {
                tx.remove(&[key]).unwrap();
                model.remove(&key);
            }
        }
        assert!(tx.commit().unwrap(), "a lone transaction against an otherwise-idle store never conflicts");

        for (&k, v) in &model {
            assert_eq!(store.get(&[k]).unwrap().as_ref(), Some(v));
        }
        let mut backend_keys: Vec<u8> =
            store.keys(&KeyRange::all()).unwrap().into_iter().map(|k| k[0]).collect();
        backend_keys.sort();
        let mut model_keys: Vec<u8> = model.keys().copied().collect();
        model_keys.sort();
        assert_eq!(backend_keys, model_keys);
    }
}
