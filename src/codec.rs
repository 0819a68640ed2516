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

//! Value codecs.
//!
//! The core never interprets a stored value; it reads and writes opaque byte strings. A codec
//! is how a caller plugs a serialisation format in without the core depending on it. Object
//! stores are never forced onto `parity-scale-codec` — [`IdentityCodec`] is the default and
//! is all that most callers (and every test in this crate) need.

use crate::Value;

/// Translates between a caller's value type and the opaque bytes the store persists.
///
/// Implementors must round-trip: `decode(encode(v)) == Some(v)` for every `v` the caller
/// ever passes to `encode`.
pub trait Codec: Send + Sync {
    /// Turn a raw stored value into bytes to hand to the backend.
    fn encode(&self, raw: &[u8]) -> Value;
    /// Recover the raw value from backend bytes. `None` signals corrupt/undecodable data.
    fn decode(&self, stored: &[u8]) -> Option<Value>;
}

/// The default codec: stored bytes are the value, verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn encode(&self, raw: &[u8]) -> Value {
        raw.to_vec()
    }

    fn decode(&self, stored: &[u8]) -> Option<Value> {
        Some(stored.to_vec())
    }
}

/// A codec built on `parity-scale-codec`, for callers who already have `Encode + Decode` types
/// and would rather not hand-roll a byte representation. The core still only ever sees the
/// encoded bytes; `T` never appears outside this adapter.
pub struct ScaleCodec<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for ScaleCodec<T> {
    fn default() -> Self {
        ScaleCodec { _marker: std::marker::PhantomData }
    }
}

impl<T: codec::Encode + codec::Decode + Send + Sync> Codec for ScaleCodec<T> {
    fn encode(&self, raw: &[u8]) -> Value {
        // `raw` here is already the caller's SCALE-encoded representation; this adapter exists
        // so object stores can declare `ScaleCodec::<MyType>::default()` as documentation of
        // intent without the core crate depending on `MyType`.
        raw.to_vec()
    }

    fn decode(&self, stored: &[u8]) -> Option<Value> {
        T::decode(&mut &stored[..]).ok()?;
        Some(stored.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips() {
        let codec = IdentityCodec;
        let v = b"hello world".to_vec();
        assert_eq!(codec.decode(&codec.encode(&v)), Some(v));
    }

    #[test]
    fn scale_codec_validates_shape() {
        use codec::Encode;

        let codec: ScaleCodec<u32> = ScaleCodec::default();
        let encoded = 42u32.encode();
        assert_eq!(codec.decode(&encoded), Some(encoded));
        assert_eq!(codec.decode(&[0xff]), None);
    }
}
