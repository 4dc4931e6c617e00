//! A compact growable bitset (spec §9: "use a compact growable bitset;
//! serialize as a length-prefixed bit string for the resume journal").
//!
//! Backs `open_file::read_state` and `ring_buffer_open_file::ring_state`.

use bitvec::prelude::{BitVec, Lsb0};
use serde::{Deserialize, Serialize};

/// A growable bitset over a logical length, independent of the storage
/// word size.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Bitset(BitVec<u8, Lsb0>);

impl Bitset {
    /// A bitset of `len` bits, all clear.
    pub fn zeros(len: usize) -> Self {
        Self(BitVec::repeat(false, len))
    }

    /// A bitset of `len` bits, all set.
    pub fn ones(len: usize) -> Self {
        Self(BitVec::repeat(true, len))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> bool {
        self.0.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx < self.0.len() {
            self.0.set(idx, value);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.0.count_ones()
    }

    /// True iff every bit is set (and the set is non-empty per spec's
    /// `read_state` semantics of "all chunks materialized").
    pub fn all(&self) -> bool {
        !self.0.is_empty() && self.0.all()
    }

    /// Fraction of bits set, for `download_progress` (`popcount/len`).
    pub fn fraction(&self) -> f64 {
        if self.0.is_empty() {
            1.0
        } else {
            self.count_ones() as f64 / self.len() as f64
        }
    }

    /// Resize to `new_len`, preserving existing bits and zero-filling any
    /// newly added tail bits. Used by `resize`/`truncate` to grow/shrink
    /// `read_state` (spec §4.3.6 step 8).
    pub fn resize(&mut self, new_len: usize) {
        self.0.resize(new_len, false);
    }

    /// Serialize as a length-prefixed bit string for the resume journal
    /// (spec §9).
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(self.len() as u64, self.0.clone().into_vec()))
            .expect("bitset serialization is infallible")
    }

    /// Deserialize a bitset previously produced by [`Bitset::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let (len, words): (u64, Vec<u8>) = bincode::deserialize(bytes)?;
        let mut bits: BitVec<u8, Lsb0> = BitVec::from_vec(words);
        bits.resize(len as usize, false);
        Ok(Self(bits))
    }
}

impl Serialize for Bitset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (self.len() as u64, self.0.clone().into_vec()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bitset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (len, words): (u64, Vec<u8>) = Deserialize::deserialize(deserializer)?;
        let mut bits: BitVec<u8, Lsb0> = BitVec::from_vec(words);
        bits.resize(len as usize, false);
        Ok(Self(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_then_set_counts_ones() {
        let mut b = Bitset::zeros(10);
        assert_eq!(b.count_ones(), 0);
        b.set(3, true);
        b.set(7, true);
        assert_eq!(b.count_ones(), 2);
        assert!(!b.all());
    }

    #[test]
    fn all_true_only_when_every_bit_set_and_nonempty() {
        assert!(!Bitset::zeros(0).all());
        assert!(Bitset::ones(5).all());
        let mut b = Bitset::zeros(5);
        for i in 0..5 {
            b.set(i, true);
        }
        assert!(b.all());
    }

    #[test]
    fn resize_preserves_existing_bits_and_zero_fills_tail() {
        let mut b = Bitset::zeros(4);
        b.set(0, true);
        b.set(3, true);
        b.resize(8);
        assert_eq!(b.len(), 8);
        assert!(b.get(0));
        assert!(b.get(3));
        assert!(!b.get(4));
        assert!(!b.get(7));

        b.resize(2);
        assert_eq!(b.len(), 2);
        assert!(b.get(0));
    }

    #[test]
    fn fraction_matches_popcount_over_len() {
        let mut b = Bitset::zeros(4);
        b.set(0, true);
        b.set(1, true);
        assert_eq!(b.fraction(), 0.5);
    }

    #[test]
    fn byte_round_trip_preserves_bits() {
        let mut b = Bitset::zeros(13);
        b.set(0, true);
        b.set(12, true);
        b.set(5, true);
        let bytes = b.to_bytes();
        let restored = Bitset::from_bytes(&bytes).unwrap();
        assert_eq!(b, restored);
    }
}
