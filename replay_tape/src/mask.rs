// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Field masks and field-mask-keyed sets.
//!
//! A [`FieldMask`] is a fixed-width set of field indices. Two words cover the
//! 128 traced fields the tape supports; masks are `Copy` so dependence and
//! condition records can carry them by value.

use alloc::collections::BTreeMap;
use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

const WORDS: usize = 2;

/// A set of field indices in `0..FieldMask::MAX_FIELDS`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldMask {
    bits: [u64; WORDS],
}

impl FieldMask {
    /// Number of representable fields.
    pub const MAX_FIELDS: u32 = (WORDS as u32) * 64;

    /// The empty mask.
    pub const EMPTY: Self = Self { bits: [0; WORDS] };

    /// Mask with a single field set.
    ///
    /// Out-of-range indices yield the empty mask.
    #[must_use]
    pub const fn bit(index: u32) -> Self {
        if index >= Self::MAX_FIELDS {
            return Self::EMPTY;
        }
        let mut bits = [0_u64; WORDS];
        bits[(index / 64) as usize] = 1 << (index % 64);
        Self { bits }
    }

    /// Builds a mask from raw words (word 0 holds fields 0..64).
    #[must_use]
    pub const fn from_words(bits: [u64; WORDS]) -> Self {
        Self { bits }
    }

    /// Returns `true` if no field is set.
    #[must_use]
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.bits[0] == 0 && self.bits[1] == 0
    }

    /// Returns `true` if `field` is set.
    #[must_use]
    #[inline]
    pub const fn contains_field(self, field: u32) -> bool {
        field < Self::MAX_FIELDS && (self.bits[(field / 64) as usize] >> (field % 64)) & 1 == 1
    }

    /// Returns `true` if every field of `other` is also set in `self`.
    #[must_use]
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        (other - self).is_empty()
    }

    /// Returns `true` if the two masks share at least one field.
    #[must_use]
    #[inline]
    pub fn overlaps(self, other: Self) -> bool {
        !(self & other).is_empty()
    }

    /// Number of fields set.
    #[must_use]
    pub fn pop_count(self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterates set field indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..Self::MAX_FIELDS).filter(move |&i| self.contains_field(i))
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            bits: [self.bits[0] | rhs.bits[0], self.bits[1] | rhs.bits[1]],
        }
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl BitAnd for FieldMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self {
            bits: [self.bits[0] & rhs.bits[0], self.bits[1] & rhs.bits[1]],
        }
    }
}

impl BitAndAssign for FieldMask {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl Sub for FieldMask {
    type Output = Self;

    /// Set difference.
    fn sub(self, rhs: Self) -> Self {
        Self {
            bits: [self.bits[0] & !rhs.bits[0], self.bits[1] & !rhs.bits[1]],
        }
    }
}

impl SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.bits[1], self.bits[0])
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.bits[1], self.bits[0])
    }
}

/// A small map from keys to non-empty field masks with set semantics.
///
/// Insertion unions, invalidation subtracts and drops entries that become
/// empty. Iteration order is the key order, which keeps downstream recording
/// deterministic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMaskSet<T: Ord> {
    entries: BTreeMap<T, FieldMask>,
}

impl<T: Ord> Default for FieldMaskSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Ord> FieldMaskSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Unions `mask` into the entry for `key`.
    ///
    /// Returns `true` if the key was not present before. Empty masks are
    /// ignored and never create entries.
    pub fn insert(&mut self, key: T, mask: FieldMask) -> bool {
        if mask.is_empty() {
            return false;
        }
        match self.entries.get_mut(&key) {
            Some(m) => {
                *m |= mask;
                false
            }
            None => {
                self.entries.insert(key, mask);
                true
            }
        }
    }

    /// Subtracts `mask` from the entry for `key`, removing it if it empties.
    pub fn invalidate(&mut self, key: &T, mask: FieldMask) {
        if let Some(m) = self.entries.get_mut(key) {
            *m -= mask;
            if m.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Returns the mask stored for `key`, or the empty mask.
    #[must_use]
    pub fn mask_of(&self, key: &T) -> FieldMask {
        self.entries.get(key).copied().unwrap_or(FieldMask::EMPTY)
    }

    /// Returns `true` if no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys with a non-empty mask.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates `(key, mask)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&T, FieldMask)> {
        self.entries.iter().map(|(k, &m)| (k, m))
    }

    /// Union of every stored mask.
    #[must_use]
    pub fn summary_mask(&self) -> FieldMask {
        self.entries
            .values()
            .fold(FieldMask::EMPTY, |acc, &m| acc | m)
    }

    /// Returns `true` if every entry of `self` is covered by `other`.
    #[must_use]
    pub fn subsumed_by(&self, other: &Self) -> bool {
        self.iter().all(|(k, m)| other.mask_of(k).contains(m))
    }
}
