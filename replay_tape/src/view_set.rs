// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Precondition / postcondition summaries over instance views.
//!
//! A [`TraceViewSet`] answers "which fields of which views, within which
//! equivalence sets, does this template assume or establish". A
//! [`TraceConditionSet`] extends it with a version snapshot so a replay can
//! cheaply check that the world still looks like it did at record time.

use alloc::collections::BTreeMap;

use crate::ids::{EqSetId, ViewId};
use crate::mask::{FieldMask, FieldMaskSet};
use crate::runtime::RegionOracle;

/// A set of `(view, equivalence set, field mask)` entries.
///
/// For any `(view, eq)` key the stored mask is the union of inserted bits
/// minus invalidated bits; emptied entries disappear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceViewSet {
    conditions: BTreeMap<ViewId, FieldMaskSet<EqSetId>>,
}

impl TraceViewSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            conditions: BTreeMap::new(),
        }
    }

    /// Unions `mask` into the entry for `(view, eq)`.
    pub fn insert(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        if mask.is_empty() {
            return;
        }
        self.conditions.entry(view).or_default().insert(eq, mask);
    }

    /// Subtracts `mask` from the entry for `(view, eq)`.
    pub fn invalidate(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        if let Some(eqs) = self.conditions.get_mut(&view) {
            eqs.invalidate(&eq, mask);
            if eqs.is_empty() {
                self.conditions.remove(&view);
            }
        }
    }

    /// Checks whether the stored entry for `(view, eq)` covers every bit in
    /// `non_dominated`.
    ///
    /// Returns `true` on full coverage; otherwise `non_dominated` is reduced
    /// to the uncovered residual.
    pub fn dominates(&self, view: ViewId, eq: EqSetId, non_dominated: &mut FieldMask) -> bool {
        if let Some(eqs) = self.conditions.get(&view) {
            *non_dominated -= eqs.mask_of(&eq);
        }
        non_dominated.is_empty()
    }

    /// Mask stored for `(view, eq)`, or empty.
    #[must_use]
    pub fn mask_of(&self, view: ViewId, eq: EqSetId) -> FieldMask {
        self.conditions
            .get(&view)
            .map_or(FieldMask::EMPTY, |eqs| eqs.mask_of(&eq))
    }

    /// Returns `true` if every entry of `self` is dominated by `other`.
    #[must_use]
    pub fn subsumed_by(&self, other: &Self) -> bool {
        self.iter().all(|(view, eq, mask)| {
            let mut residual = mask;
            other.dominates(view, eq, &mut residual)
        })
    }

    /// Returns `true` if some view stores entries under two equivalence sets
    /// with overlapping fields where one set strictly refines the other.
    ///
    /// A refinement means the region tree was re-partitioned mid-trace, so
    /// the recorded conditions cannot be matched against a stable world.
    #[must_use]
    pub fn has_refinements<O: RegionOracle + ?Sized>(&self, oracle: &O) -> bool {
        for eqs in self.conditions.values() {
            let entries: alloc::vec::Vec<(EqSetId, FieldMask)> =
                eqs.iter().map(|(&eq, m)| (eq, m)).collect();
            for (i, &(eq_a, mask_a)) in entries.iter().enumerate() {
                for &(eq_b, mask_b) in &entries[i + 1..] {
                    if mask_a.overlaps(mask_b)
                        && (oracle.eq_refines(eq_a, eq_b) || oracle.eq_refines(eq_b, eq_a))
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Returns `true` if no entry is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Iterates entries in `(view, eq)` order.
    pub fn iter(&self) -> impl Iterator<Item = (ViewId, EqSetId, FieldMask)> + '_ {
        self.conditions
            .iter()
            .flat_map(|(&view, eqs)| eqs.iter().map(move |(&eq, mask)| (view, eq, mask)))
    }

    /// Views present in the set, in order.
    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.conditions.keys().copied()
    }
}

/// A [`TraceViewSet`] with a cached version snapshot per equivalence set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceConditionSet {
    set: TraceViewSet,
    versions: BTreeMap<EqSetId, u64>,
    ready: bool,
}

impl TraceConditionSet {
    /// Creates an empty condition set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            set: TraceViewSet::new(),
            versions: BTreeMap::new(),
            ready: false,
        }
    }

    /// Unions `mask` into the entry for `(view, eq)`.
    pub fn insert(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        self.set.insert(view, eq, mask);
    }

    /// Subtracts `mask` from the entry for `(view, eq)`.
    pub fn invalidate(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        self.set.invalidate(view, eq, mask);
    }

    /// The underlying view set.
    #[must_use]
    pub const fn views(&self) -> &TraceViewSet {
        &self.set
    }

    /// Materializes the version snapshot used by [`Self::require`].
    pub fn make_ready<O: RegionOracle + ?Sized>(&mut self, oracle: &O) {
        self.versions.clear();
        for (_, eq, _) in self.set.iter() {
            self.versions
                .entry(eq)
                .or_insert_with(|| oracle.version_of(eq));
        }
        self.ready = true;
    }

    /// Returns `true` if every condition currently holds: each equivalence
    /// set still has its snapshot version and each view still has the
    /// recorded fields valid.
    #[must_use]
    pub fn require<O: RegionOracle + ?Sized>(&self, oracle: &O) -> bool {
        debug_assert!(self.ready, "require before make_ready");
        for (&eq, &version) in &self.versions {
            if oracle.version_of(eq) != version {
                return false;
            }
        }
        self.set
            .iter()
            .all(|(view, eq, mask)| oracle.valid_fields(view, eq).contains(mask))
    }

    /// Re-establishes every condition in the current world, then refreshes
    /// the version snapshot.
    pub fn ensure<O: RegionOracle + ?Sized>(&mut self, oracle: &mut O) {
        for (view, eq, mask) in self.set.iter() {
            oracle.restore_fields(view, eq, mask);
        }
        self.make_ready(oracle);
    }
}
