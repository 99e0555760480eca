// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dependence records captured by a trace.
//!
//! Records are keyed by the index of the earlier operation within the trace;
//! requirement indices of `-1` denote whole-operation dependences. Two
//! records that agree on everything but the field mask are the same
//! dependence and merge by unioning masks.

use alloc::vec::Vec;

use replay_tape::mask::FieldMask;

/// Region-graph dependence taxonomy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependenceKind {
    /// No dependence.
    No,
    /// Read-after-write or write-after-write.
    True,
    /// Write-after-read.
    Anti,
    /// Atomic coherence dependence.
    Atomic,
    /// Simultaneous coherence dependence.
    Simultaneous,
}

/// Requirement index denoting a whole-operation dependence.
pub const WHOLE_OP: i32 = -1;

/// One captured dependence of a later operation on an earlier one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependenceRecord {
    /// Index of the earlier operation within the trace.
    pub operation_idx: i32,
    /// Requirement index on the earlier operation, [`WHOLE_OP`] if none.
    pub prev_idx: i32,
    /// Requirement index on the later operation, [`WHOLE_OP`] if none.
    pub next_idx: i32,
    /// Whether the later requirement validates the earlier one.
    pub validates: bool,
    /// Dependence kind.
    pub dtype: DependenceKind,
    /// Fields the dependence covers; empty for whole-op records.
    pub dependent_mask: FieldMask,
}

impl DependenceRecord {
    /// A whole-operation dependence on the op at `operation_idx`.
    #[must_use]
    pub const fn whole_op(operation_idx: i32) -> Self {
        Self {
            operation_idx,
            prev_idx: WHOLE_OP,
            next_idx: WHOLE_OP,
            validates: false,
            dtype: DependenceKind::True,
            dependent_mask: FieldMask::EMPTY,
        }
    }

    /// A fine-grained region dependence.
    #[must_use]
    pub const fn region(
        operation_idx: i32,
        prev_idx: i32,
        next_idx: i32,
        validates: bool,
        dtype: DependenceKind,
        dependent_mask: FieldMask,
    ) -> Self {
        Self {
            operation_idx,
            prev_idx,
            next_idx,
            validates,
            dtype,
            dependent_mask,
        }
    }

    /// Returns `true` if this record covers a whole operation.
    #[must_use]
    pub const fn is_whole_op(&self) -> bool {
        self.prev_idx == WHOLE_OP || self.next_idx == WHOLE_OP
    }

    /// Merges `other` into `self` if the two records agree on everything
    /// but the mask. Returns `false` (leaving `self` untouched) otherwise.
    pub fn merge(&mut self, other: &Self) -> bool {
        if self.operation_idx != other.operation_idx
            || self.prev_idx != other.prev_idx
            || self.next_idx != other.next_idx
            || self.validates != other.validates
            || self.dtype != other.dtype
        {
            return false;
        }
        self.dependent_mask |= other.dependent_mask;
        true
    }
}

/// Inserts `record` into `records`, merging with the last element when the
/// two have the same shape.
///
/// Dependence analysis emits records for one pair of operations in bursts,
/// so checking only the tail keeps the common case O(1) while upholding the
/// invariant that no two mergeable records coexist in one incoming list.
pub fn merge_in(records: &mut Vec<DependenceRecord>, record: DependenceRecord) {
    if let Some(last) = records.last_mut()
        && last.merge(&record)
    {
        return;
    }
    records.push(record);
}

/// A dependence the application supplies up front for a static trace.
///
/// `previous_offset` counts backwards from the operation being registered to
/// the operation depended on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticDependence {
    /// How many operations back the dependence target sits.
    pub previous_offset: u32,
    /// Requirement index on the earlier operation.
    pub previous_req_index: u32,
    /// Requirement index on the current operation.
    pub current_req_index: u32,
    /// Dependence kind.
    pub dependence_type: DependenceKind,
    /// Whether the current requirement validates the earlier one.
    pub validates: bool,
    /// Fields the dependence covers.
    pub dependent_mask: FieldMask,
}
