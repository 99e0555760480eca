// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Embedder interface for `replay_tape`.
//!
//! The tape neither creates events nor touches region state on its own; it
//! delegates both to an embedder-provided runtime. [`EventFabric`] is the
//! data plane the interpreter drives at replay, [`RegionOracle`] answers the
//! region-state queries the condition sets need, and [`Memoizable`] is the
//! face of an operation participating in a template.

use alloc::vec::Vec;

use crate::ids::{
    ApEvent, ApUserEvent, EqSetId, ExprId, FieldId, GenId, InstanceId, OpKind, ProcId, RedopId,
    TraceLocalId, TreeId, UniqueId, VariantId, ViewId,
};
use crate::mask::FieldMask;

/// Access privilege of one region requirement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Privilege {
    /// No access.
    NoAccess,
    /// Read only.
    ReadOnly,
    /// Read and write.
    ReadWrite,
    /// Write, previous contents discarded.
    WriteDiscard,
    /// Reduction with the usage's `redop`.
    Reduce,
}

/// Access mode of one view user: privilege plus reduction operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionUsage {
    /// Privilege of the access.
    pub privilege: Privilege,
    /// Reduction operator; only meaningful with [`Privilege::Reduce`].
    pub redop: RedopId,
}

impl RegionUsage {
    /// Read-only usage.
    pub const READ_ONLY: Self = Self {
        privilege: Privilege::ReadOnly,
        redop: RedopId::NONE,
    };

    /// Read-write usage.
    pub const READ_WRITE: Self = Self {
        privilege: Privilege::ReadWrite,
        redop: RedopId::NONE,
    };

    /// Write-discard usage.
    pub const WRITE_DISCARD: Self = Self {
        privilege: Privilege::WriteDiscard,
        redop: RedopId::NONE,
    };

    /// Reduction usage with `redop`.
    #[must_use]
    pub const fn reduce(redop: RedopId) -> Self {
        Self {
            privilege: Privilege::Reduce,
            redop,
        }
    }

    /// Returns `true` if the usage reads existing data.
    #[must_use]
    #[inline]
    pub const fn reads(self) -> bool {
        matches!(self.privilege, Privilege::ReadOnly | Privilege::ReadWrite)
    }

    /// Returns `true` if the usage mutates the view.
    #[must_use]
    #[inline]
    pub const fn writes(self) -> bool {
        matches!(
            self.privilege,
            Privilege::ReadWrite | Privilege::WriteDiscard | Privilege::Reduce
        )
    }

    /// Returns `true` for a reduction usage.
    #[must_use]
    #[inline]
    pub const fn is_reduce(self) -> bool {
        matches!(self.privilege, Privilege::Reduce)
    }

    /// Two usages may touch the same data concurrently only if both are
    /// read-only or both reduce with the same operator.
    #[must_use]
    pub fn compatible(a: Self, b: Self) -> bool {
        (a.privilege == Privilege::ReadOnly && b.privilege == Privilege::ReadOnly)
            || (a.is_reduce() && b.is_reduce() && a.redop == b.redop)
    }
}

/// One field of a copy or fill: which instance and which field in it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CopySrcDstField {
    /// Target physical instance.
    pub inst: InstanceId,
    /// Field within the instance.
    pub field: FieldId,
}

/// Event creation, triggering, merging, and copy/fill issue.
///
/// The interpreter calls these during replay; the recorder calls
/// [`EventFabric::create_user_event`]/[`EventFabric::trigger_event`] only to
/// rename a merged event that would otherwise alias one of its operands.
pub trait EventFabric {
    /// Creates a fresh untriggered user event.
    fn create_user_event(&mut self) -> ApUserEvent;

    /// Triggers `user` once `precondition` has completed.
    fn trigger_event(&mut self, user: ApUserEvent, precondition: ApEvent);

    /// Merges events into one that completes when all inputs complete.
    ///
    /// An empty slice yields [`ApEvent::NO_EVENT`].
    fn merge_events(&mut self, preconditions: &[ApEvent]) -> ApEvent;

    /// Issues a copy over `expr`, returning its completion event.
    fn issue_copy(
        &mut self,
        expr: ExprId,
        src_fields: &[CopySrcDstField],
        dst_fields: &[CopySrcDstField],
        precondition: ApEvent,
        redop: RedopId,
        reduction_fold: bool,
    ) -> ApEvent;

    /// Issues a fill of `value` over `expr`, returning its completion event.
    fn issue_fill(
        &mut self,
        expr: ExprId,
        fields: &[CopySrcDstField],
        value: &[u8],
        precondition: ApEvent,
    ) -> ApEvent;
}

/// Region-state queries consumed by the condition sets.
pub trait RegionOracle {
    /// Current version of an equivalence set. Any structural change to the
    /// set (splits, remaps) must change this value.
    fn version_of(&self, eq: EqSetId) -> u64;

    /// Fields of `view` currently valid within `eq`.
    fn valid_fields(&self, view: ViewId, eq: EqSetId) -> FieldMask;

    /// Re-establishes `mask` of `view` as valid within `eq`.
    fn restore_fields(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask);

    /// Drops `mask` of `view` from the valid set of `eq`.
    fn invalidate_fields(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask);

    /// Returns `true` if the two index-space expressions intersect.
    fn exprs_overlap(&self, a: ExprId, b: ExprId) -> bool;

    /// Region tree the view's instance belongs to.
    fn view_tree(&self, view: ViewId) -> TreeId;

    /// Returns `true` if `view` is a reduction instance.
    fn is_reduction_view(&self, view: ViewId) -> bool;

    /// Returns `true` if `a` is a strict refinement of `b`.
    fn eq_refines(&self, a: EqSetId, b: EqSetId) -> bool;
}

/// Convenience bound for call sites needing the full embedder surface.
pub trait Runtime: EventFabric + RegionOracle {}

impl<T: EventFabric + RegionOracle> Runtime for T {}

/// The face of an operation the logical trace layer consumes.
pub trait Operation {
    /// Globally unique id of this operation instance.
    fn unique_id(&self) -> UniqueId;

    /// Kind discriminant from the external taxonomy.
    fn operation_kind(&self) -> OpKind;

    /// Number of region requirements.
    fn region_count(&self) -> u32;

    /// Internal ops are inserted by the scheduler for legality and may be
    /// regenerated differently on every pass over a trace.
    fn is_internal(&self) -> bool {
        false
    }
}

/// An operation that participates in a physical template.
pub trait Memoizable: Operation {
    /// Trace-local id binding this op to its template slots.
    fn trace_local_id(&self) -> TraceLocalId;

    /// Completion event of the operation.
    fn completion_event(&self) -> ApEvent;

    /// Event that must complete before the op's effects may start.
    fn compute_sync_precondition(&self) -> ApEvent;

    /// Hands the op its replayed completion precondition.
    fn complete_replay(&mut self, completion: ApEvent);
}

/// Mapper output cached for a memoized task and reused on every replay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedMapping {
    /// Chosen task variant.
    pub chosen_variant: VariantId,
    /// Task priority.
    pub task_priority: i32,
    /// Whether the mapper requested a postmap pass.
    pub postmap_task: bool,
    /// Target processors in mapping order.
    pub target_procs: Vec<ProcId>,
    /// Chosen physical instances per region requirement.
    pub physical_instances: Vec<Vec<InstanceId>>,
}

/// Key identifying one `(operation, generation)` registration.
pub type OpGen = (UniqueId, GenId);

#[cfg(test)]
mod tests {
    use super::{Privilege, RegionUsage};
    use crate::ids::RedopId;

    #[test]
    fn usage_compatibility() {
        let ro = RegionUsage::READ_ONLY;
        let rw = RegionUsage::READ_WRITE;
        let red1 = RegionUsage::reduce(RedopId(1));
        let red2 = RegionUsage::reduce(RedopId(2));

        assert!(RegionUsage::compatible(ro, ro));
        assert!(!RegionUsage::compatible(ro, rw));
        assert!(RegionUsage::compatible(red1, red1));
        assert!(!RegionUsage::compatible(red1, red2));
        assert!(!RegionUsage::compatible(red1, ro));
    }

    #[test]
    fn usage_classification() {
        assert!(RegionUsage::READ_WRITE.reads());
        assert!(RegionUsage::READ_WRITE.writes());
        assert!(!RegionUsage::WRITE_DISCARD.reads());
        assert!(RegionUsage::reduce(RedopId(3)).writes());
        assert!(!RegionUsage::READ_ONLY.writes());
        assert_eq!(
            RegionUsage::WRITE_DISCARD.privilege,
            Privilege::WriteDiscard
        );
    }
}
