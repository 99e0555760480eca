// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared mock runtime and operations for unit tests.

extern crate std;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use crate::ids::{
    ApEvent, ApUserEvent, EqSetId, ExprId, OpKind, RedopId, TraceLocalId, TreeId, UniqueId, ViewId,
};
use crate::mask::FieldMask;
use crate::runtime::{CopySrcDstField, EventFabric, Memoizable, Operation, RegionOracle};

/// One recorded fabric call, for assertions on replay behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FabricCall {
    Trigger(ApUserEvent, ApEvent),
    Merge(Vec<ApEvent>, ApEvent),
    Copy {
        expr: ExprId,
        precondition: ApEvent,
        redop: RedopId,
        result: ApEvent,
    },
    Fill {
        expr: ExprId,
        precondition: ApEvent,
        result: ApEvent,
    },
}

/// Deterministic mock of the embedder runtime.
#[derive(Default)]
pub(crate) struct MockRuntime {
    next_event: u64,
    merge_cache: BTreeMap<Vec<ApEvent>, ApEvent>,
    pub(crate) calls: Vec<FabricCall>,
    pub(crate) versions: BTreeMap<EqSetId, u64>,
    pub(crate) valid: BTreeMap<(ViewId, EqSetId), FieldMask>,
    pub(crate) overlaps: BTreeSet<(ExprId, ExprId)>,
    pub(crate) trees: BTreeMap<ViewId, TreeId>,
    pub(crate) refines: BTreeSet<(EqSetId, EqSetId)>,
    pub(crate) reduction_views: BTreeSet<ViewId>,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        Self {
            next_event: 0x100,
            ..Self::default()
        }
    }

    pub(crate) fn fresh_event(&mut self) -> ApEvent {
        self.next_event += 1;
        ApEvent(self.next_event)
    }
}

impl EventFabric for MockRuntime {
    fn create_user_event(&mut self) -> ApUserEvent {
        self.next_event += 1;
        ApUserEvent(self.next_event)
    }

    fn trigger_event(&mut self, user: ApUserEvent, precondition: ApEvent) {
        self.calls.push(FabricCall::Trigger(user, precondition));
    }

    fn merge_events(&mut self, preconditions: &[ApEvent]) -> ApEvent {
        if preconditions.is_empty() {
            return ApEvent::NO_EVENT;
        }
        // Merging is deterministic on its inputs, like the real event math.
        let key = preconditions.to_vec();
        let result = match self.merge_cache.get(&key) {
            Some(&cached) => cached,
            None => {
                let fresh = self.fresh_event();
                self.merge_cache.insert(key.clone(), fresh);
                fresh
            }
        };
        self.calls.push(FabricCall::Merge(key, result));
        result
    }

    fn issue_copy(
        &mut self,
        expr: ExprId,
        _src_fields: &[CopySrcDstField],
        _dst_fields: &[CopySrcDstField],
        precondition: ApEvent,
        redop: RedopId,
        _reduction_fold: bool,
    ) -> ApEvent {
        let result = self.fresh_event();
        self.calls.push(FabricCall::Copy {
            expr,
            precondition,
            redop,
            result,
        });
        result
    }

    fn issue_fill(
        &mut self,
        expr: ExprId,
        _fields: &[CopySrcDstField],
        _value: &[u8],
        precondition: ApEvent,
    ) -> ApEvent {
        let result = self.fresh_event();
        self.calls.push(FabricCall::Fill {
            expr,
            precondition,
            result,
        });
        result
    }
}

impl RegionOracle for MockRuntime {
    fn version_of(&self, eq: EqSetId) -> u64 {
        self.versions.get(&eq).copied().unwrap_or(0)
    }

    fn valid_fields(&self, view: ViewId, eq: EqSetId) -> FieldMask {
        self.valid
            .get(&(view, eq))
            .copied()
            .unwrap_or(FieldMask::EMPTY)
    }

    fn restore_fields(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        *self.valid.entry((view, eq)).or_default() |= mask;
    }

    fn invalidate_fields(&mut self, view: ViewId, eq: EqSetId, mask: FieldMask) {
        if let Some(m) = self.valid.get_mut(&(view, eq)) {
            *m -= mask;
        }
    }

    fn exprs_overlap(&self, a: ExprId, b: ExprId) -> bool {
        a == b || self.overlaps.contains(&(a, b)) || self.overlaps.contains(&(b, a))
    }

    fn view_tree(&self, view: ViewId) -> TreeId {
        self.trees.get(&view).copied().unwrap_or(TreeId(0))
    }

    fn is_reduction_view(&self, view: ViewId) -> bool {
        self.reduction_views.contains(&view)
    }

    fn eq_refines(&self, a: EqSetId, b: EqSetId) -> bool {
        self.refines.contains(&(a, b))
    }
}

/// Mock memoizable operation.
#[derive(Clone, Debug)]
pub(crate) struct MockOp {
    pub(crate) uid: UniqueId,
    pub(crate) kind: OpKind,
    pub(crate) regions: u32,
    pub(crate) internal: bool,
    pub(crate) tlid: TraceLocalId,
    pub(crate) completion: ApEvent,
    pub(crate) sync: ApEvent,
    pub(crate) completed_with: Option<ApEvent>,
}

impl MockOp {
    pub(crate) fn new(index: u64) -> Self {
        Self {
            uid: UniqueId(index),
            kind: OpKind(1),
            regions: 1,
            internal: false,
            tlid: TraceLocalId(index),
            completion: ApEvent(0x10 + index),
            sync: ApEvent::NO_EVENT,
            completed_with: None,
        }
    }
}

impl Operation for MockOp {
    fn unique_id(&self) -> UniqueId {
        self.uid
    }

    fn operation_kind(&self) -> OpKind {
        self.kind
    }

    fn region_count(&self) -> u32 {
        self.regions
    }

    fn is_internal(&self) -> bool {
        self.internal
    }
}

impl Memoizable for MockOp {
    fn trace_local_id(&self) -> TraceLocalId {
        self.tlid
    }

    fn completion_event(&self) -> ApEvent {
        self.completion
    }

    fn compute_sync_precondition(&self) -> ApEvent {
        self.sync
    }

    fn complete_replay(&mut self, completion: ApEvent) {
        self.completed_with = Some(completion);
    }
}
