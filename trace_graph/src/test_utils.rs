// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared mock runtime and operations for unit tests.

extern crate std;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use replay_tape::ids::{
    ApEvent, ApUserEvent, EqSetId, ExprId, OpKind, RedopId, TraceLocalId, TreeId, UniqueId, ViewId,
};
use replay_tape::mask::FieldMask;
use replay_tape::runtime::{CopySrcDstField, EventFabric, Memoizable, Operation, RegionOracle};

/// Deterministic mock of the embedder runtime.
#[derive(Default)]
pub(crate) struct MockRuntime {
    next_event: u64,
    pub(crate) triggered: Vec<(ApUserEvent, ApEvent)>,
    pub(crate) versions: BTreeMap<EqSetId, u64>,
    pub(crate) valid: BTreeMap<(ViewId, EqSetId), FieldMask>,
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
        self.triggered.push((user, precondition));
    }

    fn merge_events(&mut self, preconditions: &[ApEvent]) -> ApEvent {
        if preconditions.is_empty() {
            ApEvent::NO_EVENT
        } else {
            self.fresh_event()
        }
    }

    fn issue_copy(
        &mut self,
        _expr: ExprId,
        _src_fields: &[CopySrcDstField],
        _dst_fields: &[CopySrcDstField],
        _precondition: ApEvent,
        _redop: RedopId,
        _reduction_fold: bool,
    ) -> ApEvent {
        self.fresh_event()
    }

    fn issue_fill(
        &mut self,
        _expr: ExprId,
        _fields: &[CopySrcDstField],
        _value: &[u8],
        _precondition: ApEvent,
    ) -> ApEvent {
        self.fresh_event()
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
        a == b
    }

    fn view_tree(&self, _view: ViewId) -> TreeId {
        TreeId(0)
    }

    fn is_reduction_view(&self, view: ViewId) -> bool {
        self.reduction_views.contains(&view)
    }

    fn eq_refines(&self, _a: EqSetId, _b: EqSetId) -> bool {
        false
    }
}

/// Mock operation; memoizable so it can participate in templates.
#[derive(Clone, Debug)]
pub(crate) struct MockOp {
    pub(crate) uid: UniqueId,
    pub(crate) kind: OpKind,
    pub(crate) regions: u32,
    pub(crate) internal: bool,
    pub(crate) completion: ApEvent,
    pub(crate) completed_with: Option<ApEvent>,
}

impl MockOp {
    pub(crate) fn new(index: u64) -> Self {
        Self {
            uid: UniqueId(index),
            kind: OpKind(1),
            regions: 1,
            internal: false,
            completion: ApEvent(0x10 + index),
            completed_with: None,
        }
    }

    pub(crate) fn internal(index: u64) -> Self {
        Self {
            internal: true,
            ..Self::new(index)
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
        TraceLocalId(self.uid.0)
    }

    fn completion_event(&self) -> ApEvent {
        self.completion
    }

    fn compute_sync_precondition(&self) -> ApEvent {
        ApEvent::NO_EVENT
    }

    fn complete_replay(&mut self, completion: ApEvent) {
        self.completed_with = Some(completion);
    }
}
