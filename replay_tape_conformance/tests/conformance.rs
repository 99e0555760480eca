// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(missing_docs, reason = "integration test crate")]

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use replay_tape::ids::{
    ApEvent, ApUserEvent, EqSetId, ExprId, GenId, OpKind, RedopId, TraceId, TraceLocalId, TreeId,
    UniqueId, ViewId,
};
use replay_tape::mask::FieldMask;
use replay_tape::registry::{FixOutcome, ReplayConfig};
use replay_tape::runtime::{
    CopySrcDstField, EventFabric, Memoizable, Operation, RegionOracle, RegionUsage,
};
use replay_tape::template::{PhysicalTemplate, ReplayBindings, TracedView};
use replay_tape::view_set::TraceViewSet;
use trace_graph::logical::{LogicalTrace, TraceVariant};
use trace_graph::ops::{ReplayDecision, TraceBeginOp, TraceCaptureOp, TraceCompleteOp, TraceReplayOp};
use trace_graph::record::{DependenceKind, DependenceRecord, merge_in};
use trace_graph::TraceError;

const GEN: GenId = GenId(1);
const F0: FieldMask = FieldMask::bit(0);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    Trigger(ApUserEvent, ApEvent),
    Merge(Vec<ApEvent>, ApEvent),
    Copy {
        expr: ExprId,
        precondition: ApEvent,
        result: ApEvent,
    },
}

#[derive(Default)]
struct TestRuntime {
    next_event: u64,
    calls: Vec<Call>,
    versions: BTreeMap<EqSetId, u64>,
    valid: BTreeMap<(ViewId, EqSetId), FieldMask>,
    reduction_views: BTreeSet<ViewId>,
}

impl TestRuntime {
    fn new() -> Self {
        Self {
            next_event: 0x1000,
            ..Self::default()
        }
    }

    fn fresh_event(&mut self) -> ApEvent {
        self.next_event += 1;
        ApEvent(self.next_event)
    }

    fn copies(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Copy { .. }))
            .collect()
    }
}

impl EventFabric for TestRuntime {
    fn create_user_event(&mut self) -> ApUserEvent {
        self.next_event += 1;
        ApUserEvent(self.next_event)
    }

    fn trigger_event(&mut self, user: ApUserEvent, precondition: ApEvent) {
        self.calls.push(Call::Trigger(user, precondition));
    }

    fn merge_events(&mut self, preconditions: &[ApEvent]) -> ApEvent {
        if preconditions.is_empty() {
            return ApEvent::NO_EVENT;
        }
        let result = self.fresh_event();
        self.calls.push(Call::Merge(preconditions.to_vec(), result));
        result
    }

    fn issue_copy(
        &mut self,
        expr: ExprId,
        _src_fields: &[CopySrcDstField],
        _dst_fields: &[CopySrcDstField],
        precondition: ApEvent,
        _redop: RedopId,
        _reduction_fold: bool,
    ) -> ApEvent {
        let result = self.fresh_event();
        self.calls.push(Call::Copy {
            expr,
            precondition,
            result,
        });
        result
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

impl RegionOracle for TestRuntime {
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

#[derive(Clone, Debug)]
struct TestOp {
    uid: UniqueId,
    kind: OpKind,
    regions: u32,
    internal: bool,
    completion: ApEvent,
    completed_with: Option<ApEvent>,
}

impl TestOp {
    fn task(index: u64) -> Self {
        Self {
            uid: UniqueId(index),
            kind: OpKind(1),
            regions: 1,
            internal: false,
            completion: ApEvent(0x10 + index),
            completed_with: None,
        }
    }

    fn internal(index: u64) -> Self {
        Self {
            internal: true,
            ..Self::task(index)
        }
    }
}

impl Operation for TestOp {
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

impl Memoizable for TestOp {
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

fn traced(view: u64, expr: u64) -> TracedView {
    TracedView {
        view: ViewId(view),
        eq: EqSetId(1),
        mask: F0,
        expr: ExprId(expr),
    }
}

fn record_copy(
    tpl: &mut PhysicalTemplate,
    rt: &mut TestRuntime,
    owner: &TestOp,
    precondition: ApEvent,
    dst: TracedView,
) -> ApEvent {
    let mut lhs = rt.fresh_event();
    tpl.record_issue_copy(
        owner,
        &mut lhs,
        dst.expr,
        &[],
        &[],
        precondition,
        RedopId::NONE,
        false,
        &[],
        &[dst],
        rt,
    );
    lhs
}

// ---------------------------------------------------------------------
// Scenario 1: trivial pipeline.
// ---------------------------------------------------------------------

#[test]
fn trivial_pipeline_captures_and_replays_the_dependence() {
    let task_a = TestOp::task(0);
    let task_b = TestOp::task(1);
    let mut trace = LogicalTrace::new_dynamic(TraceId(0));

    trace.register_operation(&task_a, GEN).unwrap();
    trace.register_operation(&task_b, GEN).unwrap();
    trace.record_region_dependence(
        &task_a,
        GEN,
        &task_b,
        GEN,
        0,
        0,
        DependenceKind::True,
        false,
        F0,
    );
    if let TraceVariant::Dynamic(d) = trace.variant_mut() {
        d.end_trace_capture();
        d.fix_trace();
    }
    trace.end_trace_execution();

    // Replay with the same two operations succeeds and reproduces the
    // captured true dependence on {f0}.
    let gen2 = GenId(2);
    assert!(trace.register_operation(&task_a, gen2).unwrap().is_empty());
    let replayed = trace.register_operation(&task_b, gen2).unwrap();
    assert_eq!(
        replayed,
        [DependenceRecord::region(
            0,
            0,
            0,
            false,
            DependenceKind::True,
            F0
        )]
    );
    trace.end_trace_execution();

    // Replay with TaskB alone is rejected: position 0 captured TaskA's
    // signature.
    let mut lone = TestOp::task(2);
    lone.kind = OpKind(3);
    assert!(matches!(
        trace.register_operation(&lone, gen2),
        Err(TraceError::ShapeMismatch { index: 0, .. })
    ));
}

// ---------------------------------------------------------------------
// Scenario 2: internal-op flattening.
// ---------------------------------------------------------------------

#[test]
fn internal_close_op_flattens_to_a_transitive_dependence() {
    let task_a = TestOp::task(0);
    let close = TestOp::internal(10);
    let task_b = TestOp::task(1);
    let mut trace = LogicalTrace::new_dynamic(TraceId(0));

    let child1 = F0 | FieldMask::bit(1);
    let child2 = FieldMask::bit(1) | FieldMask::bit(2);

    trace.register_operation(&task_a, GEN).unwrap();
    trace.register_operation(&close, GEN).unwrap();
    trace.record_region_dependence(
        &task_a,
        GEN,
        &close,
        GEN,
        0,
        0,
        DependenceKind::Anti,
        true,
        child1,
    );
    trace.register_operation(&task_b, GEN).unwrap();
    trace.record_region_dependence(
        &close,
        GEN,
        &task_b,
        GEN,
        0,
        0,
        DependenceKind::True,
        false,
        child2,
    );

    let TraceVariant::Dynamic(d) = trace.variant() else {
        unreachable!();
    };
    let deps_b = &d.dependences()[1];
    assert_eq!(deps_b.len(), 1);
    let record = &deps_b[0];
    assert_eq!(record.operation_idx, 0);
    assert!(!record.validates);
    assert_eq!(record.dtype, DependenceKind::True);
    assert_eq!(record.dependent_mask, child1 & child2);
}

// ---------------------------------------------------------------------
// Scenario 3: fence elision across recurrent replays.
// ---------------------------------------------------------------------

#[test]
fn recurrent_replays_chain_instead_of_waiting_on_the_fence() {
    let mut rt = TestRuntime::new();
    let mut op = TestOp::task(0);
    let mut trace = LogicalTrace::new_dynamic(TraceId(0));
    let mut replay_op = TraceReplayOp::new();

    // Recording pass: the only copy waits on the fence alone.
    let fence1 = rt.fresh_event();
    TraceBeginOp::new(fence1).trigger(&mut trace);
    assert_eq!(
        replay_op.trigger(&mut trace, &mut rt, ReplayConfig::default(), fence1, None),
        ReplayDecision::Record
    );
    trace.register_operation(&op, GEN).unwrap();
    {
        let tpl = trace
            .physical_mut()
            .and_then(|p| p.current_recording_mut())
            .unwrap();
        tpl.record_get_term_event(&op);
        let first = record_copy(tpl, &mut rt, &op, fence1, traced(1, 1));
        let _second = record_copy(tpl, &mut rt, &op, first, traced(2, 2));
    }
    assert!(matches!(
        TraceCaptureOp::new(false).trigger(&mut trace, &mut rt, None),
        Some(FixOutcome::Stored { .. })
    ));
    TraceCompleteOp::new(false).trigger(&mut trace, &mut rt);

    let mut run_replay = |trace: &mut LogicalTrace,
                          rt: &mut TestRuntime,
                          op: &mut TestOp,
                          replay_op: &mut TraceReplayOp|
     -> (ReplayDecision, Vec<Call>) {
        let fence = rt.fresh_event();
        TraceBeginOp::new(fence).trigger(trace);
        let decision = replay_op.trigger(trace, rt, ReplayConfig::default(), fence, None);
        let start = rt.calls.len();
        {
            let tpl = trace
                .physical_mut()
                .and_then(|p| p.current_template_mut())
                .unwrap();
            let mut bindings = ReplayBindings::new();
            bindings.bind(op);
            tpl.execute_all(&mut bindings, rt).unwrap();
        }
        let calls = rt.calls[start..].to_vec();
        TraceCompleteOp::new(true).trigger(trace, rt);
        (decision, calls)
    };

    // First replay is not recurrent.
    let (decision, _) = run_replay(&mut trace, &mut rt, &mut op, &mut replay_op);
    assert!(matches!(
        decision,
        ReplayDecision::Replay {
            recurrent: false,
            ..
        }
    ));
    let chained_after_first: Vec<ApEvent> = {
        let physical = trace.physical().unwrap();
        let tpl = &physical.templates()[0];
        tpl.frontiers()
            .values()
            .map(|&slot| tpl.events()[slot])
            .collect()
    };

    // Second replay is recurrent: its first copy must not wait on the new
    // fence but on state produced by the previous replay.
    let (decision, calls) = run_replay(&mut trace, &mut rt, &mut op, &mut replay_op);
    assert!(matches!(
        decision,
        ReplayDecision::Replay {
            recurrent: true,
            ..
        }
    ));
    let first_copy_pre = calls
        .iter()
        .find_map(|c| match c {
            Call::Copy {
                expr, precondition, ..
            } if *expr == ExprId(1) => Some(*precondition),
            _ => None,
        })
        .unwrap();
    // The precondition is the merge of the previous replay's frontier
    // crossings, which hold events the previous replay triggered.
    let merged_inputs = calls
        .iter()
        .find_map(|c| match c {
            Call::Merge(inputs, result) if *result == first_copy_pre => Some(inputs.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(merged_inputs, chained_after_first);
}

// ---------------------------------------------------------------------
// Scenario 4: parallel slicing of independent chains.
// ---------------------------------------------------------------------

#[test]
fn independent_copy_chains_replay_in_separate_slices() {
    let mut rt = TestRuntime::new();
    let mut t1 = TestOp::task(0);
    let mut t2 = TestOp::task(1);
    let fence = rt.fresh_event();
    let mut tpl = PhysicalTemplate::new(fence, 2);

    tpl.record_get_term_event(&t1);
    tpl.record_get_term_event(&t2);
    let c1a = record_copy(&mut tpl, &mut rt, &t1, fence, traced(1, 1));
    let _c1b = record_copy(&mut tpl, &mut rt, &t1, c1a, traced(2, 1));
    let c2a = record_copy(&mut tpl, &mut rt, &t2, fence, traced(3, 2));
    let _c2b = record_copy(&mut tpl, &mut rt, &t2, c2a, traced(4, 2));
    tpl.finalize(&rt, false).unwrap();

    assert_eq!(tpl.slices().len(), 2);
    assert_eq!(
        tpl.slice_tasks(),
        [[t1.trace_local_id()], [t2.trace_local_id()]]
    );
    // The four copy completions are the frontier set.
    assert_eq!(tpl.frontiers().len(), 4);

    let replay_fence = rt.fresh_event();
    tpl.initialize(&mut rt, replay_fence, false);
    let mut bindings = ReplayBindings::new();
    bindings.bind(&mut t1);
    bindings.bind(&mut t2);
    rt.calls.clear();
    tpl.execute_all(&mut bindings, &mut rt).unwrap();
    drop(bindings);

    // Both chains were issued, and each chain's second copy waits on its
    // first copy's completion.
    let copies = rt.copies();
    assert_eq!(copies.len(), 4);
    for chain_expr in [ExprId(1), ExprId(2)] {
        let chain: Vec<_> = copies
            .iter()
            .filter_map(|c| match c {
                Call::Copy {
                    expr,
                    precondition,
                    result,
                } if *expr == chain_expr => Some((*precondition, *result)),
                _ => None,
            })
            .collect();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].0, chain[0].1);
    }
}

// ---------------------------------------------------------------------
// Scenario 5: precondition invalidation records a second template.
// ---------------------------------------------------------------------

#[test]
fn invalidated_preconditions_fall_back_to_recording() {
    let mut rt = TestRuntime::new();
    let op = TestOp::task(0);
    let mut trace = LogicalTrace::new_dynamic(TraceId(0));
    let mut replay_op = TraceReplayOp::new();

    // The op reads {f0} of view 1 (valid before the trace) and rewrites it.
    rt.restore_fields(ViewId(1), EqSetId(1), F0);

    let fence1 = rt.fresh_event();
    TraceBeginOp::new(fence1).trigger(&mut trace);
    replay_op.trigger(&mut trace, &mut rt, ReplayConfig::default(), fence1, None);
    trace.register_operation(&op, GEN).unwrap();
    {
        let tpl = trace
            .physical_mut()
            .and_then(|p| p.current_recording_mut())
            .unwrap();
        tpl.record_get_term_event(&op);
        tpl.record_op_view(
            &op,
            0,
            ViewId(1),
            EqSetId(1),
            ExprId(1),
            RegionUsage::READ_WRITE,
            F0,
            true,
            &rt,
        );
    }
    assert!(matches!(
        TraceCaptureOp::new(false).trigger(&mut trace, &mut rt, None),
        Some(FixOutcome::Stored { index: 0 })
    ));
    TraceCompleteOp::new(false).trigger(&mut trace, &mut rt);

    // Externally invalidate the view the precondition needs.
    rt.invalidate_fields(ViewId(1), EqSetId(1), F0);

    let fence2 = rt.fresh_event();
    TraceBeginOp::new(fence2).trigger(&mut trace);
    let decision = replay_op.trigger(&mut trace, &mut rt, ReplayConfig::default(), fence2, None);
    assert_eq!(decision, ReplayDecision::Record);
    assert!(trace.is_recording());

    // The runtime goes on to record a second template; the logical replay
    // still succeeds since the operation shapes match.
    trace.register_operation(&op, GenId(2)).unwrap();
    {
        let tpl = trace
            .physical_mut()
            .and_then(|p| p.current_recording_mut())
            .unwrap();
        tpl.record_get_term_event(&op);
        tpl.record_op_view(
            &op,
            0,
            ViewId(1),
            EqSetId(1),
            ExprId(1),
            RegionUsage::WRITE_DISCARD,
            F0,
            true,
            &rt,
        );
    }
    assert!(matches!(
        TraceCaptureOp::new(false).trigger(&mut trace, &mut rt, None),
        Some(FixOutcome::Stored { index: 1 })
    ));
    assert_eq!(trace.physical().unwrap().templates().len(), 2);
}

// ---------------------------------------------------------------------
// Scenario 6: blocking calls poison the capture.
// ---------------------------------------------------------------------

#[test]
fn blocking_wait_marks_the_template_non_replayable() {
    let mut rt = TestRuntime::new();
    let op = TestOp::task(0);
    let mut trace = LogicalTrace::new_dynamic(TraceId(0));
    let mut replay_op = TraceReplayOp::new();

    let fence = rt.fresh_event();
    TraceBeginOp::new(fence).trigger(&mut trace);
    replay_op.trigger(&mut trace, &mut rt, ReplayConfig::default(), fence, None);
    trace.register_operation(&op, GEN).unwrap();
    {
        let tpl = trace
            .physical_mut()
            .and_then(|p| p.current_recording_mut())
            .unwrap();
        tpl.record_get_term_event(&op);
    }
    trace.record_blocking_call();

    let outcome = TraceCaptureOp::new(false)
        .trigger(&mut trace, &mut rt, None)
        .unwrap();
    let FixOutcome::NotReplayable { retired, .. } = outcome else {
        panic!("blocking capture must not store a template");
    };
    assert!(!retired.template.is_replayable());

    let physical = trace.physical().unwrap();
    assert!(!physical.has_any_templates());
    assert_eq!(physical.nonreplayable_count(), 1);
}

// ---------------------------------------------------------------------
// Property tests.
// ---------------------------------------------------------------------

fn record_strategy() -> impl Strategy<Value = DependenceRecord> {
    (
        0..3_i32,
        prop_oneof![Just(-1_i32), 0..2_i32],
        prop_oneof![Just(-1_i32), 0..2_i32],
        any::<bool>(),
        prop_oneof![
            Just(DependenceKind::True),
            Just(DependenceKind::Anti),
            Just(DependenceKind::Atomic),
        ],
        0..4_u32,
    )
        .prop_map(|(op, prev, next, validates, dtype, bit)| DependenceRecord {
            operation_idx: op,
            prev_idx: prev,
            next_idx: next,
            validates,
            dtype,
            dependent_mask: FieldMask::bit(bit),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merge_in_is_idempotent(
        records in proptest::collection::vec(record_strategy(), 0..12),
        record in record_strategy(),
    ) {
        let mut once = Vec::new();
        for r in records {
            merge_in(&mut once, r);
        }
        merge_in(&mut once, record.clone());
        let snapshot = once.clone();
        merge_in(&mut once, record);
        prop_assert_eq!(once, snapshot);
    }

    #[test]
    fn mutual_subsumption_implies_identical_domination(
        entries in proptest::collection::vec((0..3_u64, 0..3_u64, 1..8_u64), 0..10),
        queries in proptest::collection::vec((0..3_u64, 0..3_u64, 1..8_u64), 1..8),
    ) {
        // Build the same content twice: in order, and reversed with each
        // mask split across two inserts. The two sets are mutually
        // subsumed by construction.
        let mut set_a = TraceViewSet::new();
        for &(view, eq, words) in &entries {
            set_a.insert(ViewId(view), EqSetId(eq), FieldMask::from_words([words, 0]));
        }
        let mut set_b = TraceViewSet::new();
        for &(view, eq, words) in entries.iter().rev() {
            set_b.insert(
                ViewId(view),
                EqSetId(eq),
                FieldMask::from_words([words & 0b101, 0]),
            );
            set_b.insert(
                ViewId(view),
                EqSetId(eq),
                FieldMask::from_words([words & 0b010, 0]),
            );
        }
        prop_assert!(set_a.subsumed_by(&set_b) && set_b.subsumed_by(&set_a));

        for (view, eq, words) in queries {
            let mut residual_a = FieldMask::from_words([words, 0]);
            let mut residual_b = residual_a;
            let dom_a = set_a.dominates(ViewId(view), EqSetId(eq), &mut residual_a);
            let dom_b = set_b.dominates(ViewId(view), EqSetId(eq), &mut residual_b);
            prop_assert_eq!(dom_a, dom_b);
            prop_assert_eq!(residual_a, residual_b);
        }
    }

    #[test]
    fn optimization_preserves_copy_chains(chain_len in 1_usize..6) {
        let mut rt = TestRuntime::new();
        let mut op = TestOp::task(0);
        let fence = rt.fresh_event();
        let mut tpl = PhysicalTemplate::new(fence, 1);
        tpl.record_get_term_event(&op);

        let mut previous = fence;
        for i in 0..chain_len {
            previous = record_copy(
                &mut tpl,
                &mut rt,
                &op,
                previous,
                traced(i as u64 + 1, 1),
            );
        }
        tpl.finalize(&rt, false).unwrap();

        let replay_fence = rt.fresh_event();
        tpl.initialize(&mut rt, replay_fence, false);
        let mut bindings = ReplayBindings::new();
        bindings.bind(&mut op);
        rt.calls.clear();
        tpl.execute_all(&mut bindings, &mut rt).unwrap();
        drop(bindings);

        // The happens-before closure of the chain survives optimization:
        // every copy still waits on its predecessor's completion.
        let copies: Vec<(ApEvent, ApEvent)> = rt
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Copy {
                    precondition,
                    result,
                    ..
                } => Some((*precondition, *result)),
                _ => None,
            })
            .collect();
        prop_assert_eq!(copies.len(), chain_len);
        for pair in copies.windows(2) {
            prop_assert_eq!(pair[1].0, pair[0].1);
        }
    }
}
