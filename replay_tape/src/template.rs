// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Physical templates: recording and replaying a task graph recipe.
//!
//! A [`PhysicalTemplate`] is built by routing every physical action the
//! scheduler takes (event creation, merging, copies, fills, completion
//! plumbing) through a `record_*` entry point while a trace is in its
//! recording pass. Recording assigns each produced event a slot; the
//! instruction stream only ever refers to slots, so the same recipe can be
//! re-executed against fresh events. After recording, [`finalize`] decides
//! replayability from the template's precondition / postcondition view sets
//! and, on success, optimizes the instruction graph for parallel replay.
//!
//! [`finalize`]: PhysicalTemplate::finalize

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::ids::{
    ApEvent, ApUserEvent, EqSetId, ExprId, FillViewId, RedopId, TraceLocalId, TreeId, ViewId,
};
use crate::mask::{FieldMask, FieldMaskSet};
use crate::instruction::{Instruction, InstructionKind};
use crate::runtime::{
    CachedMapping, CopySrcDstField, EventFabric, Memoizable, RegionOracle, RegionUsage,
};
use crate::view_set::{TraceConditionSet, TraceViewSet};

/// Event slot reserved for the replay fence completion.
pub const FENCE_COMPLETION_ID: usize = 0;

/// Why a finalized template was rejected for replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotReplayableReason {
    /// The trace observed a blocking call; its effects leaked into user code.
    BlockingCall,
    /// The postconditions do not subsume the preconditions, so a second
    /// iteration would not start in the state the first one did.
    PostconditionNotSubsumed,
    /// A view was recorded under equivalence sets that refine each other.
    Refinements,
    /// A pre-existing reduction was read but never consumed by the template.
    LeakedReduction,
}

impl fmt::Display for NotReplayableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockingCall => write!(f, "blocking call observed during trace"),
            Self::PostconditionNotSubsumed => {
                write!(f, "postconditions do not subsume preconditions")
            }
            Self::Refinements => write!(f, "equivalence set refinements observed"),
            Self::LeakedReduction => write!(f, "pre-trace reduction not consumed by the trace"),
        }
    }
}

impl core::error::Error for NotReplayableReason {}

/// A replay-time failure. These indicate a corrupted template and are never
/// produced by a template that recorded and finalized successfully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayError {
    /// A slice index was out of range.
    BadSlice {
        /// Requested slice.
        index: usize,
    },
    /// An instruction referenced an event slot past the table.
    EventSlotOutOfRange {
        /// Offending slot.
        slot: usize,
    },
    /// A trigger targeted a slot without a live user event.
    UserEventMissing {
        /// Offending slot.
        slot: usize,
    },
    /// An instruction's owner was never bound for this replay.
    UnboundOperation {
        /// Missing trace-local id.
        owner: TraceLocalId,
    },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSlice { index } => write!(f, "slice {index} out of range"),
            Self::EventSlotOutOfRange { slot } => write!(f, "event slot {slot} out of range"),
            Self::UserEventMissing { slot } => write!(f, "no user event in slot {slot}"),
            Self::UnboundOperation { owner } => write!(f, "operation {owner} not bound"),
        }
    }
}

impl core::error::Error for ReplayError {}

/// A view touched by a recorded copy or operation, with the equivalence set
/// and fields it was touched under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TracedView {
    /// The instance view.
    pub view: ViewId,
    /// Equivalence set the access was analyzed under.
    pub eq: EqSetId,
    /// Fields touched.
    pub mask: FieldMask,
    /// Index-space expression of the access.
    pub expr: ExprId,
}

/// A fill view feeding a recorded fill.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TracedFill {
    /// The fill view.
    pub fill: FillViewId,
    /// Fields it supplies.
    pub mask: FieldMask,
}

/// One recorded user of an instance view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ViewUser {
    pub(crate) usage: RegionUsage,
    /// Event slot whose completion covers this use.
    pub(crate) user: usize,
    pub(crate) expr: ExprId,
    pub(crate) mask: FieldMask,
}

/// One recorded region-requirement access of a memoized operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpViewRecord {
    /// Region requirement index on the op.
    pub req_index: u32,
    /// View accessed.
    pub view: ViewId,
    /// Equivalence set.
    pub eq: EqSetId,
    /// Access mode.
    pub usage: RegionUsage,
    /// Fields accessed.
    pub mask: FieldMask,
}

/// Per-replay operation table.
///
/// The template stores trace-local ids only; concrete operations are rebound
/// here at the start of every replay, before any slice executes.
#[derive(Default)]
pub struct ReplayBindings<'a> {
    ops: BTreeMap<TraceLocalId, &'a mut dyn Memoizable>,
}

impl<'a> ReplayBindings<'a> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
        }
    }

    /// Binds `op` under its trace-local id.
    pub fn bind(&mut self, op: &'a mut dyn Memoizable) {
        self.ops.insert(op.trace_local_id(), op);
    }

    fn get(&self, owner: TraceLocalId) -> Result<&dyn Memoizable, ReplayError> {
        self.ops
            .get(&owner)
            .map(|op| &**op)
            .ok_or(ReplayError::UnboundOperation { owner })
    }

    fn get_mut(&mut self, owner: TraceLocalId) -> Result<&mut dyn Memoizable, ReplayError> {
        match self.ops.get_mut(&owner) {
            Some(op) => Ok(&mut **op),
            None => Err(ReplayError::UnboundOperation { owner }),
        }
    }
}

/// A recorded recipe for one physical task graph.
pub struct PhysicalTemplate {
    pub(crate) replay_parallelism: usize,
    pub(crate) recording: bool,
    pub(crate) replayable: bool,

    pub(crate) fence_completion: ApEvent,
    pub(crate) events: Vec<ApEvent>,
    pub(crate) user_events: Vec<Option<ApUserEvent>>,
    /// Record-time lookup from produced event values to slots.
    pub(crate) event_map: HashMap<ApEvent, usize>,

    pub(crate) instructions: Vec<Instruction>,
    /// Indices into `instructions`, one list per replay slice.
    pub(crate) slices: Vec<Vec<usize>>,
    pub(crate) slice_tasks: Vec<Vec<TraceLocalId>>,

    /// Term-event slot per memoized op.
    pub(crate) memo_entries: BTreeMap<TraceLocalId, usize>,
    pub(crate) cached_mappings: BTreeMap<TraceLocalId, CachedMapping>,

    pub(crate) op_views: BTreeMap<TraceLocalId, Vec<OpViewRecord>>,
    pub(crate) copy_views: BTreeMap<usize, Vec<TracedView>>,
    pub(crate) view_users: BTreeMap<ViewId, Vec<ViewUser>>,
    pub(crate) view_groups: BTreeMap<TreeId, BTreeSet<ViewId>>,

    pub(crate) pre: TraceConditionSet,
    pub(crate) post: TraceConditionSet,
    pub(crate) pre_reductions: TraceViewSet,
    pub(crate) post_reductions: TraceViewSet,
    pub(crate) consumed_reductions: TraceViewSet,
    pub(crate) pre_fill_views: FieldMaskSet<FillViewId>,
    pub(crate) post_fill_views: FieldMaskSet<FillViewId>,

    /// Frontier event slot -> crossing slot carrying it into the next
    /// recurrent replay.
    pub(crate) frontiers: BTreeMap<usize, usize>,
    /// Event slot -> crossing slot for cross-slice handoff.
    pub(crate) crossing_events: BTreeMap<usize, usize>,

    pub(crate) last_completion: ApEvent,
}

impl PhysicalTemplate {
    /// Starts recording a template whose slot 0 holds `fence_event`.
    #[must_use]
    pub fn new(fence_event: ApEvent, replay_parallelism: usize) -> Self {
        let mut event_map = HashMap::new();
        if fence_event.exists() {
            event_map.insert(fence_event, FENCE_COMPLETION_ID);
        }
        Self {
            replay_parallelism: replay_parallelism.max(1),
            recording: true,
            replayable: false,
            fence_completion: fence_event,
            events: alloc::vec![fence_event],
            user_events: alloc::vec![None],
            event_map,
            instructions: alloc::vec![Instruction::new(
                TraceLocalId::FENCE,
                InstructionKind::AssignFenceCompletion {
                    lhs: FENCE_COMPLETION_ID,
                },
            )],
            slices: Vec::new(),
            slice_tasks: Vec::new(),
            memo_entries: BTreeMap::new(),
            cached_mappings: BTreeMap::new(),
            op_views: BTreeMap::new(),
            copy_views: BTreeMap::new(),
            view_users: BTreeMap::new(),
            view_groups: BTreeMap::new(),
            pre: TraceConditionSet::new(),
            post: TraceConditionSet::new(),
            pre_reductions: TraceViewSet::new(),
            post_reductions: TraceViewSet::new(),
            consumed_reductions: TraceViewSet::new(),
            pre_fill_views: FieldMaskSet::new(),
            post_fill_views: FieldMaskSet::new(),
            frontiers: BTreeMap::new(),
            crossing_events: BTreeMap::new(),
            last_completion: ApEvent::NO_EVENT,
        }
    }

    /// Returns `true` while the template is being recorded.
    #[must_use]
    #[inline]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Returns `true` once the template has been finalized for replay.
    #[must_use]
    #[inline]
    pub const fn is_replaying(&self) -> bool {
        !self.recording
    }

    /// Returns `true` if [`Self::finalize`] accepted the template.
    #[must_use]
    #[inline]
    pub const fn is_replayable(&self) -> bool {
        self.replayable
    }

    /// Recorded instruction stream (optimized once finalized).
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Replay slices as indices into [`Self::instructions`].
    #[must_use]
    pub fn slices(&self) -> &[Vec<usize>] {
        &self.slices
    }

    /// Trace-local ids replayed by each slice.
    #[must_use]
    pub fn slice_tasks(&self) -> &[Vec<TraceLocalId>] {
        &self.slice_tasks
    }

    /// Frontier slot pairs chaining recurrent replays.
    #[must_use]
    pub const fn frontiers(&self) -> &BTreeMap<usize, usize> {
        &self.frontiers
    }

    /// Replay-time event table.
    #[must_use]
    pub fn events(&self) -> &[ApEvent] {
        &self.events
    }

    /// The template's precondition views.
    #[must_use]
    pub const fn preconditions(&self) -> &TraceConditionSet {
        &self.pre
    }

    /// The template's postcondition views.
    #[must_use]
    pub const fn postconditions(&self) -> &TraceConditionSet {
        &self.post
    }

    /// Per-op recorded view accesses.
    #[must_use]
    pub fn op_view_records(&self, op: TraceLocalId) -> &[OpViewRecord] {
        self.op_views.get(&op).map_or(&[], Vec::as_slice)
    }

    // ------------------------------------------------------------------
    // Event slot assignment
    // ------------------------------------------------------------------

    /// Assigns a fresh slot holding `event`.
    ///
    /// Each produced event is converted exactly once; slots are single-writer.
    fn convert_event(&mut self, event: ApEvent) -> usize {
        debug_assert!(self.recording);
        let slot = self.events.len();
        self.events.push(event);
        self.user_events.push(None);
        if event.exists() {
            let prev = self.event_map.insert(event, slot);
            debug_assert!(prev.is_none(), "event converted twice");
        }
        slot
    }

    /// Looks up the slot of a previously converted event.
    fn find_event(&self, event: ApEvent) -> Option<usize> {
        if event.exists() {
            self.event_map.get(&event).copied()
        } else {
            None
        }
    }

    /// Resolves a precondition to a slot. Events recorded inside the trace
    /// resolve to their slot; anything else predates the trace and is
    /// subsumed by the fence.
    fn find_or_fence(&self, event: ApEvent) -> usize {
        self.find_event(event).unwrap_or(FENCE_COMPLETION_ID)
    }

    // ------------------------------------------------------------------
    // Recording entry points
    // ------------------------------------------------------------------

    /// Records the owner op's completion event and registers its memo entry.
    pub fn record_get_term_event(&mut self, memo: &dyn Memoizable) {
        assert!(self.recording);
        let owner = memo.trace_local_id();
        let lhs = self.convert_event(memo.completion_event());
        self.memo_entries.insert(owner, lhs);
        self.instructions.push(Instruction::new(
            owner,
            InstructionKind::GetTermEvent { lhs },
        ));
    }

    /// Records creation of a user event.
    pub fn record_create_ap_user_event(&mut self, lhs: ApUserEvent, owner: TraceLocalId) {
        assert!(self.recording);
        let slot = self.convert_event(lhs.as_event());
        self.user_events[slot] = Some(lhs);
        self.instructions.push(Instruction::new(
            owner,
            InstructionKind::CreateApUserEvent { lhs: slot },
        ));
    }

    /// Records triggering `user` with `precondition`.
    pub fn record_trigger_event(
        &mut self,
        user: ApUserEvent,
        precondition: ApEvent,
        owner: TraceLocalId,
    ) {
        assert!(self.recording);
        let lhs = self
            .find_event(user.as_event())
            .expect("triggered user event was not recorded");
        let rhs = self.find_or_fence(precondition);
        self.instructions.push(Instruction::new(
            owner,
            InstructionKind::TriggerEvent { lhs, rhs },
        ));
    }

    /// Records a merge producing `lhs` from `preconditions`.
    ///
    /// Slots are single-writer: if the merged result aliases one of its
    /// operands (or does not exist), it is renamed through a fresh user
    /// event before a slot is assigned.
    pub fn record_merge_events<F: EventFabric + ?Sized>(
        &mut self,
        lhs: &mut ApEvent,
        preconditions: &[ApEvent],
        owner: TraceLocalId,
        fabric: &mut F,
    ) {
        assert!(self.recording);
        let rhs: BTreeSet<usize> = preconditions
            .iter()
            .filter(|e| e.exists())
            .map(|&e| self.find_or_fence(e))
            .collect();

        if !lhs.exists() || preconditions.contains(lhs) {
            let rename = fabric.create_user_event();
            fabric.trigger_event(rename, *lhs);
            *lhs = rename.as_event();
        }
        let slot = self.convert_event(*lhs);
        self.instructions.push(Instruction::new(
            owner,
            InstructionKind::MergeEvent { lhs: slot, rhs },
        ));
    }

    /// Records a copy issued on behalf of `memo`.
    #[allow(clippy::too_many_arguments, reason = "mirrors the scheduler call")]
    pub fn record_issue_copy<F: EventFabric + ?Sized>(
        &mut self,
        memo: &dyn Memoizable,
        lhs: &mut ApEvent,
        expr: ExprId,
        src_fields: &[CopySrcDstField],
        dst_fields: &[CopySrcDstField],
        precondition: ApEvent,
        redop: RedopId,
        reduction_fold: bool,
        tracing_srcs: &[TracedView],
        tracing_dsts: &[TracedView],
        fabric: &mut F,
    ) {
        assert!(self.recording);
        if !lhs.exists() {
            let rename = fabric.create_user_event();
            fabric.trigger_event(rename, *lhs);
            *lhs = rename.as_event();
        }
        let pre_slot = self.find_or_fence(precondition);
        let slot = self.convert_event(*lhs);
        self.instructions.push(Instruction::new(
            memo.trace_local_id(),
            InstructionKind::IssueCopy {
                lhs: slot,
                expr,
                src_fields: src_fields.to_vec(),
                dst_fields: dst_fields.to_vec(),
                precondition: pre_slot,
                redop,
                reduction_fold,
            },
        ));
        self.record_copy_views(slot, redop, tracing_srcs, tracing_dsts);
    }

    /// Records a fill issued on behalf of `memo`.
    pub fn record_issue_fill<F: EventFabric + ?Sized>(
        &mut self,
        memo: &dyn Memoizable,
        lhs: &mut ApEvent,
        expr: ExprId,
        fields: &[CopySrcDstField],
        value: &[u8],
        precondition: ApEvent,
        tracing_srcs: &[TracedFill],
        tracing_dsts: &[TracedView],
        fabric: &mut F,
    ) {
        assert!(self.recording);
        if !lhs.exists() {
            let rename = fabric.create_user_event();
            fabric.trigger_event(rename, *lhs);
            *lhs = rename.as_event();
        }
        let pre_slot = self.find_or_fence(precondition);
        let slot = self.convert_event(*lhs);
        self.instructions.push(Instruction::new(
            memo.trace_local_id(),
            InstructionKind::IssueFill {
                lhs: slot,
                expr,
                fields: fields.to_vec(),
                value: value.into(),
                precondition: pre_slot,
            },
        ));
        for src in tracing_srcs {
            // A fill view that the template did not itself record must
            // already exist when the template runs.
            let known = self.post_fill_views.mask_of(&src.fill);
            let residual = src.mask - known;
            self.pre_fill_views.insert(src.fill, residual);
        }
        for dst in tracing_dsts {
            self.post.insert(dst.view, dst.eq, dst.mask);
            self.add_view_user(
                dst.view,
                ViewUser {
                    usage: RegionUsage::WRITE_DISCARD,
                    user: slot,
                    expr: dst.expr,
                    mask: dst.mask,
                },
            );
        }
    }

    /// Records the owner op's sync precondition capture.
    pub fn record_set_op_sync_event<F: EventFabric + ?Sized>(
        &mut self,
        lhs: &mut ApEvent,
        memo: &dyn Memoizable,
        fabric: &mut F,
    ) {
        assert!(self.recording);
        if !lhs.exists() {
            let rename = fabric.create_user_event();
            fabric.trigger_event(rename, *lhs);
            *lhs = rename.as_event();
        }
        let slot = self.convert_event(*lhs);
        self.instructions.push(Instruction::new(
            memo.trace_local_id(),
            InstructionKind::SetOpSyncEvent { lhs: slot },
        ));
    }

    /// Records the completion handoff for `memo`.
    pub fn record_complete_replay(&mut self, memo: &dyn Memoizable, rhs: ApEvent) {
        assert!(self.recording);
        let rhs = self.find_or_fence(rhs);
        self.instructions.push(Instruction::new(
            memo.trace_local_id(),
            InstructionKind::CompleteReplay { rhs },
        ));
    }

    /// Records that `memo` accesses `view` with `usage` on `mask` in its
    /// `req_index`-th region requirement.
    ///
    /// This feeds the view-user table (for frontier computation) and the
    /// precondition / postcondition sets. When `update_validity` is set a
    /// write also invalidates overlapping fields of the other views in the
    /// same region tree.
    #[allow(clippy::too_many_arguments, reason = "mirrors the scheduler call")]
    pub fn record_op_view<O: RegionOracle + ?Sized>(
        &mut self,
        memo: &dyn Memoizable,
        req_index: u32,
        view: ViewId,
        eq: EqSetId,
        expr: ExprId,
        usage: RegionUsage,
        mask: FieldMask,
        update_validity: bool,
        oracle: &O,
    ) {
        assert!(self.recording);
        let owner = memo.trace_local_id();
        let user = *self
            .memo_entries
            .get(&owner)
            .expect("op views recorded before term event");

        self.op_views.entry(owner).or_default().push(OpViewRecord {
            req_index,
            view,
            eq,
            usage,
            mask,
        });
        self.add_view_user(view, ViewUser { usage, user, expr, mask });

        if oracle.is_reduction_view(view) {
            if usage.is_reduce() {
                self.post_reductions.insert(view, eq, mask);
            } else {
                // Reading pre-trace reduction state without consuming it
                // leaks it into the next iteration.
                let mut residual = mask;
                if !self.post_reductions.dominates(view, eq, &mut residual) {
                    self.pre_reductions.insert(view, eq, residual);
                }
            }
            return;
        }
        if usage.reads() {
            let mut residual = mask;
            if !self.post.views().dominates(view, eq, &mut residual) {
                self.pre.insert(view, eq, residual);
            }
        }
        if usage.writes() && update_validity {
            let tree = oracle.view_tree(view);
            let group: Vec<ViewId> = self
                .view_groups
                .get(&tree)
                .map(|views| views.iter().copied().filter(|&v| v != view).collect())
                .unwrap_or_default();
            for other in group {
                self.post.invalidate(other, eq, mask);
            }
            self.post.insert(view, eq, mask);
        } else if usage.writes() {
            self.post.insert(view, eq, mask);
        }
        self.view_groups
            .entry(oracle.view_tree(view))
            .or_default()
            .insert(view);
    }

    /// Records a fill view established by the template.
    pub fn record_fill_view(&mut self, fill: FillViewId, mask: FieldMask) {
        assert!(self.recording);
        self.post_fill_views.insert(fill, mask);
    }

    /// Caches the mapper output for `memo`; replays reuse it verbatim.
    pub fn record_mapper_output(&mut self, memo: &dyn Memoizable, mapping: CachedMapping) {
        assert!(self.recording);
        self.cached_mappings.insert(memo.trace_local_id(), mapping);
    }

    /// Returns the cached mapper output for `op`, if any.
    #[must_use]
    pub fn cached_mapping(&self, op: TraceLocalId) -> Option<&CachedMapping> {
        self.cached_mappings.get(&op)
    }

    fn record_copy_views(
        &mut self,
        copy_slot: usize,
        redop: RedopId,
        tracing_srcs: &[TracedView],
        tracing_dsts: &[TracedView],
    ) {
        for src in tracing_srcs {
            if redop.exists() {
                // Reduction application: anything not folded in-trace must
                // have existed before it, and the copy consumes it.
                let mut residual = src.mask;
                if !self.post_reductions.dominates(src.view, src.eq, &mut residual) {
                    self.pre_reductions.insert(src.view, src.eq, residual);
                }
                self.consumed_reductions.insert(src.view, src.eq, src.mask);
            } else {
                let mut residual = src.mask;
                if !self.post.views().dominates(src.view, src.eq, &mut residual) {
                    self.pre.insert(src.view, src.eq, residual);
                }
            }
            self.add_view_user(
                src.view,
                ViewUser {
                    usage: RegionUsage::READ_ONLY,
                    user: copy_slot,
                    expr: src.expr,
                    mask: src.mask,
                },
            );
        }
        for dst in tracing_dsts {
            self.post.insert(dst.view, dst.eq, dst.mask);
            self.add_view_user(
                dst.view,
                ViewUser {
                    usage: RegionUsage::READ_WRITE,
                    user: copy_slot,
                    expr: dst.expr,
                    mask: dst.mask,
                },
            );
        }
        self.copy_views
            .entry(copy_slot)
            .or_default()
            .extend(tracing_srcs.iter().chain(tracing_dsts).copied());
    }

    fn add_view_user(&mut self, view: ViewId, user: ViewUser) {
        self.view_users.entry(view).or_default().push(user);
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Ends recording: derives conditions, decides replayability, and on
    /// success optimizes the instruction graph.
    pub fn finalize<O: RegionOracle + ?Sized>(
        &mut self,
        oracle: &O,
        has_blocking_call: bool,
    ) -> Result<(), NotReplayableReason> {
        assert!(self.recording);
        self.recording = false;
        if has_blocking_call {
            self.replayable = false;
            return Err(NotReplayableReason::BlockingCall);
        }
        self.generate_conditions(oracle);
        self.check_replayable(oracle)?;
        self.replayable = true;
        self.optimize(oracle);
        Ok(())
    }

    /// Finishes the condition sets once every access has been recorded.
    fn generate_conditions<O: RegionOracle + ?Sized>(&mut self, oracle: &O) {
        self.pre.make_ready(oracle);
        self.post.make_ready(oracle);
    }

    /// The replayability test of a recorded template.
    fn check_replayable<O: RegionOracle + ?Sized>(
        &self,
        oracle: &O,
    ) -> Result<(), NotReplayableReason> {
        if !self.pre.views().subsumed_by(self.post.views()) {
            return Err(NotReplayableReason::PostconditionNotSubsumed);
        }
        if self.pre.views().has_refinements(oracle) || self.post.views().has_refinements(oracle) {
            return Err(NotReplayableReason::Refinements);
        }
        if !self.pre_reductions.subsumed_by(&self.consumed_reductions) {
            return Err(NotReplayableReason::LeakedReduction);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Returns `true` if the template's preconditions hold in the current
    /// program state.
    #[must_use]
    pub fn check_preconditions<O: RegionOracle + ?Sized>(&self, oracle: &O) -> bool {
        self.replayable && self.pre.require(oracle)
    }

    /// Prepares the event table for a replay.
    ///
    /// Crossing slots get fresh user events before any slice runs. Frontier
    /// slots keep the values triggered by the previous replay when
    /// `recurrent`, and fall back to the fence completion otherwise.
    pub fn initialize<F: EventFabric + ?Sized>(
        &mut self,
        fabric: &mut F,
        fence_completion: ApEvent,
        recurrent: bool,
    ) {
        debug_assert!(!self.recording);
        self.fence_completion = fence_completion;

        let preserved: Vec<(usize, ApEvent)> = if recurrent {
            self.frontiers
                .values()
                .map(|&slot| (slot, self.events[slot]))
                .collect()
        } else {
            Vec::new()
        };

        for event in &mut self.events {
            *event = ApEvent::NO_EVENT;
        }
        for user in &mut self.user_events {
            *user = None;
        }
        self.events[FENCE_COMPLETION_ID] = fence_completion;

        if recurrent {
            for (slot, event) in preserved {
                self.events[slot] = event;
            }
        } else {
            for &slot in self.frontiers.values() {
                self.events[slot] = fence_completion;
            }
        }

        for &slot in self.crossing_events.values() {
            let user = fabric.create_user_event();
            self.user_events[slot] = Some(user);
            self.events[slot] = user.as_event();
        }
    }

    /// Executes every slice in index order.
    ///
    /// Slices only communicate through event slots, so a host with parallel
    /// workers may instead call [`Self::execute_slice`] from one worker per
    /// slice.
    pub fn execute_all<F: EventFabric + ?Sized>(
        &mut self,
        bindings: &mut ReplayBindings<'_>,
        fabric: &mut F,
    ) -> Result<(), ReplayError> {
        for index in 0..self.slices.len() {
            self.execute_slice(index, bindings, fabric)?;
        }
        Ok(())
    }

    /// Executes one slice's instructions in order.
    pub fn execute_slice<F: EventFabric + ?Sized>(
        &mut self,
        slice_index: usize,
        bindings: &mut ReplayBindings<'_>,
        fabric: &mut F,
    ) -> Result<(), ReplayError> {
        debug_assert!(!self.recording);
        let Self {
            instructions,
            slices,
            events,
            user_events,
            fence_completion,
            ..
        } = self;
        let slice = slices
            .get(slice_index)
            .ok_or(ReplayError::BadSlice { index: slice_index })?;

        let read = |events: &[ApEvent], slot: usize| -> Result<ApEvent, ReplayError> {
            events
                .get(slot)
                .copied()
                .ok_or(ReplayError::EventSlotOutOfRange { slot })
        };
        let write = |events: &mut [ApEvent], slot: usize, e: ApEvent| -> Result<(), ReplayError> {
            *events
                .get_mut(slot)
                .ok_or(ReplayError::EventSlotOutOfRange { slot })? = e;
            Ok(())
        };

        for &index in slice {
            let inst = &instructions[index];
            match &inst.kind {
                InstructionKind::GetTermEvent { lhs } => {
                    let op = bindings.get(inst.owner)?;
                    write(events, *lhs, op.completion_event())?;
                }
                InstructionKind::CreateApUserEvent { lhs } => {
                    let user = fabric.create_user_event();
                    *user_events
                        .get_mut(*lhs)
                        .ok_or(ReplayError::EventSlotOutOfRange { slot: *lhs })? = Some(user);
                    write(events, *lhs, user.as_event())?;
                }
                InstructionKind::TriggerEvent { lhs, rhs } => {
                    let user = user_events
                        .get(*lhs)
                        .copied()
                        .flatten()
                        .ok_or(ReplayError::UserEventMissing { slot: *lhs })?;
                    let pre = read(events, *rhs)?;
                    fabric.trigger_event(user, pre);
                }
                InstructionKind::MergeEvent { lhs, rhs } => {
                    let mut inputs = Vec::with_capacity(rhs.len());
                    for &r in rhs {
                        inputs.push(read(events, r)?);
                    }
                    let merged = fabric.merge_events(&inputs);
                    write(events, *lhs, merged)?;
                }
                InstructionKind::IssueCopy {
                    lhs,
                    expr,
                    src_fields,
                    dst_fields,
                    precondition,
                    redop,
                    reduction_fold,
                } => {
                    let pre = read(events, *precondition)?;
                    let done = fabric.issue_copy(
                        *expr,
                        src_fields,
                        dst_fields,
                        pre,
                        *redop,
                        *reduction_fold,
                    );
                    write(events, *lhs, done)?;
                }
                InstructionKind::IssueFill {
                    lhs,
                    expr,
                    fields,
                    value,
                    precondition,
                } => {
                    let pre = read(events, *precondition)?;
                    let done = fabric.issue_fill(*expr, fields, value, pre);
                    write(events, *lhs, done)?;
                }
                InstructionKind::SetOpSyncEvent { lhs } => {
                    let op = bindings.get(inst.owner)?;
                    write(events, *lhs, op.compute_sync_precondition())?;
                }
                InstructionKind::AssignFenceCompletion { lhs } => {
                    write(events, *lhs, *fence_completion)?;
                }
                InstructionKind::CompleteReplay { rhs } => {
                    let pre = read(events, *rhs)?;
                    let op = bindings.get_mut(inst.owner)?;
                    op.complete_replay(pre);
                }
            }
        }
        Ok(())
    }

    /// Completes a replay: triggers a fresh crossing event for every
    /// frontier so the next recurrent replay can chain on it, and returns
    /// the template completion event.
    pub fn finish_replay<F: EventFabric + ?Sized>(&mut self, fabric: &mut F) -> ApEvent {
        debug_assert!(!self.recording);
        let frontier_events: Vec<ApEvent> = self
            .frontiers
            .keys()
            .map(|&slot| self.events[slot])
            .collect();
        let completion = if frontier_events.is_empty() {
            let term_events: Vec<ApEvent> = self
                .memo_entries
                .values()
                .map(|&slot| self.events[slot])
                .collect();
            if term_events.is_empty() {
                self.fence_completion
            } else {
                fabric.merge_events(&term_events)
            }
        } else {
            fabric.merge_events(&frontier_events)
        };

        for (&key, &slot) in &self.frontiers {
            let user = fabric.create_user_event();
            fabric.trigger_event(user, self.events[key]);
            self.events[slot] = user.as_event();
        }
        self.last_completion = completion;
        completion
    }

    /// Completion event to wait on before dropping the template.
    ///
    /// For a template that has replayed, this is the last replay's
    /// completion; for one that only recorded, the completions captured at
    /// record time still cover the in-flight execution.
    pub fn completion_for_deletion<F: EventFabric + ?Sized>(&self, fabric: &mut F) -> ApEvent {
        if self.last_completion.exists() {
            return self.last_completion;
        }
        let term_events: Vec<ApEvent> = self
            .memo_entries
            .values()
            .map(|&slot| self.events[slot])
            .filter(|e| e.exists())
            .collect();
        if term_events.is_empty() {
            self.fence_completion
        } else {
            fabric.merge_events(&term_events)
        }
    }
}
