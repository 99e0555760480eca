// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logical traces: capturing and replaying dependence analysis.
//!
//! A [`LogicalTrace`] owns everything one marked trace scope accumulates:
//! the ordered `(operation, generation)` registrations of the current pass,
//! the captured dependences (dynamic traces) or application-supplied ones
//! (static traces), aliased-children annotations, the frontier set the
//! closing fence resolves against, and optionally the [`PhysicalTrace`]
//! holding recorded templates.
//!
//! Dependence replay is inverted relative to capture: registering an
//! operation against a fixed dynamic trace *returns* the records the
//! scheduler must apply, because operations live outside this crate.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use replay_tape::diag::{DiagEvent, DiagSink};
use replay_tape::ids::{GenId, OpKind, TraceId, TreeId, UniqueId};
use replay_tape::mask::FieldMask;
use replay_tape::registry::PhysicalTrace;
use replay_tape::runtime::{OpGen, Operation};

use crate::record::{DependenceKind, DependenceRecord, StaticDependence, merge_in};

/// Where a trace currently is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TracingState {
    /// Only logical dependences are captured or replayed.
    LogicalOnly,
    /// The scheduler is recording a physical template.
    PhysicalRecord,
    /// A recorded template is replaying.
    PhysicalReplay,
}

/// A trace-use error surfaced to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceError {
    /// A replayed operation did not match the captured signature.
    ShapeMismatch {
        /// Position within the trace.
        index: usize,
        /// Captured `(kind, region count)`.
        expected: (OpKind, u32),
        /// Observed `(kind, region count)`.
        found: (OpKind, u32),
    },
    /// More operations were replayed than were captured.
    TraceTooLong {
        /// Number of operations the capture recorded.
        expected: usize,
    },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "operation {index} does not match the captured trace: \
                 expected kind {} with {} regions, found kind {} with {} regions",
                expected.0.0, expected.1, found.0.0, found.1
            ),
            Self::TraceTooLong { expected } => {
                write!(f, "trace replayed more than the {expected} captured operations")
            }
        }
    }
}

impl core::error::Error for TraceError {}

/// Signature of one captured operation, checked on every replay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OperationInfo {
    /// Operation kind.
    pub kind: OpKind,
    /// Region requirement count.
    pub count: u32,
}

/// A region-tree path annotated with aliased-but-non-interfering children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionTreePath {
    aliased_children: BTreeMap<u32, FieldMask>,
}

impl RegionTreePath {
    /// Creates an empty path.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            aliased_children: BTreeMap::new(),
        }
    }

    /// Marks children at `depth` as aliased on `mask`.
    pub fn record_aliased_children(&mut self, depth: u32, mask: FieldMask) {
        *self.aliased_children.entry(depth).or_default() |= mask;
    }

    /// Aliased mask recorded at `depth`.
    #[must_use]
    pub fn aliased_mask_at(&self, depth: u32) -> FieldMask {
        self.aliased_children
            .get(&depth)
            .copied()
            .unwrap_or(FieldMask::EMPTY)
    }
}

/// Static trace payload: dependences supplied by the application.
#[derive(Debug, Default)]
pub struct StaticTrace {
    static_dependences: Vec<Vec<StaticDependence>>,
    translated: Vec<Option<Vec<DependenceRecord>>>,
    application_trees: BTreeSet<TreeId>,
}

impl StaticTrace {
    /// Records the static dependences of the next operation.
    pub fn record_static_dependences(&mut self, dependences: &[StaticDependence]) {
        self.static_dependences.push(dependences.to_vec());
        self.translated.push(None);
    }

    /// Translates the static descriptors of the op at `index` into
    /// dependence records, caching the result.
    ///
    /// Offsets that reach before the trace resolve to nothing: the begin
    /// fence already orders them.
    pub fn translate_dependence_records(&mut self, index: usize) -> &[DependenceRecord] {
        let Some(slot) = self.translated.get_mut(index) else {
            return &[];
        };
        if slot.is_none() {
            let mut records = Vec::new();
            for dep in &self.static_dependences[index] {
                let Some(target) = index.checked_sub(dep.previous_offset as usize) else {
                    continue;
                };
                if dep.previous_offset == 0 {
                    continue;
                }
                merge_in(
                    &mut records,
                    DependenceRecord::region(
                        i32::try_from(target).unwrap_or(i32::MAX),
                        i32::try_from(dep.previous_req_index).unwrap_or(i32::MAX),
                        i32::try_from(dep.current_req_index).unwrap_or(i32::MAX),
                        dep.validates,
                        dep.dependence_type,
                        dep.dependent_mask,
                    ),
                );
            }
            *slot = Some(records);
        }
        slot.as_deref().unwrap_or(&[])
    }

    /// Restricts the trace to `trees`; an empty set means all trees.
    pub fn set_application_trees(&mut self, trees: impl IntoIterator<Item = TreeId>) {
        self.application_trees = trees.into_iter().collect();
    }

    /// Returns `true` if the trace applies to `tree`.
    #[must_use]
    pub fn handles_region_tree(&self, tree: TreeId) -> bool {
        self.application_trees.is_empty() || self.application_trees.contains(&tree)
    }
}

/// Dynamic trace payload: dependences learned during the first pass.
#[derive(Debug, Default)]
pub struct DynamicTrace {
    fixed: bool,
    tracing: bool,
    dependences: Vec<Vec<DependenceRecord>>,
    op_map: HashMap<OpGen, usize>,
    // Internal ops may be regenerated differently per pass, so dependences
    // through them are flattened into transitive records between their
    // non-internal neighbours instead of being stored under an index.
    internal_dependences: BTreeMap<OpGen, Vec<DependenceRecord>>,
    op_info: Vec<OperationInfo>,
}

impl DynamicTrace {
    fn new() -> Self {
        Self {
            tracing: true,
            ..Self::default()
        }
    }

    /// Returns `true` once the first capture has been fixed.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Returns `true` during the first (capturing) pass.
    #[must_use]
    pub const fn is_tracing(&self) -> bool {
        self.tracing
    }

    /// Ends the capturing pass.
    pub fn end_trace_capture(&mut self) {
        self.tracing = false;
    }

    /// Fixes the captured dependences; replays validate against them.
    pub fn fix_trace(&mut self) {
        self.fixed = true;
    }

    /// Captured dependence lists, one per non-internal operation.
    #[must_use]
    pub fn dependences(&self) -> &[Vec<DependenceRecord>] {
        &self.dependences
    }

    fn insert_dependence(&mut self, record: DependenceRecord) {
        if let Some(current) = self.dependences.last_mut() {
            merge_in(current, record);
        } else {
            debug_assert!(false, "dependence recorded before any operation");
        }
    }

    fn insert_internal_dependence(&mut self, key: OpGen, record: DependenceRecord) {
        merge_in(self.internal_dependences.entry(key).or_default(), record);
    }
}

/// The two trace flavors behind one registration interface.
#[derive(Debug)]
pub enum TraceVariant {
    /// Application-supplied dependences.
    Static(StaticTrace),
    /// Learned dependences.
    Dynamic(DynamicTrace),
}

/// One marked trace scope owned by its context.
pub struct LogicalTrace {
    tid: TraceId,
    state: TracingState,
    operations: Vec<OpGen>,
    frontiers: BTreeSet<OpGen>,
    aliased_children: BTreeMap<(u32, u32), FieldMask>,
    blocking_call_observed: bool,
    physical: Option<PhysicalTrace>,
    variant: TraceVariant,
}

impl LogicalTrace {
    /// Creates a dynamic trace.
    #[must_use]
    pub fn new_dynamic(tid: TraceId) -> Self {
        Self::with_variant(tid, TraceVariant::Dynamic(DynamicTrace::new()))
    }

    /// Creates a static trace over `trees` (empty means all trees).
    #[must_use]
    pub fn new_static(tid: TraceId, trees: impl IntoIterator<Item = TreeId>) -> Self {
        let mut st = StaticTrace::default();
        st.set_application_trees(trees);
        Self::with_variant(tid, TraceVariant::Static(st))
    }

    fn with_variant(tid: TraceId, variant: TraceVariant) -> Self {
        Self {
            tid,
            state: TracingState::LogicalOnly,
            operations: Vec::new(),
            frontiers: BTreeSet::new(),
            aliased_children: BTreeMap::new(),
            blocking_call_observed: false,
            physical: None,
            variant,
        }
    }

    /// The application-chosen trace id.
    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.tid
    }

    /// The trace flavor.
    #[must_use]
    pub const fn variant(&self) -> &TraceVariant {
        &self.variant
    }

    /// The trace flavor, mutably.
    pub fn variant_mut(&mut self) -> &mut TraceVariant {
        &mut self.variant
    }

    /// Returns `true` once the trace rejects signature changes.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        match &self.variant {
            TraceVariant::Static(_) => true,
            TraceVariant::Dynamic(d) => d.is_fixed(),
        }
    }

    /// Returns `true` if the trace applies to `tree`.
    #[must_use]
    pub fn handles_region_tree(&self, tree: TreeId) -> bool {
        match &self.variant {
            TraceVariant::Static(s) => s.handles_region_tree(tree),
            TraceVariant::Dynamic(_) => true,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle state
    // ------------------------------------------------------------------

    /// Resets to the logical-only state at a trace boundary.
    pub fn initialize_tracing_state(&mut self) {
        self.state = TracingState::LogicalOnly;
    }

    /// Enters the physical-record state.
    pub fn set_state_record(&mut self) {
        self.state = TracingState::PhysicalRecord;
    }

    /// Enters the physical-replay state.
    pub fn set_state_replay(&mut self) {
        self.state = TracingState::PhysicalReplay;
    }

    /// Returns `true` while a template records.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state == TracingState::PhysicalRecord
    }

    /// Returns `true` while a template replays.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.state == TracingState::PhysicalReplay
    }

    /// Clears the blocking-call flag at a trace boundary.
    pub fn clear_blocking_call(&mut self) {
        self.blocking_call_observed = false;
    }

    /// Marks that user code blocked inside the trace.
    pub fn record_blocking_call(&mut self) {
        self.blocking_call_observed = true;
    }

    /// Returns `true` if user code blocked inside the trace.
    #[must_use]
    pub const fn has_blocking_call(&self) -> bool {
        self.blocking_call_observed
    }

    // ------------------------------------------------------------------
    // Physical trace ownership
    // ------------------------------------------------------------------

    /// Attaches (or returns the existing) physical trace.
    pub fn enable_physical(&mut self, config: replay_tape::ReplayConfig) -> &mut PhysicalTrace {
        self.physical
            .get_or_insert_with(|| PhysicalTrace::new(config))
    }

    /// Returns `true` if physical memoization is enabled.
    #[must_use]
    pub const fn has_physical_trace(&self) -> bool {
        self.physical.is_some()
    }

    /// The physical trace, if enabled.
    #[must_use]
    pub const fn physical(&self) -> Option<&PhysicalTrace> {
        self.physical.as_ref()
    }

    /// The physical trace, mutably.
    pub fn physical_mut(&mut self) -> Option<&mut PhysicalTrace> {
        self.physical.as_mut()
    }

    /// Drops the cached template selection after external mutation (for
    /// example new subregions) invalidated recorded conditions.
    pub fn invalidate_trace_cache(
        &mut self,
        invalidator: UniqueId,
        diag: Option<&mut dyn DiagSink>,
    ) {
        if let Some(physical) = self.physical.as_mut() {
            physical.clear_cached_template();
            if let Some(sink) = diag {
                sink.event(DiagEvent::TraceCacheInvalidated { invalidator });
            }
        }
    }

    // ------------------------------------------------------------------
    // Registration and dependence capture
    // ------------------------------------------------------------------

    /// Operations registered in the current pass.
    #[must_use]
    pub fn operations(&self) -> &[OpGen] {
        &self.operations
    }

    /// Operations with no outgoing intra-trace dependence.
    #[must_use]
    pub const fn frontiers(&self) -> &BTreeSet<OpGen> {
        &self.frontiers
    }

    /// Registers `(op, gen)` with the trace in analysis order.
    ///
    /// While a dynamic trace captures, this allocates its dependence list;
    /// once the trace is fixed, it validates the operation's signature and
    /// returns the captured records the scheduler must replay against the
    /// operation. Static traces always return nothing here; their records
    /// come from [`StaticTrace::translate_dependence_records`].
    pub fn register_operation(
        &mut self,
        op: &dyn Operation,
        generation: GenId,
    ) -> Result<&[DependenceRecord], TraceError> {
        let key = (op.unique_id(), generation);
        match &mut self.variant {
            TraceVariant::Static(_) => {
                self.operations.push(key);
                self.frontiers.insert(key);
                Ok(&[])
            }
            TraceVariant::Dynamic(d) => {
                if d.tracing {
                    if op.is_internal() {
                        d.internal_dependences.entry(key).or_default();
                    } else {
                        let index = self.operations.len();
                        self.operations.push(key);
                        self.frontiers.insert(key);
                        d.op_map.insert(key, index);
                        d.dependences.push(Vec::new());
                        d.op_info.push(OperationInfo {
                            kind: op.operation_kind(),
                            count: op.region_count(),
                        });
                    }
                    Ok(&[])
                } else {
                    if op.is_internal() {
                        // Regenerated helpers carry no replayed records;
                        // their dependences were flattened at capture.
                        return Ok(&[]);
                    }
                    let index = self.operations.len();
                    if index >= d.dependences.len() {
                        return Err(TraceError::TraceTooLong {
                            expected: d.dependences.len(),
                        });
                    }
                    let info = d.op_info[index];
                    let found = (op.operation_kind(), op.region_count());
                    if (info.kind, info.count) != found {
                        return Err(TraceError::ShapeMismatch {
                            index,
                            expected: (info.kind, info.count),
                            found,
                        });
                    }
                    self.operations.push(key);
                    self.frontiers.insert(key);
                    // Replayed dependences give their targets outgoing
                    // edges, keeping frontier resolution identical to the
                    // capturing pass.
                    for record in &d.dependences[index] {
                        if record.operation_idx >= 0
                            && let Some(target) =
                                self.operations.get(record.operation_idx as usize)
                        {
                            self.frontiers.remove(target);
                        }
                    }
                    Ok(&d.dependences[index])
                }
            }
        }
    }

    /// Registers an operation during a physical replay, where dependence
    /// analysis is skipped entirely.
    pub fn register_physical_only(&mut self, op: &dyn Operation, generation: GenId) {
        let key = (op.unique_id(), generation);
        self.operations.push(key);
        self.frontiers.insert(key);
    }

    /// Records the static dependences the application supplied for the next
    /// operation. Dynamic traces learn dependences instead and ignore this.
    pub fn record_static_dependences(&mut self, dependences: &[StaticDependence]) {
        if let TraceVariant::Static(s) = &mut self.variant {
            s.record_static_dependences(dependences);
        }
    }

    /// Records a whole-operation dependence of `source` on `target`.
    pub fn record_dependence(
        &mut self,
        target: &dyn Operation,
        target_gen: GenId,
        source: &dyn Operation,
        source_gen: GenId,
    ) {
        let target_key = (target.unique_id(), target_gen);
        let source_key = (source.unique_id(), source_gen);
        if target_key == source_key {
            return;
        }
        let TraceVariant::Dynamic(d) = &mut self.variant else {
            return;
        };
        if !d.tracing {
            return;
        }
        if source.is_internal() {
            if let Some(&index) = d.op_map.get(&target_key) {
                let idx = i32::try_from(index).unwrap_or(i32::MAX);
                d.insert_internal_dependence(source_key, DependenceRecord::whole_op(idx));
                self.frontiers.remove(&target_key);
            } else if target.is_internal()
                && let Some(internal) = d.internal_dependences.get(&target_key).cloned()
            {
                for record in internal {
                    d.insert_internal_dependence(
                        source_key,
                        DependenceRecord::whole_op(record.operation_idx),
                    );
                }
            }
            return;
        }
        if let Some(&index) = d.op_map.get(&target_key) {
            let idx = i32::try_from(index).unwrap_or(i32::MAX);
            d.insert_dependence(DependenceRecord::whole_op(idx));
            self.frontiers.remove(&target_key);
        } else if target.is_internal()
            && let Some(internal) = d.internal_dependences.get(&target_key).cloned()
        {
            for record in internal {
                self.frontiers
                    .remove_referenced(&self.operations, &record);
                d.insert_dependence(DependenceRecord::whole_op(record.operation_idx));
            }
        }
    }

    /// Records a fine-grained region dependence of `source` on `target`.
    ///
    /// Dependences whose later operation is internal accumulate under that
    /// op's key; when a non-internal op later depends on it, the
    /// accumulated records flatten into transitive records on the fields
    /// both dependences touch.
    #[allow(clippy::too_many_arguments, reason = "mirrors the analysis call")]
    pub fn record_region_dependence(
        &mut self,
        target: &dyn Operation,
        target_gen: GenId,
        source: &dyn Operation,
        source_gen: GenId,
        target_idx: u32,
        source_idx: u32,
        dtype: DependenceKind,
        validates: bool,
        dependent_mask: FieldMask,
    ) {
        let target_key = (target.unique_id(), target_gen);
        let source_key = (source.unique_id(), source_gen);
        let TraceVariant::Dynamic(d) = &mut self.variant else {
            return;
        };
        if !d.tracing {
            return;
        }

        let prev = i32::try_from(target_idx).unwrap_or(i32::MAX);
        let next = i32::try_from(source_idx).unwrap_or(i32::MAX);

        if source.is_internal() {
            if let Some(&index) = d.op_map.get(&target_key) {
                let idx = i32::try_from(index).unwrap_or(i32::MAX);
                d.insert_internal_dependence(
                    source_key,
                    DependenceRecord::region(idx, prev, next, validates, dtype, dependent_mask),
                );
                self.frontiers.remove(&target_key);
            } else if target.is_internal()
                && let Some(internal) = d.internal_dependences.get(&target_key).cloned()
            {
                for record in internal {
                    let overlap = record.dependent_mask & dependent_mask;
                    if overlap.is_empty() {
                        continue;
                    }
                    d.insert_internal_dependence(
                        source_key,
                        DependenceRecord::region(
                            record.operation_idx,
                            record.prev_idx,
                            next,
                            false,
                            DependenceKind::True,
                            overlap,
                        ),
                    );
                }
            }
            return;
        }

        if let Some(&index) = d.op_map.get(&target_key) {
            let idx = i32::try_from(index).unwrap_or(i32::MAX);
            d.insert_dependence(DependenceRecord::region(
                idx,
                prev,
                next,
                validates,
                dtype,
                dependent_mask,
            ));
            self.frontiers.remove(&target_key);
        } else if target.is_internal()
            && let Some(internal) = d.internal_dependences.get(&target_key).cloned()
        {
            // Flatten the internal op away: the source transitively depends
            // on everything the internal op depended on, restricted to the
            // fields both dependences touch.
            for record in internal {
                let overlap = record.dependent_mask & dependent_mask;
                if overlap.is_empty() {
                    continue;
                }
                self.frontiers
                    .remove_referenced(&self.operations, &record);
                d.insert_dependence(DependenceRecord::region(
                    record.operation_idx,
                    record.prev_idx,
                    next,
                    false,
                    DependenceKind::True,
                    overlap,
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Aliased children
    // ------------------------------------------------------------------

    /// Marks the children of requirement `req_index` at `depth` as aliased
    /// but non-interfering on `mask`.
    pub fn record_aliased_children(&mut self, req_index: u32, depth: u32, mask: FieldMask) {
        *self
            .aliased_children
            .entry((req_index, depth))
            .or_default() |= mask;
    }

    /// Re-establishes recorded aliasing on the paths of a replayed pass.
    pub fn replay_aliased_children(&self, paths: &mut [RegionTreePath]) {
        for (&(req_index, depth), &mask) in &self.aliased_children {
            if let Some(path) = paths.get_mut(req_index as usize) {
                path.record_aliased_children(depth, mask);
            }
        }
    }

    // ------------------------------------------------------------------
    // Trace end
    // ------------------------------------------------------------------

    /// Ends the pass: returns the frontier operations the closing fence must
    /// depend on and clears the per-pass registration state.
    pub fn end_trace_execution(&mut self) -> Vec<OpGen> {
        let sources: Vec<OpGen> = self.frontiers.iter().copied().collect();
        self.operations.clear();
        self.frontiers.clear();
        if let TraceVariant::Dynamic(d) = &mut self.variant {
            d.op_map.clear();
            if !d.tracing {
                d.internal_dependences.clear();
            }
        }
        sources
    }
}

/// Frontier-removal helper for records that reference ops by index.
trait RemoveReferenced {
    fn remove_referenced(&mut self, operations: &[OpGen], record: &DependenceRecord);
}

impl RemoveReferenced for BTreeSet<OpGen> {
    fn remove_referenced(&mut self, operations: &[OpGen], record: &DependenceRecord) {
        if record.operation_idx >= 0
            && let Some(key) = operations.get(record.operation_idx as usize)
        {
            self.remove(key);
        }
    }
}
