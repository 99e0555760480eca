// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lifecycle operations injected into the operation stream.
//!
//! Five operations mark the trace boundaries: begin, replay selection,
//! capture, completion, and the summary that materializes a replayed
//! template's region effects. They are plain structs the enclosing
//! scheduler triggers at the matching points of its pipeline; each returns
//! the decision or outcome the scheduler acts on.

use alloc::vec::Vec;

use replay_tape::diag::{DiagEvent, DiagSink};
use replay_tape::ids::{ApEvent, EqSetId, ViewId};
use replay_tape::mask::FieldMask;
use replay_tape::registry::{FixOutcome, ReplayConfig};
use replay_tape::runtime::{EventFabric, OpGen, RegionOracle};
use replay_tape::template::PhysicalTemplate;

use crate::logical::{LogicalTrace, TraceVariant};

/// What a replay op decided for this pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplayDecision {
    /// A stored template satisfies its preconditions; replay it.
    Replay {
        /// Template index within the trace's registry.
        template: usize,
        /// Whether the replay chains on the immediately preceding one.
        recurrent: bool,
    },
    /// No template qualifies; record a new one.
    Record,
}

/// Marks the start of a trace scope. Acts as a mapping fence pinning the
/// begin point; the fence completion becomes event slot 0 of whatever
/// template records or replays behind it.
#[derive(Debug)]
pub struct TraceBeginOp {
    fence_completion: ApEvent,
}

impl TraceBeginOp {
    /// Creates the begin op for a fence completing with `fence_completion`.
    #[must_use]
    pub const fn new(fence_completion: ApEvent) -> Self {
        Self { fence_completion }
    }

    /// Completion event of the begin fence.
    #[must_use]
    pub const fn fence_completion(&self) -> ApEvent {
        self.fence_completion
    }

    /// Pins the trace at its begin point.
    pub fn trigger(&self, trace: &mut LogicalTrace) {
        trace.initialize_tracing_state();
        trace.clear_blocking_call();
    }
}

/// Selects a template to replay, or switches the trace to recording.
#[derive(Debug, Default)]
pub struct TraceReplayOp {
    decision: Option<ReplayDecision>,
}

impl TraceReplayOp {
    /// Creates the replay op.
    #[must_use]
    pub const fn new() -> Self {
        Self { decision: None }
    }

    /// The decision made by [`Self::trigger`], if it ran.
    #[must_use]
    pub const fn decision(&self) -> Option<ReplayDecision> {
        self.decision
    }

    /// Picks the first stored template whose preconditions hold. On a hit
    /// the trace enters physical-replay and the template is initialized for
    /// execution; on a miss the trace enters physical-record and a fresh
    /// template starts.
    pub fn trigger<R: EventFabric + RegionOracle + ?Sized>(
        &mut self,
        trace: &mut LogicalTrace,
        rt: &mut R,
        config: ReplayConfig,
        fence_completion: ApEvent,
        mut diag: Option<&mut dyn DiagSink>,
    ) -> ReplayDecision {
        let physical = trace.enable_physical(config);
        let previous = physical.current_template();
        let decision = match physical.check_template_preconditions(rt) {
            Some(template) => {
                let recurrent = previous == Some(template)
                    && physical.get_previous_template_completion().exists();
                physical.initialize_template(rt, fence_completion, recurrent);
                if let Some(sink) = diag.as_mut() {
                    sink.event(DiagEvent::TemplateReplayed {
                        index: template,
                        recurrent,
                    });
                }
                ReplayDecision::Replay {
                    template,
                    recurrent,
                }
            }
            None => {
                physical.start_new_template(fence_completion);
                ReplayDecision::Record
            }
        };
        match decision {
            ReplayDecision::Replay { .. } => trace.set_state_replay(),
            ReplayDecision::Record => trace.set_state_record(),
        }
        self.decision = Some(decision);
        decision
    }
}

/// Ends a recording trace scope: fixes the dynamic trace and finalizes the
/// template.
#[derive(Debug)]
pub struct TraceCaptureOp {
    has_blocking_call: bool,
}

impl TraceCaptureOp {
    /// Creates the capture op; `has_blocking_call` carries the context's own
    /// observation in addition to the trace's flag.
    #[must_use]
    pub const fn new(has_blocking_call: bool) -> Self {
        Self { has_blocking_call }
    }

    /// Fixes the captured trace and finalizes the recorded template.
    pub fn trigger<R: EventFabric + RegionOracle + ?Sized>(
        &self,
        trace: &mut LogicalTrace,
        rt: &mut R,
        diag: Option<&mut dyn DiagSink>,
    ) -> Option<FixOutcome> {
        if let TraceVariant::Dynamic(d) = trace.variant_mut() {
            d.end_trace_capture();
            d.fix_trace();
        }
        let blocking = self.has_blocking_call || trace.has_blocking_call();
        let outcome = trace
            .physical_mut()
            .and_then(|physical| physical.fix_trace(rt, blocking, diag));
        trace.initialize_tracing_state();
        outcome
    }
}

/// Outcome of a [`TraceCompleteOp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteOutcome {
    /// Frontier operations the closing fence must depend on.
    pub fence_sources: Vec<OpGen>,
    /// Completion of the replayed template, if this pass replayed one.
    pub template_completion: Option<ApEvent>,
}

/// Ends every trace scope: resolves frontiers into the closing fence and,
/// after a replay, finishes the template and records its completion for
/// recurrent chaining.
#[derive(Debug)]
pub struct TraceCompleteOp {
    replayed: bool,
}

impl TraceCompleteOp {
    /// Creates the completion op; `replayed` says whether this pass replayed
    /// a template.
    #[must_use]
    pub const fn new(replayed: bool) -> Self {
        Self { replayed }
    }

    /// Ends the pass and becomes the new current fence.
    pub fn trigger<F: EventFabric + ?Sized>(
        &self,
        trace: &mut LogicalTrace,
        fabric: &mut F,
    ) -> CompleteOutcome {
        let fence_sources = trace.end_trace_execution();
        let mut template_completion = None;
        if self.replayed
            && let Some(physical) = trace.physical_mut()
            && let Some(template) = physical.current_template_mut()
        {
            let completion = template.finish_replay(fabric);
            template_completion = Some(completion);
        }
        if let (Some(completion), Some(physical)) = (template_completion, trace.physical_mut()) {
            physical.record_previous_template_completion(completion);
        }
        trace.initialize_tracing_state();
        CompleteOutcome {
            fence_sources,
            template_completion,
        }
    }
}

/// Materializes a replayed template's region effects into the op stream so
/// downstream operations observe the same state a fresh execution would
/// have left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceSummaryOp {
    entries: Vec<(ViewId, EqSetId, FieldMask)>,
}

impl TraceSummaryOp {
    /// Captures the summary effects of `template`.
    #[must_use]
    pub fn for_template(template: &PhysicalTemplate) -> Self {
        Self {
            entries: template.postconditions().views().iter().collect(),
        }
    }

    /// The summarized `(view, eq, mask)` effects.
    #[must_use]
    pub fn entries(&self) -> &[(ViewId, EqSetId, FieldMask)] {
        &self.entries
    }

    /// Re-establishes the summarized state.
    pub fn apply<O: RegionOracle + ?Sized>(&self, oracle: &mut O) {
        for &(view, eq, mask) in &self.entries {
            oracle.restore_fields(view, eq, mask);
        }
    }
}
