// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The template instruction set.
//!
//! A recorded template is a sequence of [`Instruction`]s over two register
//! files: `events` (plain event slots) and `user_events` (triggerable
//! slots). Instructions never store event *values*; they store slot indices
//! assigned at record time, so the same tape can be re-executed against
//! fresh events on every replay.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;

use crate::ids::{ExprId, RedopId, TraceLocalId};
use crate::runtime::CopySrcDstField;

/// Stable numeric discriminants for the nine instruction kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum InstructionKindTag {
    /// `events[lhs] = operations[owner].completion_event()`
    GetTermEvent = 0,
    /// `events[lhs] = create_user_event()`
    CreateApUserEvent = 1,
    /// `trigger(user_events[lhs], events[rhs])`
    TriggerEvent = 2,
    /// `events[lhs] = merge(events[rhs..])`
    MergeEvent = 3,
    /// `events[lhs] = issue_copy(..)`
    IssueCopy = 4,
    /// `events[lhs] = issue_fill(..)`
    IssueFill = 5,
    /// `events[lhs] = operations[owner].compute_sync_precondition()`
    SetOpSyncEvent = 6,
    /// `events[lhs] = fence_completion`
    AssignFenceCompletion = 7,
    /// `operations[owner].complete_replay(events[rhs])`
    CompleteReplay = 8,
}

/// Payload of one instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstructionKind {
    /// Capture the owner op's completion event into `lhs`.
    GetTermEvent {
        /// Destination event slot.
        lhs: usize,
    },
    /// Allocate a fresh user event into `lhs`.
    CreateApUserEvent {
        /// Destination event slot (also the user-event slot).
        lhs: usize,
    },
    /// Trigger the user event in `lhs` with the event in `rhs`.
    TriggerEvent {
        /// User-event slot to trigger.
        lhs: usize,
        /// Precondition event slot.
        rhs: usize,
    },
    /// Merge the events in `rhs` into `lhs`.
    MergeEvent {
        /// Destination event slot.
        lhs: usize,
        /// Operand event slots.
        rhs: BTreeSet<usize>,
    },
    /// Issue a copy whose completion lands in `lhs`.
    IssueCopy {
        /// Destination event slot.
        lhs: usize,
        /// Index-space expression to copy over.
        expr: ExprId,
        /// Source fields.
        src_fields: Vec<CopySrcDstField>,
        /// Destination fields.
        dst_fields: Vec<CopySrcDstField>,
        /// Precondition event slot.
        precondition: usize,
        /// Reduction operator applied by the copy, if any.
        redop: RedopId,
        /// Whether a reduction copy folds rather than applies.
        reduction_fold: bool,
    },
    /// Issue a fill whose completion lands in `lhs`.
    IssueFill {
        /// Destination event slot.
        lhs: usize,
        /// Index-space expression to fill over.
        expr: ExprId,
        /// Destination fields.
        fields: Vec<CopySrcDstField>,
        /// Fill value bytes.
        value: Box<[u8]>,
        /// Precondition event slot.
        precondition: usize,
    },
    /// Capture the owner op's sync precondition into `lhs`.
    SetOpSyncEvent {
        /// Destination event slot.
        lhs: usize,
    },
    /// Copy the replay fence completion into `lhs`.
    AssignFenceCompletion {
        /// Destination event slot.
        lhs: usize,
    },
    /// Hand the owner op its replayed completion precondition.
    CompleteReplay {
        /// Precondition event slot.
        rhs: usize,
    },
}

/// One template instruction: a payload plus the trace-local id of the
/// operation on whose behalf it was recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Recording owner; [`TraceLocalId::FENCE`] for synthesized instructions.
    pub owner: TraceLocalId,
    /// Payload.
    pub kind: InstructionKind,
}

impl Instruction {
    /// Creates an instruction.
    #[must_use]
    pub const fn new(owner: TraceLocalId, kind: InstructionKind) -> Self {
        Self { owner, kind }
    }

    /// Numeric kind tag.
    #[must_use]
    pub const fn tag(&self) -> InstructionKindTag {
        match self.kind {
            InstructionKind::GetTermEvent { .. } => InstructionKindTag::GetTermEvent,
            InstructionKind::CreateApUserEvent { .. } => InstructionKindTag::CreateApUserEvent,
            InstructionKind::TriggerEvent { .. } => InstructionKindTag::TriggerEvent,
            InstructionKind::MergeEvent { .. } => InstructionKindTag::MergeEvent,
            InstructionKind::IssueCopy { .. } => InstructionKindTag::IssueCopy,
            InstructionKind::IssueFill { .. } => InstructionKindTag::IssueFill,
            InstructionKind::SetOpSyncEvent { .. } => InstructionKindTag::SetOpSyncEvent,
            InstructionKind::AssignFenceCompletion { .. } => {
                InstructionKindTag::AssignFenceCompletion
            }
            InstructionKind::CompleteReplay { .. } => InstructionKindTag::CompleteReplay,
        }
    }

    /// The event slot this instruction defines, if any.
    ///
    /// `TriggerEvent` and `CompleteReplay` define nothing: they consume an
    /// already-defined slot.
    #[must_use]
    pub fn result_slot(&self) -> Option<usize> {
        match &self.kind {
            InstructionKind::GetTermEvent { lhs }
            | InstructionKind::CreateApUserEvent { lhs }
            | InstructionKind::MergeEvent { lhs, .. }
            | InstructionKind::IssueCopy { lhs, .. }
            | InstructionKind::IssueFill { lhs, .. }
            | InstructionKind::SetOpSyncEvent { lhs }
            | InstructionKind::AssignFenceCompletion { lhs } => Some(*lhs),
            InstructionKind::TriggerEvent { .. } | InstructionKind::CompleteReplay { .. } => None,
        }
    }

    /// Calls `f` for every event slot this instruction waits on.
    pub fn for_each_input(&self, mut f: impl FnMut(usize)) {
        match &self.kind {
            InstructionKind::TriggerEvent { rhs, .. }
            | InstructionKind::CompleteReplay { rhs } => f(*rhs),
            InstructionKind::MergeEvent { rhs, .. } => {
                for &r in rhs {
                    f(r);
                }
            }
            InstructionKind::IssueCopy { precondition, .. }
            | InstructionKind::IssueFill { precondition, .. } => f(*precondition),
            InstructionKind::GetTermEvent { .. }
            | InstructionKind::CreateApUserEvent { .. }
            | InstructionKind::SetOpSyncEvent { .. }
            | InstructionKind::AssignFenceCompletion { .. } => {}
        }
    }

    /// Rewrites every input slot through `map`.
    pub fn rewrite_inputs(&mut self, map: impl Fn(usize) -> usize) {
        match &mut self.kind {
            InstructionKind::TriggerEvent { rhs, .. }
            | InstructionKind::CompleteReplay { rhs } => *rhs = map(*rhs),
            InstructionKind::MergeEvent { rhs, .. } => {
                *rhs = rhs.iter().map(|&r| map(r)).collect();
            }
            InstructionKind::IssueCopy { precondition, .. }
            | InstructionKind::IssueFill { precondition, .. } => {
                *precondition = map(*precondition);
            }
            InstructionKind::GetTermEvent { .. }
            | InstructionKind::CreateApUserEvent { .. }
            | InstructionKind::SetOpSyncEvent { .. }
            | InstructionKind::AssignFenceCompletion { .. } => {}
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstructionKind::GetTermEvent { lhs } => {
                write!(f, "events[{lhs}] = {}.completion()", self.owner)
            }
            InstructionKind::CreateApUserEvent { lhs } => {
                write!(f, "events[{lhs}] = create_user_event()")
            }
            InstructionKind::TriggerEvent { lhs, rhs } => {
                write!(f, "trigger(user_events[{lhs}], events[{rhs}])")
            }
            InstructionKind::MergeEvent { lhs, rhs } => {
                write!(f, "events[{lhs}] = merge(")?;
                for (i, r) in rhs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "events[{r}]")?;
                }
                write!(f, ")")
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
                write!(
                    f,
                    "events[{lhs}] = copy(expr{}, {}s/{}d, pre = events[{precondition}]",
                    expr.0,
                    src_fields.len(),
                    dst_fields.len(),
                )?;
                if redop.exists() {
                    write!(f, ", redop = {}", redop.0)?;
                    if *reduction_fold {
                        write!(f, ", fold")?;
                    }
                }
                write!(f, ")")
            }
            InstructionKind::IssueFill {
                lhs,
                expr,
                fields,
                value,
                precondition,
            } => write!(
                f,
                "events[{lhs}] = fill(expr{}, {}d, {}b, pre = events[{precondition}])",
                expr.0,
                fields.len(),
                value.len(),
            ),
            InstructionKind::SetOpSyncEvent { lhs } => {
                write!(f, "events[{lhs}] = {}.sync_precondition()", self.owner)
            }
            InstructionKind::AssignFenceCompletion { lhs } => {
                write!(f, "events[{lhs}] = fence_completion")
            }
            InstructionKind::CompleteReplay { rhs } => {
                write!(f, "{}.complete_replay(events[{rhs}])", self.owner)
            }
        }
    }
}
