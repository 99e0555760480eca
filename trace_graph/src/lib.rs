// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `trace_graph`: logical trace memoization over `replay_tape`.
//!
//! A scheduler that marks a repeated span of its operation stream pays
//! dependence analysis once: the first pass over a [`LogicalTrace`]
//! captures every dependence between the registered operations, and later
//! passes replay the captured records instead of re-analyzing. Static
//! traces take their dependences from the application up front; dynamic
//! traces learn them, flatten scheduler-internal helper operations into
//! transitive records, and validate operation signatures on every replay.
//!
//! When a context also requests physical memoization, the trace owns a
//! [`replay_tape::PhysicalTrace`] and the lifecycle ops in [`ops`] bridge
//! the two layers: begin pins the fence, replay selects a stored template
//! or starts recording, capture fixes and finalizes, complete resolves
//! frontiers and chains successive replays, and summary materializes the
//! replayed region effects.

#![no_std]

extern crate alloc;

pub mod logical;
pub mod ops;
pub mod record;

#[cfg(test)]
pub(crate) mod test_utils;

pub use logical::{LogicalTrace, RegionTreePath, TraceError, TraceVariant, TracingState};
pub use ops::{
    CompleteOutcome, ReplayDecision, TraceBeginOp, TraceCaptureOp, TraceCompleteOp, TraceReplayOp,
    TraceSummaryOp,
};
pub use record::{DependenceKind, DependenceRecord, StaticDependence};
