// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `replay_tape`: recordable, optimizable, replayable physical task graphs.
//!
//! A task scheduler that repeatedly issues the same fenced sequence of
//! operations pays full dependence-analysis and mapping cost every pass.
//! This crate implements the physical half of trace memoization: while a
//! trace records, every physical action (event creation, merging, copies,
//! fills, completion plumbing) is appended to a [`PhysicalTemplate`] as an
//! instruction over event *slots* rather than event values. Once the trace
//! ends, the template derives its precondition / postcondition view sets,
//! decides whether a replay would be sound, optimizes the instruction graph
//! (fence elision, merge propagation, transitive reduction, copy
//! propagation, parallel slicing), and is stored in a per-trace
//! [`PhysicalTrace`] registry. Later passes that still satisfy the
//! preconditions replay the template through [`PhysicalTemplate::execute_all`]
//! instead of re-running analysis.
//!
//! The surrounding runtime stays external: events, copies, fills, and
//! region-state queries are reached through the [`runtime::EventFabric`] and
//! [`runtime::RegionOracle`] traits, and operations participate through
//! [`runtime::Memoizable`].
//!
//! ## Example
//!
//! ```no_run
//! use replay_tape::ids::*;
//! use replay_tape::mask::FieldMask;
//! use replay_tape::registry::{PhysicalTrace, ReplayConfig};
//! use replay_tape::runtime::*;
//! use replay_tape::template::ReplayBindings;
//! # struct Rt(u64);
//! # impl EventFabric for Rt {
//! #     fn create_user_event(&mut self) -> ApUserEvent { self.0 += 1; ApUserEvent(self.0) }
//! #     fn trigger_event(&mut self, _: ApUserEvent, _: ApEvent) {}
//! #     fn merge_events(&mut self, _: &[ApEvent]) -> ApEvent { self.0 += 1; ApEvent(self.0) }
//! #     fn issue_copy(&mut self, _: ExprId, _: &[CopySrcDstField], _: &[CopySrcDstField], _: ApEvent, _: RedopId, _: bool) -> ApEvent { self.0 += 1; ApEvent(self.0) }
//! #     fn issue_fill(&mut self, _: ExprId, _: &[CopySrcDstField], _: &[u8], _: ApEvent) -> ApEvent { self.0 += 1; ApEvent(self.0) }
//! # }
//! # impl RegionOracle for Rt {
//! #     fn version_of(&self, _: EqSetId) -> u64 { 0 }
//! #     fn valid_fields(&self, _: ViewId, _: EqSetId) -> FieldMask { FieldMask::EMPTY }
//! #     fn restore_fields(&mut self, _: ViewId, _: EqSetId, _: FieldMask) {}
//! #     fn invalidate_fields(&mut self, _: ViewId, _: EqSetId, _: FieldMask) {}
//! #     fn exprs_overlap(&self, _: ExprId, _: ExprId) -> bool { true }
//! #     fn view_tree(&self, _: ViewId) -> TreeId { TreeId(0) }
//! #     fn is_reduction_view(&self, _: ViewId) -> bool { false }
//! #     fn eq_refines(&self, _: EqSetId, _: EqSetId) -> bool { false }
//! # }
//! # struct Task;
//! # impl Operation for Task {
//! #     fn unique_id(&self) -> UniqueId { UniqueId(1) }
//! #     fn operation_kind(&self) -> OpKind { OpKind(1) }
//! #     fn region_count(&self) -> u32 { 1 }
//! # }
//! # impl Memoizable for Task {
//! #     fn trace_local_id(&self) -> TraceLocalId { TraceLocalId(0) }
//! #     fn completion_event(&self) -> ApEvent { ApEvent(7) }
//! #     fn compute_sync_precondition(&self) -> ApEvent { ApEvent::NO_EVENT }
//! #     fn complete_replay(&mut self, _: ApEvent) {}
//! # }
//!
//! let mut rt = Rt(0x100);
//! let mut task = Task;
//! let mut trace = PhysicalTrace::new(ReplayConfig::default());
//!
//! // First pass: record.
//! let fence = ApEvent(1);
//! let tpl = trace.start_new_template(fence);
//! tpl.record_get_term_event(&task);
//! // ... the scheduler routes every physical action through record_* ...
//! trace.fix_trace(&mut rt, false, None);
//!
//! // Later passes: replay when preconditions still hold.
//! if trace.check_template_preconditions(&rt).is_some() {
//!     let fence_completion = ApEvent(2);
//!     let tpl = trace
//!         .initialize_template(&mut rt, fence_completion, false)
//!         .unwrap();
//!     let mut bindings = ReplayBindings::new();
//!     bindings.bind(&mut task);
//!     tpl.execute_all(&mut bindings, &mut rt).unwrap();
//!     let completion = tpl.finish_replay(&mut rt);
//!     trace.record_previous_template_completion(completion);
//! }
//! ```

#![no_std]

extern crate alloc;

pub mod diag;
pub mod ids;
pub mod instruction;
pub mod mask;
mod optimize;
pub mod pretty;
pub mod registry;
pub mod runtime;
pub mod template;
pub mod view_set;

#[cfg(test)]
pub(crate) mod test_utils;

pub use ids::{ApEvent, ApUserEvent, TraceLocalId};
pub use mask::{FieldMask, FieldMaskSet};
pub use registry::{FixOutcome, PhysicalTrace, ReplayConfig};
pub use template::{PhysicalTemplate, ReplayBindings};
