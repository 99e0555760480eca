// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Identifier newtypes shared across the tape.
//!
//! Everything the template references from the surrounding runtime — events,
//! operations, views, equivalence sets, index-space expressions — appears
//! here as an opaque copyable handle. The template never dereferences a
//! handle itself; it stores them and hands them back through the
//! [`crate::runtime`] traits.

use core::fmt;

/// An application-level completion event handle.
///
/// Value `0` is the distinguished "no event": it is always considered
/// triggered and never needs waiting on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApEvent(pub u64);

impl ApEvent {
    /// The distinguished no-event value.
    pub const NO_EVENT: Self = Self(0);

    /// Returns `true` if this is a real event that can be waited on.
    #[must_use]
    #[inline]
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ApEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{:x}", self.0)
    }
}

/// A user-triggerable event handle.
///
/// User events are created untriggered and fired exactly once with a base
/// event via [`crate::runtime::EventFabric::trigger_event`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApUserEvent(pub u64);

impl ApUserEvent {
    /// Views this user event as a plain [`ApEvent`] for waiting.
    #[must_use]
    #[inline]
    pub const fn as_event(self) -> ApEvent {
        ApEvent(self.0)
    }

    /// Returns `true` if this is a real event.
    #[must_use]
    #[inline]
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}

/// Identifies a memoizable operation within one trace.
///
/// Trace-local ids are assigned by the enclosing context when operations are
/// registered with a trace, and stay stable across replays; the template's
/// operation table is rebound through them at the start of every replay.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceLocalId(pub u64);

impl TraceLocalId {
    /// Owner id used for instructions synthesized by the template itself
    /// (fence assignment, crossing-event triggers, frontier merges).
    pub const FENCE: Self = Self(u64::MAX);
}

impl fmt::Display for TraceLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::FENCE {
            write!(f, "fence")
        } else {
            write!(f, "op{}", self.0)
        }
    }
}

/// Globally unique operation id assigned by the surrounding runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(pub u64);

/// Generation counter disambiguating reuse of an operation object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenId(pub u32);

/// Operation-kind discriminant from the external op taxonomy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpKind(pub u32);

/// A logical trace id chosen by the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u32);

/// Handle for a concrete physical instance view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

/// Handle for a fill-value view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FillViewId(pub u64);

/// Handle for an equivalence set (a region-tree partition whose points share
/// valid instances for the traced fields).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EqSetId(pub u64);

/// Handle for an index-space expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u64);

/// Region-tree id; views belonging to the same tree form one validity group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u32);

/// Handle for a physical instance referenced by copy/fill field descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

/// Field id within a field space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Task variant id from the mapper.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantId(pub u32);

/// Processor handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcId(pub u64);

/// Reduction operator id; `0` means "not a reduction".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RedopId(pub u32);

impl RedopId {
    /// The non-reduction value.
    pub const NONE: Self = Self(0);

    /// Returns `true` for a real reduction operator.
    #[must_use]
    #[inline]
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}
