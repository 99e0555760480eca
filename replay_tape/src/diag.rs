// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Diagnostic hooks for template recording and replay.
//!
//! Diagnostics are optional and `no_std` friendly: call sites that can emit
//! take an `Option<&mut dyn DiagSink>` and stay silent when given `None`.

use crate::ids::UniqueId;
use crate::template::NotReplayableReason;

/// A diagnostic event emitted by the registry and lifecycle operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagEvent<'a> {
    /// A finalized template was stored for replay.
    TemplateStored {
        /// Index in the registry's template list.
        index: usize,
        /// Instruction count after optimization.
        instructions: usize,
        /// Number of replay slices.
        slices: usize,
    },
    /// A finalized template was rejected.
    TemplateNotReplayable {
        /// Why the template cannot be replayed.
        reason: &'a NotReplayableReason,
        /// Consecutive rejections for this trace.
        consecutive: u32,
    },
    /// Consecutive rejections reached the configured threshold.
    NonReplayableWarning {
        /// The threshold that was reached.
        threshold: u32,
    },
    /// A stored template was selected for replay.
    TemplateReplayed {
        /// Index in the registry's template list.
        index: usize,
        /// Whether the replay chains on the immediately preceding one.
        recurrent: bool,
    },
    /// A cached template was dropped because of external mutation.
    TraceCacheInvalidated {
        /// Operation that caused the invalidation.
        invalidator: UniqueId,
    },
}

/// Receiver for diagnostic events.
pub trait DiagSink {
    /// Receives one event.
    fn event(&mut self, event: DiagEvent<'_>);
}

/// Forwards to the sink if one is present.
#[inline]
pub(crate) fn emit(sink: &mut Option<&mut dyn DiagSink>, event: DiagEvent<'_>) {
    if let Some(s) = sink.as_mut() {
        s.event(event);
    }
}
