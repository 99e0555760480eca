// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-logical-trace template registry.
//!
//! A [`PhysicalTrace`] owns the templates recorded for one logical trace,
//! selects one for replay when its preconditions hold, and tracks the
//! completion chaining between successive replays.

use alloc::vec::Vec;
use core::fmt;

use crate::diag::{DiagEvent, DiagSink, emit};
use crate::ids::ApEvent;
use crate::runtime::{EventFabric, RegionOracle};
use crate::template::{NotReplayableReason, PhysicalTemplate};

/// Tunables consumed by the registry and its templates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Number of slices a template replay fans out into.
    pub replay_parallelism: usize,
    /// Consecutive non-replayable captures before a warning is emitted.
    pub max_nonreplayable_warning: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            replay_parallelism: 2,
            max_nonreplayable_warning: 5,
        }
    }
}

/// A template removed from recording, plus the event that must complete
/// before it is safe to drop.
pub struct RetiredTemplate {
    /// Completion covering every in-flight effect the template references.
    pub completion: ApEvent,
    /// The template itself.
    pub template: PhysicalTemplate,
}

impl fmt::Debug for RetiredTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredTemplate")
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

/// Result of fixing a recorded trace.
#[derive(Debug)]
pub enum FixOutcome {
    /// The template was stored and can replay.
    Stored {
        /// Its index in the registry.
        index: usize,
    },
    /// The template was rejected; the caller owns its deferred deletion.
    NotReplayable {
        /// Why it was rejected.
        reason: NotReplayableReason,
        /// The rejected template and its deletion precondition.
        retired: RetiredTemplate,
    },
}

/// Registry of physical templates for one logical trace.
pub struct PhysicalTrace {
    config: ReplayConfig,
    templates: Vec<PhysicalTemplate>,
    current_template: Option<usize>,
    recording_template: Option<PhysicalTemplate>,
    nonreplayable_count: u32,
    previous_template_completion: ApEvent,
}

impl PhysicalTrace {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            templates: Vec::new(),
            current_template: None,
            recording_template: None,
            nonreplayable_count: 0,
            previous_template_completion: ApEvent::NO_EVENT,
        }
    }

    /// Begins recording a fresh template fenced by `fence_event`.
    pub fn start_new_template(&mut self, fence_event: ApEvent) -> &mut PhysicalTemplate {
        self.current_template = None;
        self.recording_template.insert(PhysicalTemplate::new(
            fence_event,
            self.config.replay_parallelism,
        ))
    }

    /// The template currently being recorded, if any.
    pub fn current_recording_mut(&mut self) -> Option<&mut PhysicalTemplate> {
        self.recording_template.as_mut()
    }

    /// Finalizes the recording template: stores it when replayable,
    /// otherwise retires it and counts the rejection.
    pub fn fix_trace<R: EventFabric + RegionOracle + ?Sized>(
        &mut self,
        rt: &mut R,
        has_blocking_call: bool,
        mut diag: Option<&mut dyn DiagSink>,
    ) -> Option<FixOutcome> {
        let mut template = self.recording_template.take()?;
        match template.finalize(rt, has_blocking_call) {
            Ok(()) => {
                self.nonreplayable_count = 0;
                let index = self.templates.len();
                emit(
                    &mut diag,
                    DiagEvent::TemplateStored {
                        index,
                        instructions: template.instructions().len(),
                        slices: template.slices().len(),
                    },
                );
                self.templates.push(template);
                self.current_template = Some(index);
                Some(FixOutcome::Stored { index })
            }
            Err(reason) => {
                self.nonreplayable_count += 1;
                emit(
                    &mut diag,
                    DiagEvent::TemplateNotReplayable {
                        reason: &reason,
                        consecutive: self.nonreplayable_count,
                    },
                );
                if self.nonreplayable_count >= self.config.max_nonreplayable_warning {
                    emit(
                        &mut diag,
                        DiagEvent::NonReplayableWarning {
                            threshold: self.config.max_nonreplayable_warning,
                        },
                    );
                    self.nonreplayable_count = 0;
                }
                let completion = template.completion_for_deletion(rt);
                Some(FixOutcome::NotReplayable {
                    reason,
                    retired: RetiredTemplate {
                        completion,
                        template,
                    },
                })
            }
        }
    }

    /// Finds the first stored template whose preconditions hold and selects
    /// it as the current template.
    pub fn check_template_preconditions<O: RegionOracle + ?Sized>(
        &mut self,
        oracle: &O,
    ) -> Option<usize> {
        let selected = self
            .templates
            .iter()
            .position(|tpl| tpl.check_preconditions(oracle));
        self.current_template = selected;
        selected
    }

    /// Prepares the currently selected template for a replay.
    pub fn initialize_template<F: EventFabric + ?Sized>(
        &mut self,
        fabric: &mut F,
        fence_completion: ApEvent,
        recurrent: bool,
    ) -> Option<&mut PhysicalTemplate> {
        let index = self.current_template?;
        let template = self.templates.get_mut(index)?;
        template.initialize(fabric, fence_completion, recurrent);
        Some(template)
    }

    /// Index of the currently selected template.
    #[must_use]
    pub const fn current_template(&self) -> Option<usize> {
        self.current_template
    }

    /// The currently selected template.
    pub fn current_template_mut(&mut self) -> Option<&mut PhysicalTemplate> {
        let index = self.current_template?;
        self.templates.get_mut(index)
    }

    /// Drops the current selection; the next replay re-checks preconditions.
    pub fn clear_cached_template(&mut self) {
        self.current_template = None;
    }

    /// Returns `true` if at least one template is stored.
    #[must_use]
    pub fn has_any_templates(&self) -> bool {
        !self.templates.is_empty()
    }

    /// Stored templates in recording order.
    #[must_use]
    pub fn templates(&self) -> &[PhysicalTemplate] {
        &self.templates
    }

    /// Consecutive non-replayable captures since the last stored template
    /// or warning.
    #[must_use]
    pub const fn nonreplayable_count(&self) -> u32 {
        self.nonreplayable_count
    }

    /// Records the completion of the just-finished replay for recurrent
    /// chaining.
    pub fn record_previous_template_completion(&mut self, completion: ApEvent) {
        self.previous_template_completion = completion;
    }

    /// Completion of the previous replay of this trace.
    #[must_use]
    pub const fn get_previous_template_completion(&self) -> ApEvent {
        self.previous_template_completion
    }

    /// The registry's configuration.
    #[must_use]
    pub const fn config(&self) -> &ReplayConfig {
        &self.config
    }
}
