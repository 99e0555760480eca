// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Instruction-graph optimization passes.
//!
//! Passes run in a fixed order on a finalized template: fence elision,
//! merge propagation, transitive reduction, copy propagation, parallel
//! slicing, and completion sinking. Every pass preserves the happens-before
//! closure of the recorded graph; slicing additionally routes each
//! cross-slice event edge through a crossing slot so slices synchronize only
//! through the event table.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;

use crate::ids::{ApEvent, TraceLocalId};
use crate::instruction::{Instruction, InstructionKind, InstructionKindTag};
use crate::runtime::{RegionOracle, RegionUsage};
use crate::template::{FENCE_COMPLETION_ID, PhysicalTemplate};

const NO_DEF: usize = usize::MAX;

/// Dense bitset sized to the instruction count, used for ancestor sets.
#[derive(Clone, Debug)]
struct DenseBits {
    bits: Vec<u64>,
}

impl DenseBits {
    fn new_empty(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
        }
    }

    fn get(&self, idx: usize) -> bool {
        (self.bits[idx / 64] >> (idx % 64)) & 1 == 1
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 64] |= 1_u64 << (idx % 64);
    }

    fn union_with(&mut self, other: &Self) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }
}

/// Happens-before summary of the current instruction stream.
struct EventGraph {
    /// Event slot -> instruction defining its value.
    defs: Vec<usize>,
    /// User-event slot -> instruction triggering it.
    trigger_of: BTreeMap<usize, usize>,
    /// Per instruction, the set of instructions that happen strictly before.
    ancestors: Vec<DenseBits>,
}

impl EventGraph {
    /// The instruction whose execution produces the *completion* of `slot`:
    /// the trigger for user-event slots, the value definer otherwise.
    fn completion_def(&self, slot: usize) -> usize {
        match self.trigger_of.get(&slot) {
            Some(&t) => t,
            None => self.defs.get(slot).copied().unwrap_or(NO_DEF),
        }
    }

    fn happens_before(&self, earlier: usize, later: usize) -> bool {
        earlier != NO_DEF && later != NO_DEF && self.ancestors[later].get(earlier)
    }
}

impl PhysicalTemplate {
    fn compute_defs(&self) -> Vec<usize> {
        let mut defs = vec![NO_DEF; self.events.len()];
        for (index, inst) in self.instructions.iter().enumerate() {
            if let Some(slot) = inst.result_slot() {
                defs[slot] = index;
            }
        }
        defs
    }

    fn compute_event_graph(&self) -> EventGraph {
        let defs = self.compute_defs();
        let mut trigger_of = BTreeMap::new();
        for (index, inst) in self.instructions.iter().enumerate() {
            if let InstructionKind::TriggerEvent { lhs, .. } = inst.kind {
                trigger_of.insert(lhs, index);
            }
        }

        let count = self.instructions.len();
        let mut ancestors: Vec<DenseBits> = Vec::with_capacity(count);
        for (index, inst) in self.instructions.iter().enumerate() {
            let mut anc = DenseBits::new_empty(count);
            inst.for_each_input(|slot| {
                let mut preds = [NO_DEF, NO_DEF];
                preds[0] = defs.get(slot).copied().unwrap_or(NO_DEF);
                if let Some(&t) = trigger_of.get(&slot) {
                    preds[1] = t;
                }
                for p in preds {
                    // Record order is topological for value edges; later
                    // triggers are left out, which only under-approximates.
                    if p != NO_DEF && p < index {
                        anc.union_with(&ancestors[p]);
                        anc.set(p);
                    }
                }
            });
            ancestors.push(anc);
        }
        EventGraph {
            defs,
            trigger_of,
            ancestors,
        }
    }

    /// Runs every pass in order. Called from `finalize` on success.
    pub(crate) fn optimize<O: RegionOracle + ?Sized>(&mut self, oracle: &O) {
        self.elide_fences(oracle);
        self.propagate_merges();
        self.transitive_reduction();
        self.propagate_copies();
        self.prepare_parallel_replay();
        self.push_complete_replays();
    }

    /// Computes the template frontiers (last users of every traced view) and
    /// rewrites instructions waiting only on the fence to wait on the
    /// previous replay's frontier crossings instead.
    fn elide_fences<O: RegionOracle + ?Sized>(&mut self, oracle: &O) {
        let graph = self.compute_event_graph();

        let mut frontier_slots: BTreeSet<usize> = BTreeSet::new();
        for users in self.view_users.values() {
            for user in users {
                let dominated = users.iter().any(|other| {
                    other.user != user.user
                        && user.mask.overlaps(other.mask)
                        && oracle.exprs_overlap(user.expr, other.expr)
                        && !RegionUsage::compatible(user.usage, other.usage)
                        && graph.happens_before(
                            graph.completion_def(user.user),
                            graph.completion_def(other.user),
                        )
                });
                if !dominated {
                    frontier_slots.insert(user.user);
                }
            }
        }
        if frontier_slots.is_empty() {
            return;
        }

        for &slot in &frontier_slots {
            let crossing = self.events.len();
            self.events.push(ApEvent::NO_EVENT);
            self.user_events.push(None);
            self.frontiers.insert(slot, crossing);
        }

        let substitute = if self.frontiers.len() == 1 {
            *self.frontiers.values().next().unwrap_or(&FENCE_COMPLETION_ID)
        } else {
            let merged = self.events.len();
            self.events.push(ApEvent::NO_EVENT);
            self.user_events.push(None);
            self.instructions.insert(
                1,
                Instruction::new(
                    TraceLocalId::FENCE,
                    InstructionKind::MergeEvent {
                        lhs: merged,
                        rhs: self.frontiers.values().copied().collect(),
                    },
                ),
            );
            merged
        };

        for inst in &mut self.instructions {
            if inst.result_slot() == Some(substitute) {
                continue;
            }
            let mut inputs = Vec::new();
            inst.for_each_input(|slot| inputs.push(slot));
            if !inputs.is_empty() && inputs.iter().all(|&s| s == FENCE_COMPLETION_ID) {
                inst.rewrite_inputs(|_| substitute);
            }
        }
    }

    /// Flattens nested merges and sweeps merges nothing consumes.
    fn propagate_merges(&mut self) {
        let defs = self.compute_defs();
        for index in 0..self.instructions.len() {
            let InstructionKind::MergeEvent { lhs, rhs } = &self.instructions[index].kind else {
                continue;
            };
            let lhs = *lhs;
            let mut flattened: BTreeSet<usize> = BTreeSet::new();
            let mut stack: Vec<usize> = rhs.iter().copied().collect();
            while let Some(slot) = stack.pop() {
                let def = defs.get(slot).copied().unwrap_or(NO_DEF);
                if def != NO_DEF
                    && def != index
                    && let InstructionKind::MergeEvent { rhs: inner, .. } =
                        &self.instructions[def].kind
                {
                    stack.extend(inner.iter().copied());
                } else {
                    flattened.insert(slot);
                }
            }
            self.instructions[index].kind = InstructionKind::MergeEvent {
                lhs,
                rhs: flattened,
            };
        }

        // Sweep merge instructions whose result no consumer reads.
        let mut used: BTreeSet<usize> = BTreeSet::new();
        for inst in &self.instructions {
            inst.for_each_input(|slot| {
                used.insert(slot);
            });
        }
        used.extend(self.frontiers.keys().copied());
        used.extend(self.memo_entries.values().copied());
        self.instructions.retain(|inst| {
            !(inst.tag() == InstructionKindTag::MergeEvent
                && inst.result_slot().is_some_and(|slot| !used.contains(&slot)))
        });
    }

    /// Drops merge operands already dominated by another operand.
    fn transitive_reduction(&mut self) {
        let graph = self.compute_event_graph();
        for inst in &mut self.instructions {
            let InstructionKind::MergeEvent { rhs, .. } = &mut inst.kind else {
                continue;
            };
            if rhs.len() < 2 {
                continue;
            }
            let operands: Vec<usize> = rhs.iter().copied().collect();
            let reduced: BTreeSet<usize> = operands
                .iter()
                .copied()
                .filter(|&r| {
                    let def = graph.completion_def(r);
                    !operands.iter().any(|&other| {
                        other != r && graph.happens_before(def, graph.completion_def(other))
                    })
                })
                .collect();
            if !reduced.is_empty() {
                *rhs = reduced;
            }
        }
    }

    /// Replaces singleton merges with their operand and deletes them.
    fn propagate_copies(&mut self) {
        let mut forward: BTreeMap<usize, usize> = BTreeMap::new();
        for inst in &self.instructions {
            if let InstructionKind::MergeEvent { lhs, rhs } = &inst.kind
                && rhs.len() == 1
            {
                forward.insert(*lhs, *rhs.iter().next().unwrap_or(&FENCE_COMPLETION_ID));
            }
        }
        if forward.is_empty() {
            return;
        }
        let resolve = |mut slot: usize| -> usize {
            while let Some(&next) = forward.get(&slot) {
                slot = next;
            }
            slot
        };

        self.instructions.retain(|inst| {
            !(inst.tag() == InstructionKindTag::MergeEvent
                && inst
                    .result_slot()
                    .is_some_and(|slot| forward.contains_key(&slot)))
        });
        for inst in &mut self.instructions {
            inst.rewrite_inputs(resolve);
        }
        self.frontiers = self
            .frontiers
            .iter()
            .map(|(&key, &slot)| (resolve(key), slot))
            .collect();
    }

    /// Partitions instructions into `replay_parallelism` slices, one set of
    /// memoized ops per slice, and routes cross-slice edges through crossing
    /// events.
    fn prepare_parallel_replay(&mut self) {
        let slice_count = if self.memo_entries.is_empty() {
            1
        } else {
            self.replay_parallelism.min(self.memo_entries.len())
        };

        let mut owner_slice: BTreeMap<TraceLocalId, usize> = BTreeMap::new();
        self.slice_tasks = vec![Vec::new(); slice_count];
        for (position, &owner) in self.memo_entries.keys().enumerate() {
            let slice = position % slice_count;
            owner_slice.insert(owner, slice);
            self.slice_tasks[slice].push(owner);
        }

        let mut slice_of: Vec<usize> = Vec::with_capacity(self.instructions.len());
        self.slices = vec![Vec::new(); slice_count];
        for (index, inst) in self.instructions.iter().enumerate() {
            let slice = owner_slice.get(&inst.owner).copied().unwrap_or(0);
            slice_of.push(slice);
            self.slices[slice].push(index);
        }
        if slice_count == 1 {
            return;
        }

        let defs = self.compute_defs();
        let original_len = self.instructions.len();
        for index in 0..original_len {
            let consumer_slice = slice_of[index];
            let mut inputs = Vec::new();
            self.instructions[index].for_each_input(|slot| inputs.push(slot));

            let mut rewrites: BTreeMap<usize, usize> = BTreeMap::new();
            for slot in inputs {
                let def = defs.get(slot).copied().unwrap_or(NO_DEF);
                // Slots written at initialize (fence, frontiers, crossings)
                // are visible to every slice.
                if def == NO_DEF || slice_of[def] == consumer_slice {
                    continue;
                }
                let crossing = if let Some(&c) = self.crossing_events.get(&slot) {
                    c
                } else {
                    let c = self.events.len();
                    self.events.push(ApEvent::NO_EVENT);
                    self.user_events.push(None);
                    self.crossing_events.insert(slot, c);

                    let producer_slice = slice_of[def];
                    let trigger_index = self.instructions.len();
                    self.instructions.push(Instruction::new(
                        TraceLocalId::FENCE,
                        InstructionKind::TriggerEvent { lhs: c, rhs: slot },
                    ));
                    slice_of.push(producer_slice);
                    let at = self.slices[producer_slice]
                        .iter()
                        .position(|&i| i == def)
                        .map_or(self.slices[producer_slice].len(), |p| p + 1);
                    self.slices[producer_slice].insert(at, trigger_index);
                    c
                };
                rewrites.insert(slot, crossing);
            }
            if !rewrites.is_empty() {
                self.instructions[index]
                    .rewrite_inputs(|slot| rewrites.get(&slot).copied().unwrap_or(slot));
            }
        }
    }

    /// Moves completion handoffs to the tail of their slice so user
    /// continuations become visible as late as possible.
    fn push_complete_replays(&mut self) {
        for slice in &mut self.slices {
            let (completes, rest): (Vec<usize>, Vec<usize>) = slice
                .iter()
                .copied()
                .partition(|&i| self.instructions[i].tag() == InstructionKindTag::CompleteReplay);
            slice.clear();
            slice.extend(rest);
            slice.extend(completes);
        }
    }
}
