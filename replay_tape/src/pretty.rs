// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable template dumps.
//!
//! The format is stable and assembly-like (one instruction per line) so
//! tests can assert on it.

use core::fmt;

use crate::template::PhysicalTemplate;

/// Lazily formatted dump of a template.
pub struct TemplateDump<'a> {
    template: &'a PhysicalTemplate,
}

impl PhysicalTemplate {
    /// Returns a [`fmt::Display`] view of the template.
    #[must_use]
    pub fn dump(&self) -> TemplateDump<'_> {
        TemplateDump { template: self }
    }
}

impl fmt::Display for TemplateDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tpl = self.template;
        writeln!(
            f,
            "template: {} events, {} instructions, {}",
            tpl.events().len(),
            tpl.instructions().len(),
            if tpl.is_recording() {
                "recording"
            } else if tpl.is_replayable() {
                "replayable"
            } else {
                "not replayable"
            }
        )?;
        if tpl.slices().is_empty() {
            for inst in tpl.instructions() {
                writeln!(f, "  {inst}")?;
            }
        } else {
            for (slice_index, slice) in tpl.slices().iter().enumerate() {
                writeln!(f, "  slice {slice_index}:")?;
                for &index in slice {
                    writeln!(f, "    {}", tpl.instructions()[index])?;
                }
            }
        }
        for (key, crossing) in tpl.frontiers() {
            writeln!(f, "  frontier: events[{key}] -> events[{crossing}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::ToString;

    use crate::ids::ApEvent;
    use crate::template::PhysicalTemplate;
    use crate::test_utils::MockOp;

    #[test]
    fn dump_is_line_per_instruction() {
        let op = MockOp::new(0);
        let mut tpl = PhysicalTemplate::new(ApEvent(1), 1);
        tpl.record_get_term_event(&op);

        let dump = tpl.dump().to_string();
        assert!(dump.starts_with("template: 2 events, 2 instructions, recording\n"));
        assert!(dump.contains("  events[0] = fence_completion\n"));
        assert!(dump.contains("  events[1] = op0.completion()\n"));
    }
}
