// Copyright 2026 the Replay Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance test crate for `replay_tape` and `trace_graph`.
//!
//! All content lives in `tests/`.
