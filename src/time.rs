// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small stopwatch for tracking how long a command takes to run.
//!
//! Ground: `nextest-runner`'s `time/stopwatch.rs`, trimmed down since
//! harness-core has no job-control pause/resume concept — commands here
//! run to completion, timeout, or are killed, with nothing in spec.md
//! analogous to a SIGTSTP/SIGCONT pause.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Starts a new stopwatch, anchored to both a realtime clock (for
/// reporting a wall-clock start time) and a monotonic clock (for
/// measuring elapsed duration).
pub fn stopwatch() -> Stopwatch {
    Stopwatch {
        start_time: Local::now(),
        instant: Instant::now(),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl Stopwatch {
    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }
}
