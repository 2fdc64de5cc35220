// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner configuration.
//!
//! Platform probes, caps, and timeouts are injected here rather than read
//! directly by the components that use them, per the design note in
//! spec.md §9 ("global-ish state ... injected as configuration, not read
//! directly; this keeps the core testable"). The shape mirrors
//! `nextest-runner`'s `TestRunnerBuilder` (`src/runner/imp.rs`): a plain
//! struct with sensible defaults, `Deserialize`-able so embedding
//! applications can load it from a config file if they want to, though
//! harness-core itself never reads one (config-file parsing is a CLI
//! concern, out of scope per spec.md §1).

use serde::Deserialize;
use std::time::Duration;

/// Paths to the platform-specific stack-capture tools used by
/// [`crate::process`] on timeout. Defaults match spec.md §4.6.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StackTraceProbe {
    /// Linux: `eu-stack -p PID`.
    pub linux_eu_stack: String,
    /// macOS: `/usr/bin/sample PID 1 4000 -mayDie`.
    pub macos_sample: String,
    /// Windows: `cdb.exe -p PID -c "!uniqstack;qd"`, resolved from the
    /// configured Windows SDK path.
    pub windows_cdb: String,
    /// Unix descendant discovery: `pgrep -P PID`.
    pub unix_pgrep: String,
    /// Windows descendant discovery:
    /// `wmic process where ParentProcessId=PID get ProcessId`.
    pub windows_wmic: String,
}

impl Default for StackTraceProbe {
    fn default() -> Self {
        Self {
            linux_eu_stack: "eu-stack".to_string(),
            macos_sample: "/usr/bin/sample".to_string(),
            windows_cdb: "cdb.exe".to_string(),
            unix_pgrep: "pgrep".to_string(),
            windows_wmic: "wmic".to_string(),
        }
    }
}

/// Knobs for the scheduler and executor. Construct with
/// [`RunnerConfig::default`] and override fields, or via
/// [`serde`]-deserializing a config file in whatever format the embedding
/// application prefers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Total in-flight child processes across all commands.
    pub max_processes: usize,
    /// In-flight browser-launch commands specifically, bounded
    /// separately from `max_processes`.
    pub max_browser_processes: usize,
    /// The repeat count to use for test cases that don't specify their
    /// own. Per spec.md §8, a repeat count of 0 is rejected rather than
    /// silently treated as 1 — see [`crate::enqueuer`].
    pub default_repeat: u32,
    /// How often (in jobs) to forcibly recycle a batch runner to bound
    /// memory leaks in known-leaky backends. spec.md §4.7 pins this at
    /// 100 for the affected runner types.
    pub batch_recycle_interval: u32,
    /// `MAX_STDIO_DELAY`: the grace window after a one-shot child's exit
    /// code resolves, during which stdio is still allowed to drain.
    pub max_stdio_delay: Duration,
    /// Delay before re-ticking the command queue after a browser-cap
    /// requeue.
    pub browser_cap_retry_delay: Duration,
    /// How long the queue may go with nothing finishing before the
    /// inactivity watchdog dumps diagnostic state.
    pub watchdog_inactivity_timeout: Duration,
    /// Whether dart2js/analyzer/dartdevc/dartdevk/fasta compiles should
    /// be routed to batch runners (kernel compiles are always batched
    /// regardless of this flag).
    pub batch_mode: bool,
    pub stack_trace_probe: StackTraceProbe,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_processes: num_cpus_fallback(),
            max_browser_processes: 1,
            default_repeat: 1,
            batch_recycle_interval: 100,
            max_stdio_delay: Duration::from_secs(1),
            browser_cap_retry_delay: Duration::from_millis(100),
            watchdog_inactivity_timeout: Duration::from_secs(10 * 60),
            batch_mode: true,
            stack_trace_probe: StackTraceProbe::default(),
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_caps() {
        let cfg = RunnerConfig::default();
        assert!(cfg.max_processes >= 1);
        assert_eq!(cfg.max_browser_processes, 1);
        assert_eq!(cfg.default_repeat, 1);
        assert_eq!(cfg.batch_recycle_interval, 100);
    }
}
