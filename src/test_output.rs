// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`CommandOutput`]: the result of running one [`crate::command::Command`]
//! once.

use bytes::Bytes;
use std::time::Duration;

/// Non-UTF-8 stdout/stderr that was otherwise a successful exit gets its
/// exit code overridden to this sentinel, forcing the command (and hence
/// the test case) to fail. See spec.md §6.
pub const NON_UTF8_EXIT_SENTINEL: i32 = 0xFFFD;

/// How a process that didn't exit with code 0 actually went down. This is
/// purely diagnostic: it does not change [`CommandOutput::successful`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortStatus {
    /// Unix: the process was killed by a signal.
    Signal(i32),
    /// Windows: the process exited with an NTSTATUS-shaped negative code.
    WindowsNtStatus(i32),
}

/// The result of running one [`crate::command::Command`] once.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub duration: Duration,
    pub pid: Option<u32>,
    pub compilation_skipped: bool,
    pub diagnostics: Vec<String>,
    pub abort_status: Option<AbortStatus>,
}

impl CommandOutput {
    /// A plain successful result, for tests and for the "output file is
    /// up to date" skip path.
    pub fn success(duration: Duration) -> Self {
        Self {
            exit_code: 0,
            timed_out: false,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            duration,
            pid: None,
            compilation_skipped: false,
            diagnostics: Vec::new(),
            abort_status: None,
        }
    }

    pub fn failure(exit_code: i32, duration: Duration) -> Self {
        Self {
            exit_code,
            ..Self::success(duration)
        }
    }

    /// Used to record a spawn failure: no process ever ran, so there is
    /// no meaningful exit code other than the conventional -1.
    pub fn spawn_failure(diagnostic: String) -> Self {
        Self {
            exit_code: -1,
            timed_out: false,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            duration: Duration::ZERO,
            pid: None,
            compilation_skipped: false,
            diagnostics: vec![diagnostic],
            abort_status: None,
        }
    }

    /// The predicate the dependency graph uses to decide whether to mark
    /// the node `successful` (vs. `failed`).
    pub fn successful(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// The predicate the command queue uses to decide whether dependents
    /// with a plain (non-timing) dependency may proceed. Currently
    /// identical to `successful`, kept as a separate method because the
    /// two concepts are conceptually distinct in spec.md §3/§4.5, and a
    /// future policy (e.g. "leaked file handles still allow dependents to
    /// run") would only need to change this one.
    pub fn can_run_dependent_commands(&self) -> bool {
        self.successful()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::test_case::test_case;

    #[test]
    fn success_is_successful_and_unblocks_dependents() {
        let out = CommandOutput::success(Duration::from_millis(5));
        assert!(out.successful());
        assert!(out.can_run_dependent_commands());
    }

    #[test]
    fn nonzero_exit_is_not_successful() {
        let out = CommandOutput::failure(1, Duration::from_millis(5));
        assert!(!out.successful());
    }

    #[test]
    fn timeout_is_not_successful_even_with_zero_exit() {
        let mut out = CommandOutput::success(Duration::from_secs(1));
        out.timed_out = true;
        assert!(!out.successful());
    }

    #[test_case(0, false => true; "zero exit, not timed out")]
    #[test_case(1, false => false; "nonzero exit")]
    #[test_case(0, true => false; "zero exit but timed out")]
    #[test_case(NON_UTF8_EXIT_SENTINEL, false => false; "non-utf8 sentinel exit")]
    fn successful_matrix(exit_code: i32, timed_out: bool) -> bool {
        let mut out = CommandOutput::failure(exit_code, Duration::from_millis(1));
        out.timed_out = timed_out;
        out.successful()
    }
}
