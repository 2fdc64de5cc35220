// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`TestCase`]: a named, ordered sequence of commands plus its expected
//! outcomes.

use crate::command::Command;
use crate::test_output::CommandOutput;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

bitflags! {
    /// The small enum of outcomes a test case can be expected to produce,
    /// represented as a bitmask since a test case's *intrinsic*
    /// expectations (derived from source metadata, e.g. a `@compile-error`
    /// annotation) can name more than one acceptable outcome at once.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Expectations: u16 {
        const PASS                = 1 << 0;
        const FAIL                = 1 << 1;
        const CRASH               = 1 << 2;
        const TIMEOUT             = 1 << 3;
        const COMPILE_TIME_ERROR  = 1 << 4;
        const RUNTIME_ERROR       = 1 << 5;
        const STATIC_WARNING      = 1 << 6;
        const SYNTAX_ERROR        = 1 << 7;
        const SKIP                = 1 << 8;
        const SKIP_BY_DESIGN      = 1 << 9;
        const SLOW                = 1 << 10;
        const EXTRA_SLOW          = 1 << 11;
    }
}

impl Expectations {
    /// A test case's computed result satisfies its expectations iff the
    /// bit for the observed outcome is set here. §7 of the design: a
    /// user-visible failure is a finished test case whose computed
    /// result does not satisfy any expected outcome.
    pub fn is_satisfied_by(&self, observed: Expectations) -> bool {
        self.intersects(observed)
    }
}

#[derive(Debug, Error)]
#[error("test case `{0}` was constructed with an empty command list")]
pub struct EmptyCommandsError(pub String);

/// An opaque handle to whatever per-run configuration (target triple,
/// compiler mode, optimization level, ...) a test case is running under.
/// Configuration assembly is out of scope for harness-core; this handle
/// exists purely so dependent commands can be told apart when the same
/// logical test runs under multiple configurations.
pub type ConfigHandle = std::sync::Arc<str>;

/// A unique identity for a [`TestCase`], distinct from its
/// [`TestCase::display_name`]. Two test cases can legitimately share a
/// display name — the same logical test run under different
/// [`ConfigHandle`]s, or simply listed twice by a [`crate::enqueuer::SuiteSource`]
/// — so anything that must tell test cases apart (e.g. "has this one
/// already been emitted") needs this instead of the name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TestCaseId(u64);

fn next_test_case_id() -> TestCaseId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    TestCaseId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A display name, an ordered non-empty list of [`Command`]s, a
/// configuration handle, and the set of outcomes this test case is
/// expected to produce.
#[derive(Clone, Debug)]
pub struct TestCase {
    id: TestCaseId,
    display_name: String,
    commands: Vec<Command>,
    configuration: ConfigHandle,
    expectations: Expectations,
    intrinsic_expectations: Expectations,
    base_timeout: Duration,
}

impl TestCase {
    pub fn new(
        display_name: impl Into<String>,
        commands: Vec<Command>,
        configuration: ConfigHandle,
        expectations: Expectations,
        intrinsic_expectations: Expectations,
        base_timeout: Duration,
    ) -> Result<Self, EmptyCommandsError> {
        let display_name = display_name.into();
        if commands.is_empty() {
            return Err(EmptyCommandsError(display_name));
        }
        Ok(Self {
            id: next_test_case_id(),
            display_name,
            commands,
            configuration,
            expectations,
            intrinsic_expectations,
            base_timeout,
        })
    }

    pub fn id(&self) -> TestCaseId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn configuration(&self) -> &ConfigHandle {
        &self.configuration
    }

    pub fn expectations(&self) -> Expectations {
        self.expectations
    }

    pub fn intrinsic_expectations(&self) -> Expectations {
        self.intrinsic_expectations
    }

    pub fn last_command(&self) -> &Command {
        self.commands.last().expect("commands is non-empty")
    }

    /// The effective timeout for every command in this test case.
    ///
    /// `base_timeout * 4` if `SLOW` is expected, `* 8` if `EXTRA_SLOW` is
    /// expected. If both are set (an unusual but not forbidden
    /// combination), extra-slow wins, since it is the stronger claim
    /// about how long the test legitimately needs.
    pub fn timeout(&self) -> Duration {
        if self.expectations.contains(Expectations::EXTRA_SLOW) {
            self.base_timeout * 8
        } else if self.expectations.contains(Expectations::SLOW) {
            self.base_timeout * 4
        } else {
            self.base_timeout
        }
    }

    /// True iff the last command has a recorded output, or any earlier
    /// command failed (in which case the test case can never reach its
    /// last command and is done for purposes of reporting).
    pub fn is_finished(&self, outputs: &HashMap<Command, CommandOutput>) -> bool {
        if outputs.contains_key(self.last_command()) {
            return true;
        }
        self.commands[..self.commands.len() - 1]
            .iter()
            .any(|c| outputs.get(c).is_some_and(|o| !o.successful()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn cmd(name: &str) -> Command {
        Command::builder("/bin/true", name).build()
    }

    #[test]
    fn rejects_empty_commands() {
        let err = TestCase::new(
            "t",
            vec![],
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.0, "t");
    }

    #[test]
    fn slow_and_extra_slow_multiply_base_timeout() {
        let base = Duration::from_secs(10);
        let make = |exp| {
            TestCase::new(
                "t",
                vec![cmd("a")],
                ConfigHandle::from("default"),
                exp,
                Expectations::empty(),
                base,
            )
            .unwrap()
        };
        assert_eq!(make(Expectations::PASS).timeout(), base);
        assert_eq!(make(Expectations::SLOW).timeout(), base * 4);
        assert_eq!(make(Expectations::EXTRA_SLOW).timeout(), base * 8);
        assert_eq!(
            make(Expectations::SLOW | Expectations::EXTRA_SLOW).timeout(),
            base * 8
        );
    }

    #[test]
    fn single_command_is_finished_once_it_has_output() {
        let a = cmd("a");
        let tc = TestCase::new(
            "t",
            vec![a.clone()],
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(1),
        )
        .unwrap();

        let empty = HashMap::new();
        assert!(!tc.is_finished(&empty));

        let outputs = maplit::hashmap! {
            a => CommandOutput::success(Duration::from_millis(1)),
        };
        assert!(tc.is_finished(&outputs));
    }

    #[test]
    fn early_failure_finishes_the_test_case() {
        let compile = cmd("compile");
        let run = cmd("run");
        let tc = TestCase::new(
            "t",
            vec![compile.clone(), run],
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(1),
        )
        .unwrap();

        let outputs = maplit::hashmap! {
            compile => CommandOutput::failure(1, Duration::from_millis(1)),
        };
        assert!(tc.is_finished(&outputs));
    }
}
