// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The command scheduler and executor core of a language test harness.
//!
//! Given a set of test suites, [`enqueuer::TestCaseEnqueuer`] expands
//! them into a [`graph::DependencyGraph`] of deduplicated [`command::Command`]s.
//! [`command_enqueuer::CommandEnqueuer`] promotes graph nodes as their
//! dependencies settle; [`queue::CommandQueue`] pulls promoted nodes
//! under a bounded concurrency cap and dispatches them through
//! [`executor::CommandExecutor`] to either a one-shot [`process::RunningProcess`]
//! or a persistent [`batch::BatchRunnerPool`] worker.
//! [`completer::TestCaseCompleter`] reassembles finished command outputs
//! back into [`test_case::TestCase`]s, in dependency order, each emitted
//! exactly once. [`runner::HarnessRunner`] wires all of the above into one
//! pipeline and reports progress through a [`runner::HarnessListener`].
//!
//! Test discovery, expectation parsing, browser automation, device
//! interaction, and CLI assembly are out of scope: this crate only names
//! the seams (`enqueuer::SuiteSource`, `executor::BrowserController`,
//! `executor::DevicePool`, `executor::ScriptRunner`, `process::FreshnessChecker`)
//! that an embedding application implements.

pub mod batch;
pub mod command;
pub mod command_enqueuer;
pub mod completer;
pub mod config;
pub mod enqueuer;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod output_log;
pub mod process;
pub mod queue;
pub mod runner;
pub mod test_case;
pub mod test_output;
pub mod time;
