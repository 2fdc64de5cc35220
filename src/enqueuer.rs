// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expands test suites into test cases, deduplicates commands, wires
//! per-test dependency chains, and supports repeat expansion.

use crate::command::Command;
use crate::config::RunnerConfig;
use crate::graph::{DependencyGraph, NodeId};
use crate::test_case::{ConfigHandle, EmptyCommandsError, Expectations, TestCase};
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;

/// A named collection of test cases, as produced by test discovery.
/// harness-core never constructs one of these itself — it's handed one by
/// the embedding application.
#[derive(Clone, Debug)]
pub struct TestSuite {
    pub name: String,
}

/// One test case as reported by test discovery, before repeat expansion
/// or graph wiring.
#[derive(Clone, Debug)]
pub struct TestCaseSpec {
    pub display_name: String,
    pub commands: Vec<Command>,
    pub configuration: ConfigHandle,
    pub expectations: Expectations,
    pub intrinsic_expectations: Expectations,
    pub base_timeout: Duration,
    /// Overrides [`RunnerConfig::default_repeat`] for this test case
    /// specifically, if set.
    pub repeat: Option<u32>,
}

/// Test discovery and parsing of expectations are out of scope for
/// harness-core (spec.md §1); this trait is the seam an embedding
/// application implements to supply test cases per suite.
pub trait SuiteSource {
    fn test_cases(&self, suite: &TestSuite) -> Vec<TestCaseSpec>;
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    EmptyCommands(#[from] EmptyCommandsError),
    #[error("test case `{0}` requested a repeat count of 0, which is rejected")]
    RepeatCountZero(String),
}

/// Expands test suites into test cases, deduplicating commands across the
/// whole run and wiring per-test (and per-repeat-copy) dependency chains.
///
/// Owns the command-to-node mapping (for dedup) and the command-to-
/// referring-test-cases multimap, per spec.md §3's ownership rules. Once
/// every suite has been enqueued, [`Self::finish`] seals the graph and
/// hands both maps, plus the full list of test cases, to the caller (in
/// practice, whatever wires up the [`crate::completer::TestCaseCompleter`]).
pub struct TestCaseEnqueuer {
    graph: DependencyGraph,
    node_by_command: IndexMap<Command, NodeId>,
    referring_test_cases: IndexMap<Command, Vec<TestCase>>,
    test_cases: Vec<TestCase>,
}

impl TestCaseEnqueuer {
    pub fn new() -> Self {
        Self {
            graph: DependencyGraph::new(),
            node_by_command: IndexMap::new(),
            referring_test_cases: IndexMap::new(),
            test_cases: Vec::new(),
        }
    }

    /// Expands every test case produced by `source` for `suite` by the
    /// configured repeat count, dedupes commands against everything
    /// enqueued so far (including from other suites), and wires
    /// dependency edges.
    pub fn enqueue_suite(
        &mut self,
        suite: &TestSuite,
        source: &dyn SuiteSource,
        config: &RunnerConfig,
    ) -> Result<(), EnqueueError> {
        for spec in source.test_cases(suite) {
            let repeat = spec.repeat.unwrap_or(config.default_repeat);
            if repeat == 0 {
                return Err(EnqueueError::RepeatCountZero(spec.display_name));
            }
            self.enqueue_test_case_spec(spec, repeat)?;
        }
        Ok(())
    }

    fn enqueue_test_case_spec(
        &mut self,
        spec: TestCaseSpec,
        repeat: u32,
    ) -> Result<(), EnqueueError> {
        let mut previous_copy_last_node: Option<NodeId> = None;

        for copy in 0..repeat {
            let mut commands = Vec::with_capacity(spec.commands.len());
            let mut previous_node_in_copy: Option<NodeId> = None;

            for (k, command) in spec.commands.iter().enumerate() {
                let command = command.indexed_copy(copy);

                let deps: Vec<NodeId> = match (k, previous_node_in_copy) {
                    (0, _) => previous_copy_last_node.into_iter().collect(),
                    (_, Some(prev)) => vec![prev],
                    (_, None) => unreachable!("non-first command always has a previous node"),
                };
                // Only the first command of a repeat copy beyond the
                // first carries a timing dependency (on the previous
                // copy's last command); within a copy, dependencies are
                // plain success-gated edges.
                let timing_dependency = k == 0 && previous_copy_last_node.is_some();

                let node = *self
                    .node_by_command
                    .entry(command.clone())
                    .or_insert_with(|| self.graph.add(command.clone(), &deps, timing_dependency));

                commands.push(command);
                previous_node_in_copy = Some(node);
            }

            previous_copy_last_node = previous_node_in_copy;

            let display_name = if repeat > 1 {
                format!("{} (copy {copy})", spec.display_name)
            } else {
                spec.display_name.clone()
            };

            let test_case = TestCase::new(
                display_name,
                commands,
                spec.configuration.clone(),
                spec.expectations,
                spec.intrinsic_expectations,
                spec.base_timeout,
            )?;

            for command in test_case.commands() {
                self.referring_test_cases
                    .entry(command.clone())
                    .or_default()
                    .push(test_case.clone());
            }
            self.test_cases.push(test_case);
        }

        Ok(())
    }

    /// Seals the graph (no further [`Self::enqueue_suite`] calls are
    /// valid after this) and hands ownership of the graph, the
    /// command-to-referring-test-cases multimap, and the flat list of
    /// test cases to the caller.
    pub fn finish(
        mut self,
    ) -> (
        DependencyGraph,
        IndexMap<Command, Vec<TestCase>>,
        Vec<TestCase>,
    ) {
        self.graph.seal();
        (self.graph, self.referring_test_cases, self.test_cases)
    }
}

impl Default for TestCaseEnqueuer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::graph::NodeState;

    fn cmd(name: &str) -> Command {
        Command::builder("/bin/true", name).build()
    }

    struct FixedSource(Vec<TestCaseSpec>);
    impl SuiteSource for FixedSource {
        fn test_cases(&self, _suite: &TestSuite) -> Vec<TestCaseSpec> {
            self.0.clone()
        }
    }

    fn spec(name: &str, commands: Vec<Command>, repeat: Option<u32>) -> TestCaseSpec {
        TestCaseSpec {
            display_name: name.to_string(),
            commands,
            configuration: ConfigHandle::from("default"),
            expectations: Expectations::PASS,
            intrinsic_expectations: Expectations::empty(),
            base_timeout: Duration::from_secs(60),
            repeat,
        }
    }

    #[test]
    fn shared_compile_command_becomes_one_node() {
        let compile_a = cmd("compileA");
        let run_a1 = cmd("runA1");
        let run_a2 = cmd("runA2");

        let source = FixedSource(vec![
            spec("t1", vec![compile_a.clone(), run_a1.clone()], Some(1)),
            spec("t2", vec![compile_a.clone(), run_a2.clone()], Some(1)),
        ]);

        let mut enq = TestCaseEnqueuer::new();
        let config = RunnerConfig::default();
        enq.enqueue_suite(&TestSuite { name: "s".into() }, &source, &config)
            .unwrap();

        let (graph, referring, test_cases) = enq.finish();
        assert_eq!(graph.nodes().count(), 3);
        assert_eq!(test_cases.len(), 2);
        assert_eq!(referring.get(&compile_a).map(Vec::len), Some(2));
        assert!(graph.is_sealed());
    }

    #[test]
    fn single_command_test_case_has_no_dependency_edge() {
        let only = cmd("only");
        let source = FixedSource(vec![spec("t1", vec![only.clone()], Some(1))]);
        let mut enq = TestCaseEnqueuer::new();
        let config = RunnerConfig::default();
        enq.enqueue_suite(&TestSuite { name: "s".into() }, &source, &config)
            .unwrap();
        let (graph, _, _) = enq.finish();
        let node = graph.nodes().next().unwrap();
        assert_eq!(graph.dependencies(node).count(), 0);
    }

    #[test]
    fn repeat_zero_is_rejected() {
        let source = FixedSource(vec![spec("t1", vec![cmd("a")], Some(0))]);
        let mut enq = TestCaseEnqueuer::new();
        let config = RunnerConfig::default();
        let err = enq
            .enqueue_suite(&TestSuite { name: "s".into() }, &source, &config)
            .unwrap_err();
        assert!(matches!(err, EnqueueError::RepeatCountZero(_)));
    }

    #[test]
    fn repeat_copies_are_chained_with_timing_dependencies() {
        let c1 = cmd("c1");
        let c2 = cmd("c2");
        let source = FixedSource(vec![spec("t1", vec![c1, c2], Some(3))]);
        let mut enq = TestCaseEnqueuer::new();
        let config = RunnerConfig::default();
        enq.enqueue_suite(&TestSuite { name: "s".into() }, &source, &config)
            .unwrap();
        let (graph, _, test_cases) = enq.finish();

        assert_eq!(test_cases.len(), 3);
        assert_eq!(graph.nodes().count(), 6);

        // Copy 1's first command (c1-copy1) depends on copy 0's last
        // command (c2-copy0) with a timing dependency.
        let copy1_first_node = test_cases[1].commands()[0].clone();
        let node = graph
            .nodes()
            .find(|&n| *graph.command(n) == copy1_first_node)
            .unwrap();
        let deps: Vec<_> = graph.dependencies(node).collect();
        assert_eq!(deps.len(), 1);
        assert!(graph.is_timing_dependency(node));
    }

    #[test]
    fn graph_is_sealed_after_finish() {
        let source = FixedSource(vec![spec("t1", vec![cmd("a")], Some(1))]);
        let mut enq = TestCaseEnqueuer::new();
        let config = RunnerConfig::default();
        enq.enqueue_suite(&TestSuite { name: "s".into() }, &source, &config)
            .unwrap();
        let (graph, _, _) = enq.finish();
        assert!(graph.is_sealed());
        assert_eq!(graph.state_count(NodeState::Initialized), 1);
    }
}
