// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test Case Completer: reassembles command outputs into finished test
//! cases, in dependency order, exactly once each.

use crate::command::Command;
use crate::errors::InvariantViolation;
use crate::graph::{DependencyGraph, NodeId, NodeState};
use crate::test_case::{TestCase, TestCaseId};
use crate::test_output::CommandOutput;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Consumes a [`crate::queue::CommandQueue`]'s output stream alongside a
/// [`DependencyGraph`]'s sealed signal, and emits each test case on
/// `finished` exactly once, as soon as its [`TestCase::is_finished`]
/// predicate becomes true.
pub struct TestCaseCompleter {
    referring_test_cases: IndexMap<Command, Vec<TestCase>>,
    outputs: HashMap<Command, CommandOutput>,
    remaining: HashSet<TestCaseId>,
    emitted: HashSet<TestCaseId>,
}

impl TestCaseCompleter {
    pub fn new(referring_test_cases: IndexMap<Command, Vec<TestCase>>, test_cases: &[TestCase]) -> Self {
        Self {
            referring_test_cases,
            outputs: HashMap::new(),
            remaining: test_cases.iter().map(TestCase::id).collect(),
            emitted: HashSet::new(),
        }
    }

    /// Drives completion to its end: consumes `outputs_rx` (subscribed
    /// from [`crate::queue::CommandQueue::subscribe_outputs`] before the
    /// queue was handed off to its own `run` loop) and the graph's sealed
    /// signal, sending each finished test case on `finished_tx` as soon
    /// as it's ready. Returns once the graph is sealed and `remaining` is
    /// empty.
    ///
    /// Takes the graph behind the same shared lock
    /// [`crate::queue::CommandQueue::run`] holds: each output is only
    /// read once the queue's write guard for the transition it reports
    /// has already been dropped, so the `debug_assert!` in
    /// [`Self::on_output`] never races the state it checks.
    pub async fn run(
        mut self,
        graph: Arc<RwLock<DependencyGraph>>,
        mut outputs_rx: broadcast::Receiver<(NodeId, CommandOutput)>,
        finished_tx: mpsc::UnboundedSender<TestCase>,
    ) {
        let mut sealed_rx = graph.read().await.subscribe_sealed();

        loop {
            tokio::select! {
                result = outputs_rx.recv() => {
                    match result {
                        Ok((node, output)) => {
                            let g = graph.read().await;
                            self.on_output(&g, node, output, &finished_tx);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sealed_rx.changed() => {}
            }

            if *sealed_rx.borrow() && self.remaining.is_empty() {
                break;
            }
        }
    }

    fn on_output(
        &mut self,
        graph: &DependencyGraph,
        node: NodeId,
        output: CommandOutput,
        finished_tx: &mpsc::UnboundedSender<TestCase>,
    ) {
        let command = graph.command(node).clone();
        debug_assert!(matches!(
            graph.state(node),
            NodeState::Successful | NodeState::Failed
        ));

        self.outputs.insert(command.clone(), output);

        let Some(cases) = self.referring_test_cases.get(&command) else {
            return;
        };

        for test_case in cases.clone() {
            if test_case.is_finished(&self.outputs) {
                self.emit(test_case, finished_tx);
            }
        }
    }

    fn emit(&mut self, test_case: TestCase, finished_tx: &mpsc::UnboundedSender<TestCase>) {
        let id = test_case.id();
        if !self.remaining.remove(&id) {
            // Either never tracked (caller bug) or already emitted.
            if self.emitted.contains(&id) {
                InvariantViolation::DoubleEmitTestCase {
                    display_name: test_case.display_name().to_string(),
                }
                .fatal();
            }
            return;
        }
        self.emitted.insert(id);
        let _ = finished_tx.send(test_case);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::test_case::{ConfigHandle, Expectations};
    use std::time::Duration;

    fn cmd(name: &str) -> Command {
        Command::builder("/bin/true", name).build()
    }

    fn make_test_case(name: &str, commands: Vec<Command>) -> TestCase {
        TestCase::new(
            name.to_string(),
            commands,
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn single_command_test_case_emits_once_its_output_arrives() {
        let mut graph = DependencyGraph::new();
        let c = cmd("only");
        let node = graph.add(c.clone(), &[], false);
        graph.change_state(node, NodeState::Waiting);
        graph.change_state(node, NodeState::Enqueuing);
        graph.change_state(node, NodeState::Processing);
        graph.change_state(node, NodeState::Successful);

        let tc = make_test_case("t", vec![c.clone()]);
        let mut referring = IndexMap::new();
        referring.insert(c, vec![tc.clone()]);

        let mut completer = TestCaseCompleter::new(referring, &[tc]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        completer.on_output(
            &graph,
            node,
            CommandOutput::success(Duration::from_millis(1)),
            &tx,
        );

        let emitted = rx.try_recv().unwrap();
        assert_eq!(emitted.display_name(), "t");
        assert!(completer.remaining.is_empty());
    }

    #[test]
    #[should_panic(expected = "scheduler invariant violated")]
    fn double_emit_is_fatal() {
        let mut graph = DependencyGraph::new();
        let c = cmd("only");
        let node = graph.add(c.clone(), &[], false);
        graph.change_state(node, NodeState::Waiting);
        graph.change_state(node, NodeState::Enqueuing);
        graph.change_state(node, NodeState::Processing);
        graph.change_state(node, NodeState::Successful);

        let tc = make_test_case("t", vec![c.clone()]);
        let mut referring = IndexMap::new();
        referring.insert(c, vec![tc.clone()]);

        let mut completer = TestCaseCompleter::new(referring, &[tc.clone()]);
        let (tx, _rx) = mpsc::unbounded_channel();
        completer.emit(tc.clone(), &tx);
        completer.emit(tc, &tx);
    }

    #[test]
    fn test_cases_sharing_a_display_name_both_emit() {
        let a = cmd("a");
        let b = cmd("b");
        let tc1 = make_test_case("same-name", vec![a.clone()]);
        let tc2 = make_test_case("same-name", vec![b.clone()]);
        assert_ne!(tc1.id(), tc2.id());

        let mut referring = IndexMap::new();
        referring.insert(a, vec![tc1.clone()]);
        referring.insert(b, vec![tc2.clone()]);

        let mut completer = TestCaseCompleter::new(referring, &[tc1.clone(), tc2.clone()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        completer.emit(tc1, &tx);
        completer.emit(tc2, &tx);

        assert!(completer.remaining.is_empty());
        assert_eq!(rx.try_recv().unwrap().display_name(), "same-name");
        assert_eq!(rx.try_recv().unwrap().display_name(), "same-name");
    }
}
