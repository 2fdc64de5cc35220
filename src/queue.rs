// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command Queue: the bounded-concurrency scheduler tying the graph, the
//! command enqueuer, and the executor together into a running loop.

use crate::command::Command;
use crate::command_enqueuer::CommandEnqueuer;
use crate::config::RunnerConfig;
use crate::errors::InvariantViolation;
use crate::executor::CommandExecutor;
use crate::graph::{ChangeEvent, DependencyGraph, NodeId, NodeState};
use crate::test_case::TestCase;
use crate::test_output::CommandOutput;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

/// Computes the timeout for a command as the max over every test case
/// that references it, per spec.md §9. A command with no referring test
/// case is a bug elsewhere in the pipeline, not a valid zero timeout.
fn resolve_timeout(command: &Command, referring: &IndexMap<Command, Vec<TestCase>>) -> Duration {
    match referring.get(command) {
        Some(cases) if !cases.is_empty() => {
            cases.iter().map(TestCase::timeout).max().expect("non-empty")
        }
        _ => InvariantViolation::NoReferringTestCase {
            command: command.to_string(),
        }
        .fatal(),
    }
}

/// The bounded-concurrency limiter that drains the dependency graph: pulls
/// ready commands under the process/browser caps, dispatches them to the
/// executor, and reports outcomes back to the graph.
///
/// This is the one component that actually drives the event loop
/// described in spec.md §5: everything else (the enqueuer, the command
/// enqueuer, the executor) is passive, reacting only when the queue calls
/// into it or polls its event streams.
pub struct CommandQueue {
    max_processes: usize,
    max_browser_processes: usize,
    browser_cap_retry_delay: Duration,
    watchdog_inactivity_timeout: Duration,
    ready: VecDeque<NodeId>,
    total_in_flight: usize,
    browser_in_flight: usize,
    outputs_tx: broadcast::Sender<(NodeId, CommandOutput)>,
    done_tx: watch::Sender<bool>,
}

impl CommandQueue {
    pub fn new(config: &RunnerConfig) -> Self {
        let (outputs_tx, _) = broadcast::channel(1024);
        let (done_tx, _) = watch::channel(false);
        Self {
            max_processes: config.max_processes,
            max_browser_processes: config.max_browser_processes,
            browser_cap_retry_delay: config.browser_cap_retry_delay,
            watchdog_inactivity_timeout: config.watchdog_inactivity_timeout,
            ready: VecDeque::new(),
            total_in_flight: 0,
            browser_in_flight: 0,
            outputs_tx,
            done_tx,
        }
    }

    pub fn subscribe_outputs(&self) -> broadcast::Receiver<(NodeId, CommandOutput)> {
        self.outputs_tx.subscribe()
    }

    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Drives the graph to completion: promotes ready nodes, dispatches
    /// them to `executor` under the configured caps, and feeds outcomes
    /// back to the graph, until the graph is sealed, nothing is ready or
    /// in flight, and no node remains in a pre-terminal state.
    ///
    /// Takes the graph behind a shared lock rather than by value: the
    /// completer reads the same graph concurrently (to look up each
    /// node's command and, after this loop returns, its terminal state),
    /// so ownership can't be threaded through a single owner the way a
    /// non-concurrent pipeline would. Each access here takes the lock for
    /// only as long as the single graph call requires.
    pub async fn run(
        mut self,
        graph: Arc<RwLock<DependencyGraph>>,
        executor: CommandExecutor,
        referring_test_cases: IndexMap<Command, Vec<TestCase>>,
    ) {
        let mut command_enqueuer = CommandEnqueuer::new(&*graph.read().await);
        let mut promotion_rx = graph.read().await.subscribe_changed();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(NodeId, CommandOutput)>();

        let mut watchdog = Box::pin(tokio::time::sleep(self.watchdog_inactivity_timeout));
        let mut browser_retry = Box::pin(tokio::time::sleep(Duration::from_secs(3600)));
        let mut browser_retry_armed = false;

        loop {
            {
                let mut g = graph.write().await;
                command_enqueuer.tick(&mut g);
                self.absorb_enqueued(&mut g, &mut promotion_rx);
            }

            let deferred_browser = {
                let mut g = graph.write().await;
                self.dispatch(&mut g, &executor, &referring_test_cases, &result_tx)
            };
            if deferred_browser && !browser_retry_armed {
                browser_retry
                    .as_mut()
                    .reset(tokio::time::Instant::now() + self.browser_cap_retry_delay);
                browser_retry_armed = true;
            }

            if self.is_shutdown(&*graph.read().await) {
                break;
            }

            tokio::select! {
                Some((node, output)) = result_rx.recv() => {
                    self.on_command_finished(&mut *graph.write().await, node, output);
                    watchdog.as_mut().reset(tokio::time::Instant::now() + self.watchdog_inactivity_timeout);
                }
                _ = &mut browser_retry, if browser_retry_armed => {
                    browser_retry_armed = false;
                }
                () = &mut watchdog => {
                    self.dump_diagnostics(&*graph.read().await);
                    watchdog.as_mut().reset(tokio::time::Instant::now() + self.watchdog_inactivity_timeout);
                }
            }
        }

        executor.cleanup().await;
        let _ = self.done_tx.send(true);
    }

    /// Drains the `changed` stream for transitions into `enqueuing`,
    /// claims each such node for the queue (transitioning it to
    /// `processing`), and places it in the ready queue: at the front if
    /// it has dependencies (follow-up work stays hot), at the back
    /// otherwise.
    fn absorb_enqueued(
        &mut self,
        graph: &mut DependencyGraph,
        promotion_rx: &mut broadcast::Receiver<ChangeEvent>,
    ) {
        loop {
            match promotion_rx.try_recv() {
                Ok(event) if event.to == NodeState::Enqueuing => {
                    graph.change_state(event.node, NodeState::Processing);
                    if graph.dependencies(event.node).count() > 0 {
                        self.ready.push_front(event.node);
                    } else {
                        self.ready.push_back(event.node);
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Dequeues and dispatches as many ready commands as the caps allow.
    /// Returns `true` if a browser command was blocked by the browser
    /// cap and requeued, meaning the caller should schedule a retry tick.
    fn dispatch(
        &mut self,
        graph: &mut DependencyGraph,
        executor: &CommandExecutor,
        referring_test_cases: &IndexMap<Command, Vec<TestCase>>,
        result_tx: &mpsc::UnboundedSender<(NodeId, CommandOutput)>,
    ) -> bool {
        let mut browser_blocked = false;

        while let Some(&node) = self.ready.front() {
            let command = graph.command(node).clone();
            let is_browser = command.kind().is_browser();

            if is_browser {
                if self.browser_in_flight >= self.max_browser_processes {
                    // Move this one command to the back and stop for
                    // now; re-ticking immediately would busy-loop on the
                    // same blocked command.
                    self.ready.rotate_left(1);
                    browser_blocked = true;
                    break;
                }
            } else if self.total_in_flight >= self.max_processes {
                break;
            }

            self.ready.pop_front();
            self.total_in_flight += 1;
            if is_browser {
                self.browser_in_flight += 1;
            }

            let timeout = resolve_timeout(&command, referring_test_cases);
            let executor = executor.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let output = executor.execute(&command, timeout).await;
                let _ = result_tx.send((node, output));
            });
        }

        browser_blocked
    }

    fn on_command_finished(&mut self, graph: &mut DependencyGraph, node: NodeId, output: CommandOutput) {
        self.total_in_flight -= 1;
        if graph.command(node).kind().is_browser() {
            self.browser_in_flight -= 1;
        }

        let next_state = if output.can_run_dependent_commands() {
            NodeState::Successful
        } else {
            NodeState::Failed
        };

        // Broadcast before the graph transition so the completer (which
        // looks the output up by command) never observes a `processing
        // -> successful|failed` event before the output it explains is
        // available, per spec.md §5's ordering guarantee (b).
        let _ = self.outputs_tx.send((node, output));
        graph.change_state(node, next_state);
    }

    fn is_shutdown(&self, graph: &DependencyGraph) -> bool {
        graph.is_sealed()
            && self.ready.is_empty()
            && self.total_in_flight == 0
            && [
                NodeState::Initialized,
                NodeState::Waiting,
                NodeState::Enqueuing,
                NodeState::Processing,
            ]
            .iter()
            .all(|&state| graph.state_count(state) == 0)
    }

    fn dump_diagnostics(&self, graph: &DependencyGraph) {
        tracing::warn!(
            ready = self.ready.len(),
            total_in_flight = self.total_in_flight,
            browser_in_flight = self.browser_in_flight,
            initialized = graph.state_count(NodeState::Initialized),
            waiting = graph.state_count(NodeState::Waiting),
            enqueuing = graph.state_count(NodeState::Enqueuing),
            processing = graph.state_count(NodeState::Processing),
            successful = graph.state_count(NodeState::Successful),
            failed = graph.state_count(NodeState::Failed),
            unable_to_run = graph.state_count(NodeState::UnableToRun),
            "command queue inactivity watchdog fired; nothing has finished recently"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::test_case::{ConfigHandle, Expectations};

    fn cmd(name: &str) -> Command {
        Command::builder("/bin/true", name).build()
    }

    fn referring_map(commands: &[Command]) -> IndexMap<Command, Vec<TestCase>> {
        let test_case = TestCase::new(
            "t".to_string(),
            commands.to_vec(),
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(5),
        )
        .unwrap();
        commands
            .iter()
            .map(|c| (c.clone(), vec![test_case.clone()]))
            .collect()
    }

    #[test]
    fn resolve_timeout_picks_the_max_across_referring_test_cases() {
        let c = cmd("a");
        let slow = TestCase::new(
            "slow".to_string(),
            vec![c.clone()],
            ConfigHandle::from("default"),
            Expectations::PASS | Expectations::SLOW,
            Expectations::empty(),
            Duration::from_secs(10),
        )
        .unwrap();
        let fast = TestCase::new(
            "fast".to_string(),
            vec![c.clone()],
            ConfigHandle::from("default"),
            Expectations::PASS,
            Expectations::empty(),
            Duration::from_secs(10),
        )
        .unwrap();
        let mut referring = IndexMap::new();
        referring.insert(c.clone(), vec![slow, fast]);

        assert_eq!(resolve_timeout(&c, &referring), Duration::from_secs(40));
    }

    #[test]
    #[should_panic(expected = "scheduler invariant violated")]
    fn resolve_timeout_is_fatal_with_no_referring_test_case() {
        let c = cmd("a");
        let referring = IndexMap::new();
        resolve_timeout(&c, &referring);
    }

    #[test]
    fn new_queue_starts_empty_and_not_done() {
        let queue = CommandQueue::new(&RunnerConfig::default());
        assert_eq!(queue.total_in_flight, 0);
        assert!(!*queue.subscribe_done().borrow());
    }

    #[test]
    fn referring_map_helper_builds_one_entry_per_command() {
        let commands = vec![cmd("a"), cmd("b")];
        let map = referring_map(&commands);
        assert_eq!(map.len(), 2);
    }
}
