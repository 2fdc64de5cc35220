// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wires the enqueuer, queue, and completer into one running pipeline,
//! and defines the listener seam an embedding UI hooks into.
//!
//! Mirrors `nextest-runner`'s own split between its scheduler internals
//! (`runner/imp.rs`) and the `list::TestEventStatus`/reporter callbacks
//! its CLI layer consumes: this module is the thin "main loop" that owns
//! no policy of its own, only composition.

use crate::completer::TestCaseCompleter;
use crate::config::RunnerConfig;
use crate::enqueuer::{EnqueueError, SuiteSource, TestCaseEnqueuer, TestSuite};
use crate::executor::CommandExecutor;
use crate::graph::DependencyGraph;
use crate::queue::CommandQueue;
use crate::test_case::TestCase;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// The four external-UI callbacks from spec.md §6: an embedding
/// application (a CLI progress bar, a test dashboard, ...) implements
/// this to observe a run without reaching into the scheduler's internals.
///
/// Default bodies are no-ops so implementers only override what they
/// actually display, matching the `SuiteSource`/`BrowserController`-style
/// seams elsewhere in this crate.
pub trait HarnessListener {
    /// Called once per test case, after suite expansion and repeat
    /// expansion but before any command has run.
    fn test_added(&self, _test_case: &TestCase) {}

    /// Called once, after every suite has been enqueued and the full set
    /// of test cases (and hence the total count) is known.
    fn all_tests_known(&self, _test_cases: &[TestCase]) {}

    /// Called once per test case, as soon as it finishes (in whatever
    /// order completion actually happens in, not necessarily the order
    /// `test_added` fired in).
    fn done(&self, _test_case: TestCase) {}

    /// Called once, after every enqueued test case has been reported via
    /// `done`.
    fn all_done(&self) {}
}

/// A [`HarnessListener`] that calls nothing; the default for callers that
/// only want the run to happen, not to observe it.
pub struct NullListener;

impl HarnessListener for NullListener {}

/// Builds up a run by enqueuing suites, then executes the whole pipeline
/// to completion.
///
/// This is the only place in the crate that runs [`CommandQueue`] and
/// [`TestCaseCompleter`] concurrently against the same
/// [`DependencyGraph`]; everywhere else treats those two components as
/// black boxes reachable only through their public `run` methods.
pub struct HarnessRunner {
    enqueuer: TestCaseEnqueuer,
    config: RunnerConfig,
}

impl HarnessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            enqueuer: TestCaseEnqueuer::new(),
            config,
        }
    }

    /// Expands `suite` via `source` and wires its test cases into the
    /// graph. Call this once per suite before [`Self::run`].
    pub fn enqueue_suite(
        &mut self,
        suite: &TestSuite,
        source: &dyn SuiteSource,
    ) -> Result<(), EnqueueError> {
        self.enqueuer.enqueue_suite(suite, source, &self.config)
    }

    /// Seals the graph and runs it to completion: dispatches commands
    /// through `executor`, reassembles their outputs into test cases, and
    /// reports each stage to `listener`.
    ///
    /// Returns the graph so a caller that wants a final audit of
    /// terminal states (e.g. to diagnose an `unable_to_run` node) can
    /// still get at it; every node is guaranteed to be in a terminal
    /// state by the time this returns; see spec.md §5's shutdown
    /// condition, which [`CommandQueue::run`] waits on.
    pub async fn run(
        self,
        executor: CommandExecutor,
        listener: &dyn HarnessListener,
    ) -> Arc<RwLock<DependencyGraph>> {
        let (graph, referring_test_cases, test_cases) = self.enqueuer.finish();

        for test_case in &test_cases {
            listener.test_added(test_case);
        }
        listener.all_tests_known(&test_cases);

        let graph = Arc::new(RwLock::new(graph));
        let queue = CommandQueue::new(&self.config);
        let completer = TestCaseCompleter::new(referring_test_cases.clone(), &test_cases);

        // Subscribed before the queue is moved into its own `run`, since
        // nothing else can reach it (by reference or otherwise) once
        // that call takes ownership.
        let outputs_rx = queue.subscribe_outputs();
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<TestCase>();

        let queue_fut = queue.run(Arc::clone(&graph), executor, referring_test_cases);
        let completer_fut = completer.run(Arc::clone(&graph), outputs_rx, finished_tx);
        let listener_fut = async {
            while let Some(test_case) = finished_rx.recv().await {
                listener.done(test_case);
            }
        };

        tokio::join!(queue_fut, completer_fut, listener_fut);
        listener.all_done();

        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::enqueuer::TestCaseSpec;
    use crate::test_case::Expectations;
    use std::sync::Mutex;
    use std::time::Duration;

    struct OneEchoSuite;

    impl SuiteSource for OneEchoSuite {
        fn test_cases(&self, _suite: &TestSuite) -> Vec<TestCaseSpec> {
            vec![TestCaseSpec {
                display_name: "echo".to_string(),
                commands: vec![Command::builder("/bin/echo", "echo").build()],
                configuration: "default".into(),
                expectations: Expectations::PASS,
                intrinsic_expectations: Expectations::empty(),
                base_timeout: Duration::from_secs(5),
                repeat: None,
            }]
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        added: Mutex<Vec<String>>,
        done: Mutex<Vec<String>>,
        all_known: Mutex<bool>,
        all_done: Mutex<bool>,
    }

    impl HarnessListener for RecordingListener {
        fn test_added(&self, test_case: &TestCase) {
            self.added.lock().unwrap().push(test_case.display_name().to_string());
        }

        fn all_tests_known(&self, _test_cases: &[TestCase]) {
            *self.all_known.lock().unwrap() = true;
        }

        fn done(&self, test_case: TestCase) {
            self.done.lock().unwrap().push(test_case.display_name().to_string());
        }

        fn all_done(&self) {
            *self.all_done.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn runner_drives_one_test_case_through_to_done() {
        let mut runner = HarnessRunner::new(RunnerConfig::default());
        runner
            .enqueue_suite(
                &TestSuite { name: "s".to_string() },
                &OneEchoSuite,
            )
            .unwrap();

        let listener = RecordingListener::default();
        let executor = CommandExecutor::new(RunnerConfig::default());
        let graph = runner.run(executor, &listener).await;

        assert_eq!(*listener.added.lock().unwrap(), vec!["echo".to_string()]);
        assert!(*listener.all_known.lock().unwrap());
        assert_eq!(*listener.done.lock().unwrap(), vec!["echo".to_string()]);
        assert!(*listener.all_done.lock().unwrap());

        let g = graph.read().await;
        assert_eq!(g.nodes().count(), 1);
    }

    #[tokio::test]
    async fn null_listener_requires_no_overrides() {
        let mut runner = HarnessRunner::new(RunnerConfig::default());
        runner
            .enqueue_suite(&TestSuite { name: "s".to_string() }, &OneEchoSuite)
            .unwrap();
        runner
            .run(CommandExecutor::new(RunnerConfig::default()), &NullListener)
            .await;
    }
}
