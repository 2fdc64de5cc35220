// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command Executor: dispatches a command to the right runner and applies
//! the retry policy.

use crate::batch::BatchRunnerPool;
use crate::command::{Command, CommandKind};
use crate::config::RunnerConfig;
use crate::errors::HarnessError;
use crate::output_log::OutputLog;
use crate::process::{AlwaysStale, FreshnessChecker, RunningProcess};
use crate::test_output::CommandOutput;
use crate::time::stopwatch;
use async_trait::async_trait;
use bytes::Bytes;
use debug_ignore::DebugIgnore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Dispatches browser-test commands to whatever browser automation layer
/// the embedding application wires up. Out of scope for harness-core
/// itself (spec.md §1).
#[async_trait]
pub trait BrowserController: Send + Sync {
    async fn run(&self, command: &Command, timeout: Duration) -> CommandOutput;
}

/// A device acquired from a [`DevicePool`], capable of running the
/// numbered shell steps of a device-push command's sequence.
#[async_trait]
pub trait Device: Send + Sync {
    /// Runs step `index` of `command`'s device-push sequence. Returns
    /// `None` once the sequence is exhausted.
    async fn run_step(&self, command: &Command, index: usize) -> Option<DeviceStepResult>;
}

pub struct DeviceStepResult {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub duration: Duration,
}

/// Acquires and releases devices for device-push commands. Android/iOS
/// device interaction is out of scope for harness-core (spec.md §1); this
/// is the seam.
#[async_trait]
pub trait DevicePool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn Device>, HarnessError>;
    async fn release(&self, device: Arc<dyn Device>);
}

/// Runs script commands in-process rather than as a child. The concrete
/// interpreter is embedding-application territory; harness-core only
/// knows how to route to it.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, command: &Command) -> CommandOutput;
}

const OOM_MARKER: &str = "Exhausted heap space, trying to allocat";
/// Exact wording is unpinned by the source; this substring matches the
/// common X11 "can't open the configured display" family of messages.
const DISPLAY_NOT_OPENABLE_MARKER: &str = "Could not open display";
const XVFB_RETURN_CODE_MARKER: &str = "Failed to run command. return code=1";

#[derive(Debug)]
struct ExecutorInner {
    config: RunnerConfig,
    batch_pool: Mutex<BatchRunnerPool>,
    // The collaborator traits have no reason to implement `Debug`
    // themselves (they're embedding-application territory); skip them in
    // the derive rather than hand-writing one, same tradeoff nextest-runner
    // makes for its own non-`Debug` handles.
    browser_controller: DebugIgnore<Option<Box<dyn BrowserController>>>,
    device_pool: DebugIgnore<Option<Box<dyn DevicePool>>>,
    script_runner: DebugIgnore<Option<Box<dyn ScriptRunner>>>,
    freshness: DebugIgnore<Box<dyn FreshnessChecker>>,
}

/// Dispatches commands to the appropriate runner and applies the retry
/// policy. Cheap to clone (wraps an `Arc`); every clone shares the same
/// batch runner pool and external collaborators, so it can be handed to
/// as many concurrently-spawned command tasks as the queue wants.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    inner: Arc<ExecutorInner>,
}

impl CommandExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: RunnerConfig) -> CommandExecutorBuilder {
        CommandExecutorBuilder {
            config,
            browser_controller: None,
            device_pool: None,
            script_runner: None,
            freshness: None,
        }
    }

    /// Runs `command` to completion, including retries, per the dispatch
    /// rules in spec.md §4.8.
    pub async fn execute(&self, command: &Command, timeout: Duration) -> CommandOutput {
        let max_attempts = command.retry_budget() + 1;
        let mut last_output = self.dispatch(command, timeout).await;

        for _attempt in 1..max_attempts {
            if !is_retry_worthy(command, &last_output) {
                break;
            }
            last_output = self.dispatch(command, timeout).await;
        }

        last_output
    }

    async fn dispatch(&self, command: &Command, timeout: Duration) -> CommandOutput {
        let kind = command.kind();

        if kind.is_browser() {
            return match &*self.inner.browser_controller {
                Some(controller) => controller.run(command, timeout).await,
                None => CommandOutput::spawn_failure(
                    "no browser controller configured for this run".to_string(),
                ),
            };
        }

        if let Some(runner_type) = kind.batch_runner_type(self.inner.config.batch_mode) {
            let mut pool = self.inner.batch_pool.lock().await;
            return pool.run(command, runner_type, timeout).await;
        }

        if kind.is_script() {
            return match &*self.inner.script_runner {
                Some(runner) => runner.run(command).await,
                None => CommandOutput::spawn_failure(
                    "no script runner configured for this run".to_string(),
                ),
            };
        }

        if kind.is_device_push() {
            return self.run_device_push(command).await;
        }

        RunningProcess::run(
            command,
            timeout,
            &self.inner.config,
            self.inner.freshness.0.as_ref(),
        )
        .await
    }

    async fn run_device_push(&self, command: &Command) -> CommandOutput {
        let Some(pool) = &*self.inner.device_pool else {
            return CommandOutput::spawn_failure(
                "no device pool configured for this run".to_string(),
            );
        };

        let device = match pool.acquire().await {
            Ok(device) => device,
            Err(e) => return CommandOutput::spawn_failure(format!("device acquire failed: {e}")),
        };

        let sw = stopwatch();
        let mut stdout_log = OutputLog::new();
        let mut stderr_log = OutputLog::new();
        let mut final_exit_code = 0;
        let mut step_index = 0;

        loop {
            match device.run_step(command, step_index).await {
                None => break,
                Some(step) => {
                    let _ = stdout_log.append(&step.stdout).await;
                    let _ = stderr_log
                        .append(format!("[step {step_index}, exit {}, {:?}]\n", step.exit_code, step.duration).as_bytes())
                        .await;
                    let _ = stderr_log.append(&step.stderr).await;
                    final_exit_code = step.exit_code;
                    if step.exit_code != 0 {
                        break;
                    }
                    step_index += 1;
                }
            }
        }

        pool.release(device).await;

        let stdout_final = stdout_log.finalize();
        let stderr_final = stderr_log.finalize();
        CommandOutput {
            exit_code: final_exit_code,
            timed_out: false,
            stdout: stdout_final.bytes,
            stderr: stderr_final.bytes,
            duration: sw.elapsed(),
            pid: None,
            compilation_skipped: false,
            diagnostics: Vec::new(),
            abort_status: None,
        }
    }

    /// Releases every batch runner and (if owned) browser controller.
    /// Invoked exactly once, by the queue, after it drains (spec.md §5).
    pub async fn cleanup(&self) {
        self.inner.batch_pool.lock().await.cleanup().await;
    }
}

pub struct CommandExecutorBuilder {
    config: RunnerConfig,
    browser_controller: Option<Box<dyn BrowserController>>,
    device_pool: Option<Box<dyn DevicePool>>,
    script_runner: Option<Box<dyn ScriptRunner>>,
    freshness: Option<Box<dyn FreshnessChecker>>,
}

impl CommandExecutorBuilder {
    pub fn browser_controller(mut self, controller: Box<dyn BrowserController>) -> Self {
        self.browser_controller = Some(controller);
        self
    }

    pub fn device_pool(mut self, pool: Box<dyn DevicePool>) -> Self {
        self.device_pool = Some(pool);
        self
    }

    pub fn script_runner(mut self, runner: Box<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    pub fn freshness(mut self, freshness: Box<dyn FreshnessChecker>) -> Self {
        self.freshness = Some(freshness);
        self
    }

    pub fn build(self) -> CommandExecutor {
        let batch_pool = BatchRunnerPool::new(&self.config);
        CommandExecutor {
            inner: Arc::new(ExecutorInner {
                batch_pool: Mutex::new(batch_pool),
                browser_controller: DebugIgnore(self.browser_controller),
                device_pool: DebugIgnore(self.device_pool),
                script_runner: DebugIgnore(self.script_runner),
                freshness: DebugIgnore(self.freshness.unwrap_or_else(|| Box::new(AlwaysStale))),
                config: self.config,
            }),
        }
    }
}

/// Whether a finished attempt should be retried, per spec.md §4.8/§9.
///
/// Reproduces a quirk from the source predicate verbatim rather than
/// silently fixing it (spec.md §9's open question): both `stdout_text`
/// and `stderr_text` are decoded from `output.stderr`, so the OOM marker
/// check never actually looks at the command's real stdout.
fn is_retry_worthy(command: &Command, output: &CommandOutput) -> bool {
    let stdout_text = String::from_utf8_lossy(&output.stderr);
    let stderr_text = String::from_utf8_lossy(&output.stderr);

    const CRASH_EXIT_CODE: i32 = 253;
    let crashed = output.exit_code == CRASH_EXIT_CODE || output.abort_status.is_some();
    let has_oom_marker = stdout_text.contains(OOM_MARKER) || stderr_text.contains(OOM_MARKER);
    let is_vm_kernel_oom = matches!(command.kind(), CommandKind::KernelCompile) && crashed && has_oom_marker;

    let is_linux_display_flakiness = cfg!(target_os = "linux")
        && (stdout_text.contains(DISPLAY_NOT_OPENABLE_MARKER)
            || stderr_text.contains(DISPLAY_NOT_OPENABLE_MARKER)
            || stdout_text.contains(XVFB_RETURN_CODE_MARKER)
            || stderr_text.contains(XVFB_RETURN_CODE_MARKER));

    is_vm_kernel_oom || is_linux_display_flakiness
}
