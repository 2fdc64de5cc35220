// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch Runner: persistent worker children that serve many commands
//! sequentially over the line-framed protocol in [`protocol`].

mod protocol;

use crate::command::Command;
use crate::config::RunnerConfig;
use crate::errors::{BatchProtocolError, InvariantViolation};
use crate::output_log::OutputLog;
use crate::process::build_child_env;
use crate::test_output::CommandOutput;
use crate::time::stopwatch;
use debug_ignore::DebugIgnore;
use protocol::{encode_request, parse_status_line, BatchOutcome, StatusLine};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};

/// A single persistent worker child, bound to one runner type and one
/// set of environment overrides until it's killed and replaced.
struct BatchWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    runner_type: String,
    env: BTreeMap<String, String>,
    jobs_run: u32,
    in_use: bool,
}

impl BatchWorker {
    async fn spawn(
        runner_type: &str,
        template: &Command,
    ) -> std::io::Result<Self> {
        let mut cmd = tokio::process::Command::new(template.executable());
        cmd.arg("--batch");
        cmd.env_clear();
        for (k, v) in build_child_env(template) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        Ok(Self {
            child,
            stdin,
            stdout,
            runner_type: runner_type.to_string(),
            env: template.env_overrides().clone(),
            jobs_run: 0,
            in_use: false,
        })
    }

    fn matches(&self, runner_type: &str, env: &BTreeMap<String, String>) -> bool {
        !self.in_use && self.runner_type == runner_type && &self.env == env
    }

    /// Runs one job against this worker, reading status lines until a
    /// `TEST` outcome, `EOF STDERR` boundary, or timeout.
    ///
    /// Returns `(output, protocol_violation)`; on a protocol violation
    /// the caller must kill and replace this worker (spec.md §4.7/§7).
    async fn run_job(
        &mut self,
        args: &[String],
        json_protocol: bool,
        timeout: Duration,
    ) -> (CommandOutput, bool) {
        let sw = stopwatch();
        let request = encode_request(args, json_protocol);

        if let Err(e) = self.stdin.write_all(request.as_bytes()).await {
            return (
                CommandOutput::spawn_failure(format!("failed to write batch request: {e}")),
                true,
            );
        }
        if let Err(e) = self.stdin.flush().await {
            return (
                CommandOutput::spawn_failure(format!("failed to flush batch request: {e}")),
                true,
            );
        }

        let outcome = tokio::time::timeout(timeout, self.read_until_outcome()).await;

        self.jobs_run += 1;

        match outcome {
            Ok(Ok((batch_outcome, stdout, stderr))) => {
                let stdout_final = stdout.finalize();
                let stderr_final = stderr.finalize();
                let output = CommandOutput {
                    exit_code: batch_outcome.exit_code(),
                    timed_out: false,
                    stdout: stdout_final.bytes,
                    stderr: stderr_final.bytes,
                    duration: sw.elapsed(),
                    pid: self.child.id(),
                    compilation_skipped: false,
                    diagnostics: Vec::new(),
                    abort_status: None,
                };
                (output, false)
            }
            Ok(Err(_protocol_error)) => {
                let mut output = CommandOutput::failure(BatchOutcome::Crash.exit_code(), sw.elapsed());
                output.diagnostics.push("batch runner protocol violation".to_string());
                (output, true)
            }
            Err(_elapsed) => {
                let mut output =
                    CommandOutput::failure(BatchOutcome::Timeout.exit_code(), sw.elapsed());
                output.timed_out = true;
                (output, true)
            }
        }
    }

    async fn read_until_outcome(
        &mut self,
    ) -> Result<(BatchOutcome, OutputLog, OutputLog), BatchProtocolError> {
        let mut stdout_log = OutputLog::new();
        let mut stderr_log = OutputLog::new();
        let mut in_stderr = false;
        let mut line = String::new();

        loop {
            line.clear();
            let n = self.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(BatchProtocolError::NoOutcome);
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);

            if let Some(status) = trimmed.strip_prefix(">>> ").map(|_| trimmed) {
                match parse_status_line(status)? {
                    StatusLine::Test(outcome) => return Ok((outcome, stdout_log, stderr_log)),
                    StatusLine::Batch => continue,
                    StatusLine::EofStderr => {
                        in_stderr = true;
                        continue;
                    }
                }
            }

            let target = if in_stderr {
                &mut stderr_log
            } else {
                &mut stdout_log
            };
            let _ = target.append(trimmed.as_bytes()).await;
            let _ = target.append(b"\n").await;
        }
    }

    async fn terminate(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

/// Owns every live batch worker, grouped by runner type, and dispatches
/// jobs to an idle matching worker (spawning or recycling as needed).
///
/// Owned by [`crate::executor::CommandExecutor`] and released only
/// during its `cleanup`, per spec.md §5's resource-lifecycle rule.
#[derive(Debug)]
pub struct BatchRunnerPool {
    // `Child`/`ChildStdin`/`BufReader<ChildStdout>` aren't `Debug`; skip
    // the whole worker list rather than hand-writing a field-by-field impl.
    workers: DebugIgnore<Vec<BatchWorker>>,
    recycle_interval: u32,
    max_per_type: usize,
}

impl BatchRunnerPool {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            workers: DebugIgnore(Vec::new()),
            recycle_interval: config.batch_recycle_interval,
            max_per_type: config.max_processes,
        }
    }

    /// Runs `command` (which must declare a batch runner type) against an
    /// idle worker, spawning one if none exists yet for this type and
    /// env, or killing and replacing a stale one if the type/env no
    /// longer match. Fatal if every worker for this type is in flight —
    /// that means the queue dispatched past the process cap.
    pub async fn run(&mut self, command: &Command, runner_type: &str, timeout: Duration) -> CommandOutput {
        let env = command.env_overrides().clone();

        let idle_matching = self
            .workers
            .iter()
            .position(|w| w.matches(runner_type, &env));

        let worker_idx = match idle_matching {
            Some(idx) => idx,
            None => {
                let idle_stale = self
                    .workers
                    .iter()
                    .position(|w| !w.in_use && w.runner_type == runner_type);
                match idle_stale {
                    Some(idx) => {
                        let stale = self.workers.swap_remove(idx);
                        stale.terminate().await;
                        match BatchWorker::spawn(runner_type, command).await {
                            Ok(worker) => {
                                self.workers.push(worker);
                                self.workers.len() - 1
                            }
                            Err(e) => {
                                return CommandOutput::spawn_failure(format!(
                                    "failed to spawn batch runner `{runner_type}`: {e}"
                                ));
                            }
                        }
                    }
                    None => {
                        // No idle worker of this runner type. If we're
                        // already at the per-type cap, every one of them
                        // must be in flight, which means the queue
                        // dispatched past its process cap.
                        let count_of_type = self
                            .workers
                            .iter()
                            .filter(|w| w.runner_type == runner_type)
                            .count();
                        if count_of_type >= self.max_per_type {
                            InvariantViolation::NoIdleBatchRunner {
                                runner_type: runner_type.to_string(),
                            }
                            .fatal();
                        }
                        match BatchWorker::spawn(runner_type, command).await {
                            Ok(worker) => {
                                self.workers.push(worker);
                                self.workers.len() - 1
                            }
                            Err(e) => {
                                return CommandOutput::spawn_failure(format!(
                                    "failed to spawn batch runner `{runner_type}`: {e}"
                                ));
                            }
                        }
                    }
                }
            }
        };

        self.workers[worker_idx].in_use = true;
        let (output, protocol_violation) = self.workers[worker_idx]
            .run_job(command.args(), command.json_protocol(), timeout)
            .await;

        let recycle_due = self.workers[worker_idx].jobs_run >= self.recycle_interval;
        if protocol_violation || recycle_due {
            let worker = self.workers.swap_remove(worker_idx);
            worker.terminate().await;
        } else {
            self.workers[worker_idx].in_use = false;
        }

        output
    }

    /// Kills every live worker. Called exactly once, from the executor's
    /// `cleanup`. Workers are torn down concurrently rather than one at a
    /// time, since each termination is an independent kill-then-wait with
    /// no shared state to serialize on.
    pub async fn cleanup(&mut self) {
        let terminations = self.workers.drain(..).map(BatchWorker::terminate);
        futures::future::join_all(terminations).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind};

    fn batch_command(runner_type: &str) -> Command {
        Command::builder("/bin/sh", "batch-job")
            .args(["-c", "exit 0"])
            .kind(CommandKind::BatchCompile {
                runner_type: runner_type.to_string(),
            })
            .build()
    }

    #[test]
    fn new_pool_has_no_workers() {
        let pool = BatchRunnerPool::new(&RunnerConfig::default());
        assert!(pool.workers.is_empty());
    }

    #[test]
    fn batch_command_resolves_runner_type() {
        let command = batch_command("dartdevc");
        assert_eq!(
            command.kind().batch_runner_type(true),
            Some("dartdevc")
        );
        assert_eq!(command.kind().batch_runner_type(false), None);
    }
}
