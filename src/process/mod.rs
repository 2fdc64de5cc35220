// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot child process lifecycle: spawn, timeout, stack-trace capture,
//! cleanup, exit-code normalization.

use crate::command::Command;
use crate::config::RunnerConfig;
use crate::output_log::OutputLog;
use crate::test_output::{CommandOutput, NON_UTF8_EXIT_SENTINEL};
use crate::time::stopwatch;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;
#[cfg(windows)]
#[path = "windows.rs"]
mod os;

/// Environment variables stripped from the host environment before a
/// child is spawned. See spec.md §6.
const STRIPPED_PROXY_VARS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
];

/// Tells [`RunningProcess::run`] whether a command's declared output
/// file is already up to date, in which case execution can be skipped
/// entirely. Status-file parsing and build-freshness logic live outside
/// harness-core (spec.md §1); this is the seam.
pub trait FreshnessChecker: Send + Sync {
    fn is_up_to_date(&self, command: &Command) -> bool;
}

/// A [`FreshnessChecker`] that always reports everything as stale, for
/// callers with no freshness tracking.
pub struct AlwaysStale;
impl FreshnessChecker for AlwaysStale {
    fn is_up_to_date(&self, _command: &Command) -> bool {
        false
    }
}

/// Builds the sanitized environment for a child: host environment minus
/// proxy variables, the two glibc compatibility variables, then the
/// command's own overrides applied last.
pub(crate) fn build_child_env(command: &Command) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| !STRIPPED_PROXY_VARS.contains(&k.as_str()))
        .collect();
    env.push(("GLIBCPP_FORCE_NEW".to_string(), "1".to_string()));
    env.push(("GLIBCXX_FORCE_NEW".to_string(), "1".to_string()));
    for (k, v) in command.env_overrides() {
        env.retain(|(existing_k, _)| existing_k != k);
        env.push((k.clone(), v.clone()));
    }
    env
}

/// Runs `command` as a fresh one-shot child process, subject to
/// `timeout`.
pub struct RunningProcess;

impl RunningProcess {
    pub async fn run(
        command: &Command,
        timeout: Duration,
        config: &RunnerConfig,
        freshness: &dyn FreshnessChecker,
    ) -> CommandOutput {
        if let Some(_output_file) = command.output_file() {
            if freshness.is_up_to_date(command) {
                tracing::debug!(command = %command, "output file up to date, skipping");
                let mut out = CommandOutput::success(Duration::ZERO);
                out.compilation_skipped = true;
                return out;
            }
        }

        Self::run_uncached(command, timeout, config).await
    }

    async fn run_uncached(
        command: &Command,
        timeout: Duration,
        config: &RunnerConfig,
    ) -> CommandOutput {
        let sw = stopwatch();

        let mut stdout_log = match command.output_file() {
            Some(path) => match OutputLog::with_tee(path.clone()).await {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(command = %command, output_file = %path, error = %e, "failed to open output-file tee, capturing in memory only");
                    OutputLog::new()
                }
            },
            None => OutputLog::new(),
        };

        let mut cmd = tokio::process::Command::new(command.executable());
        cmd.args(command.args());
        if let Some(cwd) = command.cwd() {
            cmd.current_dir(cwd);
        }
        cmd.env_clear();
        for (k, v) in build_child_env(command) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        os::set_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "failed to spawn");
                return CommandOutput::spawn_failure(format!(
                    "failed to spawn `{command}`: {e}"
                ));
            }
        };

        let pid = child.id();

        let mut stderr_log = OutputLog::new();
        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");

        // Drain stdout/stderr concurrently with the wait below, on their
        // own tasks. Commands that write more than the OS pipe buffer
        // (compilers routinely do) would otherwise block in `write()`
        // once nobody is reading, which means `child.wait()` never
        // resolves and the run is falsely reported as timed out.
        let stdout_task = tokio::spawn(async move {
            let mut pipe = stdout_pipe;
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut pipe = stderr_pipe;
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut timed_out = false;
        let mut diagnostics = Vec::new();

        let wait_result = tokio::select! {
            res = child.wait() => res,
            () = tokio::time::sleep(timeout) => {
                timed_out = true;
                if let Some(pid) = pid {
                    diagnostics.extend(os::capture_descendant_stacks(pid, config).await);
                }
                os::kill(&mut child).await;
                child.wait().await
            }
        };

        // The reader tasks have already drained most of stdout/stderr by
        // now; give them MAX_STDIO_DELAY to reach EOF, since the pipe can
        // outlive the process (e.g. a grandchild holding the write end
        // open). Past that grace period they're abandoned rather than
        // blocking the scheduler indefinitely.
        let (stdout_bytes, stderr_bytes) = match tokio::time::timeout(
            config.max_stdio_delay,
            futures::future::join(stdout_task, stderr_task),
        )
        .await
        {
            Ok((stdout_res, stderr_res)) => (
                stdout_res.unwrap_or_default(),
                stderr_res.unwrap_or_default(),
            ),
            Err(_) => {
                tracing::warn!(command = %command, "stdio did not drain within MAX_STDIO_DELAY, abandoning");
                (Vec::new(), Vec::new())
            }
        };

        let _ = stdout_log.append(&stdout_bytes).await;
        let _ = stderr_log.append(&stderr_bytes).await;
        let _ = stdout_log.close().await;
        let _ = stderr_log.close().await;

        let stdout_final = stdout_log.finalize();
        let stderr_final = stderr_log.finalize();
        let has_non_utf8 = stdout_final.has_non_utf8 || stderr_final.has_non_utf8;

        let (mut exit_code, abort_status) = match wait_result {
            Ok(status) => (status.code().unwrap_or(1), os::abort_status(&status)),
            Err(e) => {
                diagnostics.push(format!("failed to wait on child: {e}"));
                (1, None)
            }
        };

        if timed_out {
            exit_code = 1;
        } else if has_non_utf8 && exit_code == 0 {
            // spec.md §6/§7: non-UTF-8 output on an otherwise-successful
            // run is forced to fail via this sentinel, so the test
            // doesn't silently pass on garbled output.
            exit_code = NON_UTF8_EXIT_SENTINEL;
        }

        CommandOutput {
            exit_code,
            timed_out,
            stdout: stdout_final.bytes,
            stderr: stderr_final.bytes,
            duration: sw.elapsed(),
            pid,
            compilation_skipped: false,
            diagnostics,
            abort_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn proxy_vars_are_stripped_and_glibc_vars_are_set() {
        // SAFETY: test-only, single-threaded test body.
        unsafe {
            std::env::set_var("http_proxy", "http://example.invalid");
        }
        let command = Command::builder("/bin/true", "t").build();
        let env = build_child_env(&command);
        assert!(!env.iter().any(|(k, _)| k == "http_proxy"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "GLIBCPP_FORCE_NEW" && v == "1"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "GLIBCXX_FORCE_NEW" && v == "1"));
        unsafe {
            std::env::remove_var("http_proxy");
        }
    }

    #[test]
    fn command_overrides_win_over_inherited_env() {
        let command = Command::builder("/bin/true", "t")
            .env("GLIBCXX_FORCE_NEW", "0")
            .build();
        let env = build_child_env(&command);
        let matches: Vec<_> = env
            .iter()
            .filter(|(k, _)| k == "GLIBCXX_FORCE_NEW")
            .collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, "0");
    }

    #[tokio::test]
    async fn successful_process_reports_zero_exit() {
        let command = Command::builder("/bin/true", "true").build();
        let out = RunningProcess::run(
            &command,
            Duration::from_secs(5),
            &RunnerConfig::default(),
            &AlwaysStale,
        )
        .await;
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn stdout_larger_than_the_os_pipe_buffer_does_not_hang() {
        // Comfortably past the ~64 KiB Linux pipe buffer. If stdout isn't
        // drained concurrently with `wait()`, the child blocks in
        // `write()` once the pipe fills and this test times out instead
        // of completing.
        let command = Command::builder("/bin/sh", "big-stdout")
            .args(["-c", "yes | head -c 200000"])
            .build();
        let out = RunningProcess::run(
            &command,
            Duration::from_secs(10),
            &RunnerConfig::default(),
            &AlwaysStale,
        )
        .await;
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let command = Command::builder("/bin/sh", "false")
            .args(["-c", "exit 3"])
            .build();
        let out = RunningProcess::run(
            &command,
            Duration::from_secs(5),
            &RunnerConfig::default(),
            &AlwaysStale,
        )
        .await;
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_and_marks_timed_out() {
        let command = Command::builder("/bin/sh", "sleeper")
            .args(["-c", "sleep 10"])
            .build();
        let out = RunningProcess::run(
            &command,
            Duration::from_millis(200),
            &RunnerConfig::default(),
            &AlwaysStale,
        )
        .await;
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 1);
    }

    struct AlwaysFresh;
    impl FreshnessChecker for AlwaysFresh {
        fn is_up_to_date(&self, _command: &Command) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn up_to_date_output_file_skips_execution() {
        let command = Command::builder("/bin/false", "never-run")
            .output_file("/tmp/harness-core-does-not-matter")
            .build();
        let out = RunningProcess::run(
            &command,
            Duration::from_secs(5),
            &RunnerConfig::default(),
            &AlwaysFresh,
        )
        .await;
        assert_eq!(out.exit_code, 0);
        assert!(out.compilation_skipped);
    }

    #[tokio::test]
    async fn stale_output_file_is_run_and_stdout_teed_to_it() {
        let dir = std::env::temp_dir().join(format!(
            "harness-core-process-test-{}",
            std::process::id()
        ));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let out_path = camino::Utf8PathBuf::from_path_buf(dir.join("out.log")).unwrap();

        let command = Command::builder("/bin/echo", "echo-stdout")
            .args(["hello-tee"])
            .output_file(out_path.clone())
            .build();
        let out = RunningProcess::run(
            &command,
            Duration::from_secs(5),
            &RunnerConfig::default(),
            &AlwaysStale,
        )
        .await;
        assert_eq!(out.exit_code, 0);
        assert!(!out.compilation_skipped);

        let teed = tokio::fs::read_to_string(&out_path).await.unwrap();
        assert_eq!(teed.trim_end(), "hello-tee");
    }
}
