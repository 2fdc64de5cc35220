// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unix process-group management and stack-trace capture.

use crate::config::RunnerConfig;
use crate::test_output::AbortStatus;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::{Child, Command, CommandExt};

/// Puts the child in its own process group (`pgid == pid`), so a timeout
/// can kill the whole tree it may have spawned, not just the immediate
/// child.
pub(super) fn set_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

/// Kills the child's entire process group.
pub(super) async fn kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pgid = nix::unistd::Pid::from_raw(pid as libc::pid_t);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

pub(super) fn abort_status(status: &ExitStatus) -> Option<AbortStatus> {
    status.signal().map(AbortStatus::Signal)
}

/// Finds every descendant of `pid` (direct children only, via `pgrep -P`)
/// and runs the configured stack-capture tool against each, returning one
/// diagnostic string per pid that produced output.
pub(super) async fn capture_descendant_stacks(pid: u32, config: &RunnerConfig) -> Vec<String> {
    let mut pids = vec![pid];
    pids.extend(descendants(pid, &config.stack_trace_probe.unix_pgrep).await);

    let mut diagnostics = Vec::new();
    for pid in pids {
        if let Some(trace) = capture_one(pid, config).await {
            diagnostics.push(trace);
        }
    }
    diagnostics
}

async fn descendants(pid: u32, pgrep: &str) -> Vec<u32> {
    let output = tokio::process::Command::new(pgrep)
        .arg("-P")
        .arg(pid.to_string())
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

async fn capture_one(pid: u32, config: &RunnerConfig) -> Option<String> {
    let tool = if cfg!(target_os = "macos") {
        &config.stack_trace_probe.macos_sample
    } else {
        &config.stack_trace_probe.linux_eu_stack
    };

    let mut cmd = tokio::process::Command::new(tool);
    if cfg!(target_os = "macos") {
        cmd.args([&pid.to_string(), "1", "4000", "-mayDie"]);
    } else {
        cmd.args(["-p", &pid.to_string()]);
    }

    match cmd.output().await {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            if combined.trim().is_empty() {
                None
            } else {
                Some(format!("stack trace for pid {pid}:\n{combined}"))
            }
        }
        Err(e) => {
            tracing::debug!(pid, tool, error = %e, "stack trace probe failed to run");
            None
        }
    }
}
