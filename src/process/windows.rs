// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Windows process management and stack-trace capture.

use crate::config::RunnerConfig;
use crate::test_output::AbortStatus;
use std::process::ExitStatus;
use tokio::process::{Child, Command};

/// No process-group equivalent is set up on Windows; job objects would be
/// the right tool but harness-core relies on [`Child::kill`] plus
/// descendant discovery via `wmic` instead.
pub(super) fn set_process_group(_cmd: &mut Command) {}

pub(super) async fn kill(child: &mut Child) {
    let _ = child.kill().await;
}

pub(super) fn abort_status(status: &ExitStatus) -> Option<AbortStatus> {
    let code = status.code()?;
    if code < 0 {
        Some(AbortStatus::WindowsNtStatus(code))
    } else {
        None
    }
}

pub(super) async fn capture_descendant_stacks(pid: u32, config: &RunnerConfig) -> Vec<String> {
    let mut pids = vec![pid];
    pids.extend(descendants(pid, &config.stack_trace_probe.windows_wmic).await);

    let mut diagnostics = Vec::new();
    for pid in pids {
        if let Some(trace) = capture_one(pid, config).await {
            diagnostics.push(trace);
        }
    }
    diagnostics
}

async fn descendants(pid: u32, wmic: &str) -> Vec<u32> {
    let output = tokio::process::Command::new(wmic)
        .args([
            "process",
            "where",
            &format!("ParentProcessId={pid}"),
            "get",
            "ProcessId",
        ])
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
    let cdb = &config.stack_trace_probe.windows_cdb;
    let output = tokio::process::Command::new(cdb)
        .args(["-p", &pid.to_string(), "-c", "!uniqstack;qd"])
        .output()
        .await;
    match output {
        Ok(output) => {
            let combined = String::from_utf8_lossy(&output.stdout).into_owned();
            if combined.trim().is_empty() {
                None
            } else {
                Some(format!("stack trace for pid {pid}:\n{combined}"))
            }
        }
        Err(e) => {
            tracing::debug!(pid, tool = %cdb, error = %e, "stack trace probe failed to run");
            None
        }
    }
}
