// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by harness-core.

use crate::command::Command;
use std::{io, sync::Arc};
use thiserror::Error;

/// An error that occurred while spawning a child process.
#[derive(Debug, Error)]
#[error("failed to spawn `{}`", command.display_name())]
pub struct SpawnError {
    pub command: Command,
    #[source]
    pub source: Arc<io::Error>,
}

impl SpawnError {
    pub fn new(command: Command, source: io::Error) -> Self {
        Self {
            command,
            source: Arc::new(source),
        }
    }
}

/// An error encountered while talking to a batch runner's stdio.
#[derive(Debug, Error)]
pub enum BatchProtocolError {
    /// The child wrote a `>>> ` status line that isn't part of the known
    /// protocol vocabulary.
    #[error("unrecognized batch runner status line: `{0}`")]
    UnrecognizedStatusLine(String),

    /// The child's stdin or stdout could not be used.
    #[error("batch runner io error")]
    Io(#[source] Arc<io::Error>),

    /// The runner exited before producing a `>>> TEST` status line.
    #[error("batch runner exited without reporting a test outcome")]
    NoOutcome,
}

impl From<io::Error> for BatchProtocolError {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Errors surfaced by the output log.
#[derive(Debug, Error)]
pub enum OutputLogError {
    #[error("failed to write to teed output file `{path}`")]
    TeeWrite {
        path: camino::Utf8PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
}

/// A scheduler invariant was violated. These indicate a bug in harness-core
/// itself (or in a caller that bypassed the contracts documented on the
/// public API), never a property of the test suite being run. Per the
/// design, these are fatal: the run cannot meaningfully continue once one of
/// these is observed.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error(
        "graph node for `{command}` made a non-monotone state transition: {from:?} -> {to:?}"
    )]
    NonMonotoneStateChange {
        command: String,
        from: crate::graph::NodeState,
        to: crate::graph::NodeState,
    },

    #[error("command `{command}` was added to the graph twice")]
    DuplicateCommand { command: String },

    #[error("test case `{display_name}` was emitted on the finished stream more than once")]
    DoubleEmitTestCase { display_name: String },

    #[error("no idle batch runner of type `{runner_type}` was available for dispatch")]
    NoIdleBatchRunner { runner_type: String },

    #[error("the queue was asked to dispatch more than the configured process cap")]
    CapacityExceeded,

    /// A command in the graph has no referring test case, so its timeout
    /// (computed as the max over referring test cases) is undefined. Per
    /// spec.md §9's open question about `fold(0, max)` over an empty set,
    /// harness-core forbids this rather than silently defaulting to a
    /// zero timeout: every command reaching the queue was added by the
    /// Enqueuer on behalf of some test case, so an empty referring set
    /// means the referring-test-cases multimap was built incorrectly.
    #[error("command `{command}` has no referring test case; its timeout is undefined")]
    NoReferringTestCase { command: String },
}

impl InvariantViolation {
    /// Logs the violation at `error` level and aborts the run.
    ///
    /// This is the one place in harness-core that panics rather than
    /// returning a `Result`: §7 of the design classifies these as
    /// programmer errors, not data the caller can recover from.
    #[track_caller]
    pub fn fatal(self) -> ! {
        tracing::error!(error = %self, "scheduler invariant violated");
        panic!("harness-core scheduler invariant violated: {self}");
    }
}

/// Top-level error type for fallible harness-core operations that are *not*
/// invariant violations (i.e. that a caller might reasonably want to
/// recover from, log, and continue past).
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    BatchProtocol(#[from] BatchProtocolError),

    #[error(transparent)]
    OutputLog(#[from] OutputLogError),

    #[error("device pool exhausted: {0}")]
    DevicePoolExhausted(String),

    #[error("no browser controller configured for this configuration")]
    NoBrowserController,
}
