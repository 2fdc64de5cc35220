// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Command`]: an immutable, content-hashed description of a single
//! external action.

use camino::Utf8PathBuf;
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// What kind of thing a [`Command`] asks the executor to run.
///
/// This is what lets [`crate::executor::CommandExecutor`] pick a runner
/// without inspecting the executable path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// A plain child process, run once and discarded.
    Process,
    /// A compilation step that is always run through a batch runner,
    /// regardless of configuration (kernel compiles).
    KernelCompile,
    /// A compilation step that is batched only when batch mode is
    /// configured on. `runner_type` identifies which persistent worker
    /// pool it shares (e.g. `"dartdevc"`, `"fasta"`).
    BatchCompile { runner_type: String },
    /// A VM invocation that is always batched, keyed by display name and
    /// script file so that repeated runs of the same script reuse a
    /// worker.
    VmBatch { key: String },
    /// Launches a browser test; dispatched to a [`crate::executor::BrowserController`].
    BrowserLaunch,
    /// Pushes a test payload to a device and runs a shell step sequence
    /// on it; dispatched via a [`crate::executor::DevicePool`].
    DevicePush,
    /// Runs in-process rather than as a child (e.g. a helper script).
    Script,
}

impl CommandKind {
    /// The batch runner identifier this command shares workers under, if
    /// any, given whether batch mode is configured on.
    pub fn batch_runner_type(&self, batch_mode: bool) -> Option<&str> {
        match self {
            CommandKind::KernelCompile => Some("kernel"),
            CommandKind::BatchCompile { runner_type } if batch_mode => Some(runner_type),
            CommandKind::VmBatch { key } => Some(key),
            _ => None,
        }
    }

    pub fn is_browser(&self) -> bool {
        matches!(self, CommandKind::BrowserLaunch)
    }

    pub fn is_device_push(&self) -> bool {
        matches!(self, CommandKind::DevicePush)
    }

    pub fn is_script(&self) -> bool {
        matches!(self, CommandKind::Script)
    }
}

#[derive(Debug)]
struct CommandInner {
    executable: Utf8PathBuf,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    display_name: String,
    retry_budget: usize,
    kind: CommandKind,
    output_file: Option<Utf8PathBuf>,
    /// Opt in to JSON-array argument framing on the batch protocol,
    /// rather than space-joined arguments. Per spec.md §9's open
    /// question, nothing prevents a runner other than "fasta" from
    /// opting in; this field is how that extension point is expressed.
    json_protocol: bool,
    /// `None` for the original command; `Some(i)` for the command
    /// produced by `indexed_copy(i)`. Distinguishes repeat copies from
    /// each other and from the original for dedup purposes.
    repeat_index: Option<u32>,
}

// Two commands are the same node in the dependency graph iff they compare
// equal here. Only the fields that describe *what will actually run* take
// part; nothing about scheduling state does.
impl PartialEq for CommandInner {
    fn eq(&self, other: &Self) -> bool {
        self.executable == other.executable
            && self.args == other.args
            && self.cwd == other.cwd
            && self.env == other.env
            && self.kind == other.kind
            && self.repeat_index == other.repeat_index
    }
}
impl Eq for CommandInner {}

impl Hash for CommandInner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.executable.hash(state);
        self.args.hash(state);
        self.cwd.hash(state);
        self.env.hash(state);
        self.kind.hash(state);
        self.repeat_index.hash(state);
    }
}

/// An immutable, content-hashed description of a single external action:
/// an executable path, argument vector, working directory, environment
/// overrides, display name, retry budget, and a [`CommandKind`] tag.
///
/// `Command` has value equality and hash so that two test cases
/// requesting the same compile share one graph node — see
/// [`crate::graph::DependencyGraph::add`]. Cloning is cheap (an `Arc`
/// bump); there is no way to mutate a `Command` after construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Command {
    inner: Arc<CommandInner>,
}

/// Builds a [`Command`]. All fields except `executable`, `args`, and
/// `display_name` default to their natural empty/zero value.
#[derive(Debug, Default)]
pub struct CommandBuilder {
    executable: Utf8PathBuf,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    display_name: String,
    retry_budget: usize,
    kind: Option<CommandKind>,
    output_file: Option<Utf8PathBuf>,
    json_protocol: bool,
}

impl CommandBuilder {
    pub fn new(executable: impl Into<Utf8PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn kind(mut self, kind: CommandKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn output_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn json_protocol(mut self, enabled: bool) -> Self {
        self.json_protocol = enabled;
        self
    }

    pub fn build(self) -> Command {
        Command {
            inner: Arc::new(CommandInner {
                executable: self.executable,
                args: self.args,
                cwd: self.cwd,
                env: self.env,
                display_name: self.display_name,
                retry_budget: self.retry_budget,
                kind: self.kind.unwrap_or(CommandKind::Process),
                output_file: self.output_file,
                json_protocol: self.json_protocol,
                repeat_index: None,
            }),
        }
    }
}

impl Command {
    pub fn builder(
        executable: impl Into<Utf8PathBuf>,
        display_name: impl Into<String>,
    ) -> CommandBuilder {
        CommandBuilder::new(executable, display_name)
    }

    pub fn executable(&self) -> &Utf8PathBuf {
        &self.inner.executable
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn cwd(&self) -> Option<&Utf8PathBuf> {
        self.inner.cwd.as_ref()
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn retry_budget(&self) -> usize {
        self.inner.retry_budget
    }

    pub fn kind(&self) -> &CommandKind {
        &self.inner.kind
    }

    pub fn output_file(&self) -> Option<&Utf8PathBuf> {
        self.inner.output_file.as_ref()
    }

    pub fn json_protocol(&self) -> bool {
        self.inner.json_protocol
    }

    pub fn repeat_index(&self) -> Option<u32> {
        self.inner.repeat_index
    }

    /// Derives a distinct command for repeat iteration `i`.
    ///
    /// `i == 0` is the original command's own copy (equal to `self`
    /// under the boundary-behavior pin in spec.md §8: "a repeat count of
    /// 0 is rejected or treated as 1"; harness-core treats a repeat
    /// count of 0 as an error at the enqueuer level, see
    /// [`crate::enqueuer::TestCaseEnqueuer::enqueue_suite`]). For `i >
    /// 0`, the copy carries `i` as part of its identity, so its graph
    /// node is distinct from the original and from every other copy.
    pub fn indexed_copy(&self, i: u32) -> Command {
        if i == 0 {
            return self.clone();
        }
        let mut inner = (*self.inner).clone_fields();
        inner.repeat_index = Some(i);
        Command {
            inner: Arc::new(inner),
        }
    }
}

impl CommandInner {
    fn clone_fields(&self) -> CommandInner {
        CommandInner {
            executable: self.executable.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            display_name: self.display_name.clone(),
            retry_budget: self.retry_budget,
            kind: self.kind.clone(),
            output_file: self.output_file.clone(),
            json_protocol: self.json_protocol,
            repeat_index: self.repeat_index,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.display_name)
    }
}
