// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A typed DAG of commands with per-node state and event streams.
//!
//! Built on [`petgraph::stable_graph::StableDiGraph`] — the same crate
//! `nextest-runner` reaches for when it needs a typed graph (see its
//! `config/core/imp.rs`, which uses `petgraph` for cycle detection over
//! setup-script dependencies).
//!
//! Per the design note in spec.md §9, nodes never hold owning references
//! back to observers: subscribers get a [`tokio::sync::broadcast`]
//! receiver and look nodes up by [`NodeId`] instead.

use crate::command::Command;
use crate::errors::InvariantViolation;
use petgraph::{stable_graph::StableDiGraph, Direction};
use tokio::sync::{broadcast, watch};

/// One of the seven states a graph node can be in. The last three are
/// terminal: once reached, a node can never transition again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeState {
    Initialized,
    Waiting,
    Enqueuing,
    Processing,
    Successful,
    Failed,
    UnableToRun,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Successful | NodeState::Failed | NodeState::UnableToRun
        )
    }

    /// Rank in the monotone ordering. All three terminal states share a
    /// rank: transitioning *between* them is exactly as forbidden as
    /// transitioning away from them, since `is_terminal` is checked
    /// first in [`DependencyGraph::change_state`].
    fn rank(self) -> u8 {
        match self {
            NodeState::Initialized => 0,
            NodeState::Waiting => 1,
            NodeState::Enqueuing => 2,
            NodeState::Processing => 3,
            NodeState::Successful | NodeState::Failed | NodeState::UnableToRun => 4,
        }
    }
}

/// Opaque handle to a node in a [`DependencyGraph`]. Stable across
/// mutation of the graph (backed by `petgraph`'s `StableDiGraph`, whose
/// indices are not reused after removal — though harness-core never
/// removes nodes once added).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(petgraph::stable_graph::NodeIndex);

struct NodeData {
    command: Command,
    state: NodeState,
    timing_dependency: bool,
}

/// `(node, from, to)`, delivered in the order transitions occur.
#[derive(Clone, Copy, Debug)]
pub struct ChangeEvent {
    pub node: NodeId,
    pub from: NodeState,
    pub to: NodeState,
}

/// A typed DAG of commands with per-node state and event streams.
///
/// Edges run from a dependency to its dependent, so `neighbors_directed`
/// with [`Direction::Incoming`] gives a node's dependencies and
/// [`Direction::Outgoing`] gives what it's needed for.
pub struct DependencyGraph {
    graph: StableDiGraph<NodeData, ()>,
    sealed: bool,
    added_tx: broadcast::Sender<NodeId>,
    changed_tx: broadcast::Sender<ChangeEvent>,
    sealed_tx: watch::Sender<bool>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        let (added_tx, _) = broadcast::channel(1024);
        let (changed_tx, _) = broadcast::channel(1024);
        let (sealed_tx, _) = watch::channel(false);
        Self {
            graph: StableDiGraph::new(),
            sealed: false,
            added_tx,
            changed_tx,
            sealed_tx,
        }
    }

    /// Adds a new node for `command`, depending on `deps`.
    ///
    /// Callers are responsible for deduplicating by command identity
    /// before calling this: the graph does not check for an existing
    /// node with the same command (that lookup belongs to whichever
    /// component owns the command-to-node mapping, e.g.
    /// [`crate::enqueuer::TestCaseEnqueuer`]). Calling `add` after
    /// [`Self::seal`] is a programmer error.
    pub fn add(&mut self, command: Command, deps: &[NodeId], timing_dependency: bool) -> NodeId {
        if self.sealed {
            InvariantViolation::DuplicateCommand {
                command: format!("add() called after seal(): {command}"),
            }
            .fatal();
        }
        let idx = self.graph.add_node(NodeData {
            command,
            state: NodeState::Initialized,
            timing_dependency,
        });
        for dep in deps {
            self.graph.add_edge(dep.0, idx, ());
        }
        let id = NodeId(idx);
        let _ = self.added_tx.send(id);
        id
    }

    /// Seals the graph: forbids further [`Self::add`] calls and notifies
    /// subscribers exactly once.
    pub fn seal(&mut self) {
        self.sealed = true;
        let _ = self.sealed_tx.send(true);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Transitions `node` to `new_state`. Fatal (see
    /// [`InvariantViolation::fatal`]) if the transition is not monotone,
    /// e.g. `successful -> waiting`, or if `node` is already in a
    /// terminal state.
    pub fn change_state(&mut self, node: NodeId, new_state: NodeState) {
        let data = &mut self.graph[node.0];
        let from = data.state;
        if from.is_terminal() || new_state.rank() <= from.rank() {
            InvariantViolation::NonMonotoneStateChange {
                command: data.command.display_name().to_string(),
                from,
                to: new_state,
            }
            .fatal();
        }
        data.state = new_state;
        let _ = self.changed_tx.send(ChangeEvent {
            node,
            from,
            to: new_state,
        });
    }

    pub fn state(&self, node: NodeId) -> NodeState {
        self.graph[node.0].state
    }

    pub fn command(&self, node: NodeId) -> &Command {
        &self.graph[node.0].command
    }

    pub fn is_timing_dependency(&self, node: NodeId) -> bool {
        self.graph[node.0].timing_dependency
    }

    pub fn dependencies(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph
            .neighbors_directed(node.0, Direction::Incoming)
            .map(NodeId)
    }

    pub fn dependents(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph
            .neighbors_directed(node.0, Direction::Outgoing)
            .map(NodeId)
    }

    pub fn state_count(&self, state: NodeState) -> usize {
        self.graph
            .node_weights()
            .filter(|data| data.state == state)
            .count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(NodeId)
    }

    pub fn subscribe_added(&self) -> broadcast::Receiver<NodeId> {
        self.added_tx.subscribe()
    }

    pub fn subscribe_changed(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changed_tx.subscribe()
    }

    /// A `watch` channel that flips to `true` exactly once, when
    /// [`Self::seal`] is called.
    pub fn subscribe_sealed(&self) -> watch::Receiver<bool> {
        self.sealed_tx.subscribe()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use pretty_assertions::assert_eq;

    fn cmd(name: &str) -> Command {
        Command::builder("/bin/true", name).build()
    }

    #[test]
    fn add_creates_one_node_per_call() {
        let mut g = DependencyGraph::new();
        let a = g.add(cmd("a"), &[], false);
        let b = g.add(cmd("b"), &[a], false);
        assert_eq!(g.dependencies(b).collect::<Vec<_>>(), vec![a]);
        assert_eq!(g.dependents(a).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn monotone_transitions_succeed() {
        let mut g = DependencyGraph::new();
        let a = g.add(cmd("a"), &[], false);
        g.change_state(a, NodeState::Waiting);
        g.change_state(a, NodeState::Enqueuing);
        g.change_state(a, NodeState::Processing);
        g.change_state(a, NodeState::Successful);
        assert_eq!(g.state(a), NodeState::Successful);
        assert_eq!(g.state_count(NodeState::Successful), 1);
    }

    #[test]
    #[should_panic(expected = "scheduler invariant violated")]
    fn transition_away_from_terminal_is_fatal() {
        let mut g = DependencyGraph::new();
        let a = g.add(cmd("a"), &[], false);
        g.change_state(a, NodeState::Successful);
        g.change_state(a, NodeState::Waiting);
    }

    #[test]
    #[should_panic(expected = "scheduler invariant violated")]
    fn same_rank_non_terminal_repeat_is_fatal() {
        let mut g = DependencyGraph::new();
        let a = g.add(cmd("a"), &[], false);
        g.change_state(a, NodeState::Waiting);
        g.change_state(a, NodeState::Waiting);
    }

    #[test]
    fn seal_forbids_further_add() {
        let mut g = DependencyGraph::new();
        g.add(cmd("a"), &[], false);
        g.seal();
        assert!(g.is_sealed());
    }

    #[test]
    #[should_panic]
    fn add_after_seal_is_fatal() {
        let mut g = DependencyGraph::new();
        g.seal();
        g.add(cmd("a"), &[], false);
    }
}
