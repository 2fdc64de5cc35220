// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Watches graph state changes and promotes nodes whose dependencies are
//! satisfied.

use crate::graph::{ChangeEvent, DependencyGraph, NodeId, NodeState};
use tokio::sync::broadcast;

/// Subscribes to graph `added`/`changed` events and promotes nodes out of
/// `initialized`/`waiting` once their dependencies are settled.
///
/// This component has no persistent state of its own beyond its
/// subscriptions: every decision it makes is a pure function of the
/// current graph, which is why [`Self::tick`] takes `&mut DependencyGraph`
/// directly rather than caching anything.
pub struct CommandEnqueuer {
    added_rx: broadcast::Receiver<NodeId>,
    changed_rx: broadcast::Receiver<ChangeEvent>,
}

impl CommandEnqueuer {
    pub fn new(graph: &DependencyGraph) -> Self {
        Self {
            added_rx: graph.subscribe_added(),
            changed_rx: graph.subscribe_changed(),
        }
    }

    /// Drains every pending `added`/`changed` event and evaluates the
    /// affected nodes (plus, for a `changed` event, every dependent of
    /// the node that changed, since that's who might now be promotable).
    ///
    /// Returns once both channels are drained. The caller is expected to
    /// call this from its own event loop each time it observes graph
    /// activity (see [`crate::queue::CommandQueue`]).
    pub fn tick(&mut self, graph: &mut DependencyGraph) {
        let mut candidates = Vec::new();

        loop {
            match self.added_rx.try_recv() {
                Ok(node) => candidates.push(node),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }

        loop {
            match self.changed_rx.try_recv() {
                Ok(event) => candidates.extend(graph.dependents(event.node)),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }

        for node in candidates {
            self.evaluate(graph, node);
        }
    }

    fn evaluate(&self, graph: &mut DependencyGraph, node: NodeId) {
        let state = graph.state(node);
        if !matches!(state, NodeState::Initialized | NodeState::Waiting) {
            return;
        }

        let deps: Vec<NodeId> = graph.dependencies(node).collect();
        let all_terminal = deps.iter().all(|&d| graph.state(d).is_terminal());
        if !all_terminal {
            if state == NodeState::Initialized {
                graph.change_state(node, NodeState::Waiting);
            }
            return;
        }

        let all_successful = deps.iter().all(|&d| graph.state(d) == NodeState::Successful);
        let any_unrunnable = deps
            .iter()
            .any(|&d| matches!(graph.state(d), NodeState::Failed | NodeState::UnableToRun));

        if all_successful || (graph.is_timing_dependency(node) && all_terminal) {
            graph.change_state(node, NodeState::Enqueuing);
        } else if any_unrunnable && !graph.is_timing_dependency(node) {
            if state == NodeState::Initialized {
                graph.change_state(node, NodeState::Waiting);
            }
            graph.change_state(node, NodeState::UnableToRun);
        } else if state == NodeState::Initialized {
            graph.change_state(node, NodeState::Waiting);
        }
    }
}
