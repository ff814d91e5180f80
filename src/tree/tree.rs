//! Process tree built from the event stream.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. The pid map
//! always points at the most recently started process for a pid; a node
//! replaced by pid reuse stays reachable through its parent's invocations
//! (or the root list) and is never removed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::process::TracedProcess;
use crate::event::{ProcessEvent, ProcessInfo};
use crate::Pid;

/// Index of a node in a [`ProcessTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A spawn attempt that did not produce a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedInvocation {
    pub timestamp: DateTime<Utc>,
    pub exe_path: Option<String>,
    pub command_line: Option<String>,
}

/// One spawn attempt by a process, in the order they were reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Started(NodeId),
    Failed(FailedInvocation),
}

/// A process and its place in the hierarchy.
#[derive(Debug, Clone)]
pub struct Node {
    process: TracedProcess,
    parent: Option<NodeId>,
    depth: u32,
    invocations: Vec<Invocation>,
}

impl Node {
    pub fn process(&self) -> &TracedProcess {
        &self.process
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Distance from the root, roots are at depth 0.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    /// Successfully started children, in start order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.invocations.iter().filter_map(|invocation| match invocation {
            Invocation::Started(id) => Some(*id),
            Invocation::Failed(_) => None,
        })
    }

    pub fn failed_invocations(&self) -> impl Iterator<Item = &FailedInvocation> + '_ {
        self.invocations.iter().filter_map(|invocation| match invocation {
            Invocation::Started(_) => None,
            Invocation::Failed(failed) => Some(failed),
        })
    }
}

/// Structural or state change caused by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeChange {
    RootAdded { node: NodeId, pid: Pid },
    ChildAdded { parent: NodeId, node: NodeId, pid: Pid },
    FailedInvocationAdded { node: NodeId, pid: Pid },
    /// Exit code or end time recorded.
    ProcessUpdated { node: NodeId, pid: Pid },
}

/// Hierarchy of traced processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessTree {
    nodes: Vec<Node>,
    live: HashMap<Pid, NodeId>,
    roots: Vec<NodeId>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event and report what changed.
    pub fn handle_event(&mut self, event: &ProcessEvent) -> Vec<TreeChange> {
        match event {
            // a client may connect only to check that the collector is up
            ProcessEvent::Attach { .. } => Vec::new(),
            ProcessEvent::Info(info) => vec![self.insert(info.clone())],
            ProcessEvent::Exit {
                pid,
                timestamp,
                exit_code,
            } => self.record_exit(*pid, *timestamp, *exit_code).into_iter().collect(),
            ProcessEvent::Detach { pid, timestamp } => {
                self.record_detach(*pid, *timestamp).into_iter().collect()
            }
            ProcessEvent::CreateFailure {
                pid,
                timestamp,
                exe_path,
                command_line,
            } => {
                let failed = FailedInvocation {
                    timestamp: *timestamp,
                    exe_path: exe_path.clone(),
                    command_line: command_line.clone(),
                };
                self.record_failure(*pid, failed).into_iter().collect()
            }
        }
    }

    /// Record a started process, replacing any live entry for its pid.
    fn insert(&mut self, info: ProcessInfo) -> TreeChange {
        let pid = info.pid;
        let parent = self.live.get(&info.parent_pid).copied();
        let (process, depth) = match parent {
            Some(parent_id) => {
                let parent_node = &self.nodes[parent_id.0];
                let process = TracedProcess::new(info, Some(parent_node.process.environment()));
                (process, parent_node.depth + 1)
            }
            None => (TracedProcess::new(info, None), 0),
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            process,
            parent,
            depth,
            invocations: Vec::new(),
        });

        if let Some(stale) = self.live.insert(pid, id) {
            tracing::debug!("[{}] pid reused, node {} is no longer live", pid, stale.0);
        }

        match parent {
            Some(parent_id) => {
                self.nodes[parent_id.0]
                    .invocations
                    .push(Invocation::Started(id));
                TreeChange::ChildAdded {
                    parent: parent_id,
                    node: id,
                    pid,
                }
            }
            None => {
                self.roots.push(id);
                TreeChange::RootAdded { node: id, pid }
            }
        }
    }

    fn record_exit(&mut self, pid: Pid, timestamp: DateTime<Utc>, exit_code: i32) -> Option<TreeChange> {
        let Some(id) = self.live.get(&pid).copied() else {
            tracing::warn!("[{}] exit code {} for an unknown process", pid, exit_code);
            return None;
        };
        let process = &mut self.nodes[id.0].process;

        match process.exit_code() {
            Some(existing) if existing != exit_code => {
                tracing::warn!(
                    "[{}] second exit with code {} ignored, already exited with {}",
                    pid,
                    exit_code,
                    existing
                );
                None
            }
            Some(_) => None,
            None => {
                process.set_exit_code(exit_code);
                process.set_end_time_if_absent(timestamp);
                Some(TreeChange::ProcessUpdated { node: id, pid })
            }
        }
    }

    fn record_detach(&mut self, pid: Pid, timestamp: DateTime<Utc>) -> Option<TreeChange> {
        // unknown pids never sent Info, nothing to update
        let id = self.live.get(&pid).copied()?;
        self.nodes[id.0]
            .process
            .set_end_time_if_absent(timestamp)
            .then_some(TreeChange::ProcessUpdated { node: id, pid })
    }

    fn record_failure(&mut self, pid: Pid, failed: FailedInvocation) -> Option<TreeChange> {
        let Some(id) = self.live.get(&pid).copied() else {
            tracing::debug!("[{}] spawn failure from an unknown process ignored", pid);
            return None;
        };
        self.nodes[id.0].invocations.push(Invocation::Failed(failed));
        Some(TreeChange::FailedInvocationAdded { node: id, pid })
    }

    /// Most recently started process with this pid.
    pub fn get_process(&self, pid: Pid) -> Option<&TracedProcess> {
        self.node_for_pid(pid).map(|id| &self.nodes[id.0].process)
    }

    /// Live node for a pid.
    pub fn node_for_pid(&self, pid: Pid) -> Option<NodeId> {
        self.live.get(&pid).copied()
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Processes without a traced parent, in start order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.get(id.0).into_iter().flat_map(|node| node.children())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(Node::parent)
    }

    /// Every node ever recorded, stale ones included, in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index), node))
    }

    /// Number of nodes ever recorded.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
