//! Call graph model.
//!
//! Describes a tree of contract calls (sync edges, async edges with their
//! callbacks, group and context callbacks) and derives the order in which
//! the host executes it when everything stays in one shard. Nodes live in
//! an arena and are referenced by [`NodeId`]; parent lookups are derived
//! from the edge list.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::MAX_CALL_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Callback set on a node for a group or for its whole context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSpec {
    pub function: String,
    pub gas: u64,
}

/// A contract function and what it costs by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNode {
    pub contract: String,
    pub function: String,
    pub gas_used: u64,
    /// Signals a user error after charging its gas, before any outgoing call.
    pub fails: bool,
    pub group_callbacks: BTreeMap<String, CallbackSpec>,
    pub context_callback: Option<CallbackSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    Sync {
        gas_limit: u64,
    },
    Async {
        group: String,
        gas_limit: u64,
        gas_locked: u64,
        success_callback: String,
        error_callback: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallGraphError {
    #[error("Call graph has no start node")]
    MissingStart,

    #[error("Callback {contract}.{function} is not a node of the graph")]
    UnknownCallback { contract: String, function: String },

    #[error("Call graph deeper than {0}")]
    TooDeep(usize),
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    nodes: Vec<CallNode>,
    edges: Vec<CallEdge>,
    start: Option<NodeId>,
}

/// Pending step of the traversal.
enum Work {
    Run(NodeId, usize),
    Callback { contract: String, function: String, depth: usize },
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `contract.function`, created on first use.
    pub fn add_node(&mut self, contract: &str, function: &str, gas_used: u64) -> NodeId {
        if let Some(id) = self.find_node(contract, function) {
            self.nodes[id.0].gas_used = gas_used;
            return id;
        }
        self.nodes.push(CallNode {
            contract: contract.to_string(),
            function: function.to_string(),
            gas_used,
            fails: false,
            group_callbacks: BTreeMap::new(),
            context_callback: None,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn find_node(&self, contract: &str, function: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.contract == contract && node.function == function)
            .map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> &CallNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CallNode {
        &mut self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[CallNode] {
        &self.nodes
    }

    pub fn set_start(&mut self, id: NodeId) {
        self.start = Some(id);
    }

    pub fn start(&self) -> Option<NodeId> {
        self.start
    }

    pub fn add_sync_edge(&mut self, from: NodeId, to: NodeId, gas_limit: u64) {
        self.edges.push(CallEdge {
            from,
            to,
            kind: EdgeKind::Sync { gas_limit },
        });
    }

    pub fn add_async_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.edges.push(CallEdge { from, to, kind });
    }

    /// Attach a group callback to `node`; returns the callback's node.
    pub fn set_group_callback(&mut self, node: NodeId, group: &str, function: &str, gas: u64, gas_used: u64) -> NodeId {
        let contract = self.nodes[node.0].contract.clone();
        let callback = self.add_node(&contract, function, gas_used);
        self.nodes[node.0].group_callbacks.insert(
            group.to_string(),
            CallbackSpec {
                function: function.to_string(),
                gas,
            },
        );
        callback
    }

    /// Attach the context callback to `node`; returns the callback's node.
    pub fn set_context_callback(&mut self, node: NodeId, function: &str, gas: u64, gas_used: u64) -> NodeId {
        let contract = self.nodes[node.0].contract.clone();
        let callback = self.add_node(&contract, function, gas_used);
        self.nodes[node.0].context_callback = Some(CallbackSpec {
            function: function.to_string(),
            gas,
        });
        callback
    }

    /// Outgoing edges of `id`, in insertion order.
    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &CallEdge> {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|edge| edge.to == id)
            .map(|edge| edge.from)
            .collect()
    }

    pub fn contracts(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|node| node.contract.as_str()).collect()
    }

    /// Nodes in the order the host runs them when every call is local.
    ///
    /// A node runs, then its sync edges in order (each expanding fully),
    /// then its async calls grouped by group in order of first appearance,
    /// each followed by the callback its outcome selects, then the group
    /// callback once the group is done, and the context callback last.
    pub fn execution_order(&self) -> Result<Vec<NodeId>, CallGraphError> {
        let start = self.start.ok_or(CallGraphError::MissingStart)?;
        let mut order = Vec::new();
        let mut worklist = vec![Work::Run(start, 0)];

        while let Some(work) = worklist.pop() {
            let (id, depth) = match work {
                Work::Run(id, depth) => (id, depth),
                Work::Callback {
                    contract,
                    function,
                    depth,
                } => {
                    let id = self
                        .find_node(&contract, &function)
                        .ok_or(CallGraphError::UnknownCallback { contract, function })?;
                    (id, depth)
                }
            };
            if depth >= MAX_CALL_DEPTH {
                return Err(CallGraphError::TooDeep(MAX_CALL_DEPTH));
            }
            order.push(id);
            let node = self.node(id);
            if node.fails {
                continue;
            }

            // Pushed in reverse so the worklist pops them in run order.
            let mut steps = Vec::new();
            for edge in self.outgoing(id) {
                if let EdgeKind::Sync { .. } = edge.kind {
                    steps.push(Work::Run(edge.to, depth + 1));
                }
            }
            for group in self.async_groups(id) {
                for edge in self.outgoing(id) {
                    let EdgeKind::Async {
                        group: edge_group,
                        success_callback,
                        error_callback,
                        ..
                    } = &edge.kind
                    else {
                        continue;
                    };
                    if edge_group != &group {
                        continue;
                    }
                    steps.push(Work::Run(edge.to, depth + 1));
                    let callback = if self.node(edge.to).fails {
                        error_callback
                    } else {
                        success_callback
                    };
                    if !callback.is_empty() {
                        steps.push(Work::Callback {
                            contract: node.contract.clone(),
                            function: callback.clone(),
                            depth: depth + 1,
                        });
                    }
                }
                if let Some(callback) = node.group_callbacks.get(&group) {
                    steps.push(Work::Callback {
                        contract: node.contract.clone(),
                        function: callback.function.clone(),
                        depth: depth + 1,
                    });
                }
            }
            if let Some(callback) = &node.context_callback {
                steps.push(Work::Callback {
                    contract: node.contract.clone(),
                    function: callback.function.clone(),
                    depth: depth + 1,
                });
            }
            worklist.extend(steps.into_iter().rev());
        }
        Ok(order)
    }

    /// Groups of `id`'s async edges in order of first appearance.
    pub fn async_groups(&self, id: NodeId) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for edge in self.outgoing(id) {
            if let EdgeKind::Async { group, .. } = &edge.kind {
                if !groups.contains(group) {
                    groups.push(group.clone());
                }
            }
        }
        groups
    }

    /// Gas used by the whole graph under a zero-cost schedule, for graphs
    /// where no node fails.
    pub fn expected_gas_used(&self) -> Result<u64, CallGraphError> {
        Ok(self
            .execution_order()?
            .into_iter()
            .map(|id| self.node(id).gas_used)
            .sum())
    }
}
