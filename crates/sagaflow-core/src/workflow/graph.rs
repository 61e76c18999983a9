//! Compiled workflow graph: structural validation, cycle detection, reachability.
//!
//! Uses `petgraph` to model the definition's nodes and edges as a directed
//! graph. Topological sort detects cycles and a DFS from the start node
//! detects unreachable nodes. A compiled graph is cached per definition
//! version by the [`super::store::DefinitionStore`].

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sagaflow_types::definition::{Node, NodeKind, WorkflowDefinition};

use super::definition::WorkflowError;

/// A validated, immutable view of a definition's graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: HashMap<String, Node>,
    successors: HashMap<String, Vec<String>>,
    start_id: String,
    topo_order: Vec<String>,
}

impl WorkflowGraph {
    /// Compile and validate a definition's graph.
    ///
    /// Rejects:
    /// - empty or duplicate node IDs
    /// - anything other than exactly one `start` node and at least one `end`
    /// - edges or branch targets that reference unknown nodes, duplicate edges
    /// - `start`/`action` nodes without exactly one outgoing edge
    /// - `end` nodes with outgoing edges
    /// - decision nodes whose outgoing edges differ from branch targets plus default
    /// - `max_retries: 0`
    /// - cycles, and nodes unreachable from `start`
    pub fn compile(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &def.nodes {
            if node.id.trim().is_empty() {
                return Err(WorkflowError::ValidationError(
                    "node id must not be empty".to_string(),
                ));
            }
            if index.contains_key(node.id.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }

        let starts: Vec<&Node> = def
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .collect();
        let start = match starts.as_slice() {
            [only] => *only,
            [] => {
                return Err(WorkflowError::ValidationError(
                    "workflow must have a start node".to_string(),
                ));
            }
            _ => {
                return Err(WorkflowError::ValidationError(format!(
                    "workflow must have exactly one start node, found {}",
                    starts.len()
                )));
            }
        };
        if !def.nodes.iter().any(|n| matches!(n.kind, NodeKind::End)) {
            return Err(WorkflowError::ValidationError(
                "workflow must have at least one end node".to_string(),
            ));
        }

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();
        for edge in &def.edges {
            let from = index.get(edge.source.as_str()).ok_or_else(|| {
                WorkflowError::UnknownNode(format!("edge source '{}'", edge.source))
            })?;
            let to = index.get(edge.target.as_str()).ok_or_else(|| {
                WorkflowError::UnknownNode(format!("edge target '{}'", edge.target))
            })?;
            if !seen_edges.insert((edge.source.as_str(), edge.target.as_str())) {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate edge '{}' -> '{}'",
                    edge.source, edge.target
                )));
            }
            graph.add_edge(*from, *to, ());
            successors
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }

        for node in &def.nodes {
            let outgoing = successors.get(&node.id).map(Vec::len).unwrap_or(0);
            match &node.kind {
                NodeKind::Start | NodeKind::Action(_) if outgoing != 1 => {
                    return Err(WorkflowError::ValidationError(format!(
                        "{} node '{}' must have exactly one outgoing edge, found {}",
                        node.kind.type_name(),
                        node.id,
                        outgoing
                    )));
                }
                NodeKind::End if outgoing != 0 => {
                    return Err(WorkflowError::ValidationError(format!(
                        "end node '{}' must not have outgoing edges",
                        node.id
                    )));
                }
                NodeKind::Action(action) => {
                    if action.action_key.trim().is_empty() {
                        return Err(WorkflowError::ValidationError(format!(
                            "action node '{}' has an empty action_key",
                            node.id
                        )));
                    }
                    if action.max_retries == Some(0) {
                        return Err(WorkflowError::ValidationError(format!(
                            "action node '{}': max_retries must be at least 1",
                            node.id
                        )));
                    }
                }
                NodeKind::Decision(decision) => {
                    if decision.branches.is_empty() && decision.default_target.is_none() {
                        return Err(WorkflowError::ValidationError(format!(
                            "decision node '{}' needs at least one branch or a default",
                            node.id
                        )));
                    }
                    let mut targets: HashSet<&str> = HashSet::new();
                    for target in decision.targets() {
                        if !index.contains_key(target) {
                            return Err(WorkflowError::UnknownNode(format!(
                                "decision '{}' targets '{}'",
                                node.id, target
                            )));
                        }
                        targets.insert(target);
                    }
                    let edges: HashSet<&str> = successors
                        .get(&node.id)
                        .map(|s| s.iter().map(String::as_str).collect())
                        .unwrap_or_default();
                    if edges != targets {
                        return Err(WorkflowError::ValidationError(format!(
                            "decision node '{}' outgoing edges must equal its branch targets plus default",
                            node.id
                        )));
                    }
                }
                _ => {}
            }
        }

        // Topological sort -- detects cycles
        let sorted = toposort(&graph, None).map_err(|cycle| {
            let node_id = graph[cycle.node_id()];
            WorkflowError::CycleDetected(format!("cycle detected involving node '{}'", node_id))
        })?;

        let start_idx = index[start.id.as_str()];
        let mut reachable: HashSet<NodeIndex> = HashSet::new();
        let mut dfs = Dfs::new(&graph, start_idx);
        while let Some(nx) = dfs.next(&graph) {
            reachable.insert(nx);
        }
        if let Some(orphan) = def
            .nodes
            .iter()
            .find(|n| !reachable.contains(&index[n.id.as_str()]))
        {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' is not reachable from start",
                orphan.id
            )));
        }

        let topo_order = sorted.iter().map(|ix| graph[*ix].to_string()).collect();

        Ok(Self {
            nodes: def.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect(),
            successors,
            start_id: start.id.clone(),
            topo_order,
        })
    }

    /// ID of the single start node.
    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The single successor of a `start` or `action` node.
    ///
    /// Returns `None` for `end` nodes, unknown IDs, and decision nodes (which
    /// route by branch instead).
    pub fn successor(&self, id: &str) -> Option<&str> {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeKind::Start) | Some(NodeKind::Action(_)) => self
                .successors
                .get(id)
                .and_then(|s| s.first())
                .map(String::as_str),
            _ => None,
        }
    }

    /// Node IDs in a topological order.
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
