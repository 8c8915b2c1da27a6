use std::collections::{HashMap, HashSet};

use undoable_types::{WorkflowEdge, WorkflowNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    DuplicateNodeId(String),
    UnknownEdgeEndpoint { from: String, to: String },
    CycleDetected { path: Vec<String> },
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNodeId(id) => write!(f, "node id `{id}` already exists"),
            Self::UnknownEdgeEndpoint { from, to } => {
                write!(f, "edge `{from}` -> `{to}` references an unknown node")
            }
            Self::CycleDetected { path } => {
                write!(f, "cycle detected in edge set: {}", path.join(" -> "))
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Rejected mutations leave the workflow unchanged, so validation runs over
/// the candidate node/edge sets before anything is committed.
pub fn validate_graph(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> Result<(), WorkflowError> {
    let mut ids = HashSet::new();
    for node in nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
        }
    }
    for edge in edges {
        if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
            return Err(WorkflowError::UnknownEdgeEndpoint {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
    }
    if let Some(path) = detect_cycle(nodes, edges) {
        return Err(WorkflowError::CycleDetected { path });
    }
    Ok(())
}

pub fn detect_cycle(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> Option<Vec<String>> {
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    let mut visited = HashSet::new();
    for node in nodes {
        let mut path = Vec::new();
        if dfs_cycle(node.id.as_str(), &outgoing, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    node_id: &str,
    outgoing: &HashMap<&str, Vec<&str>>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|seen| seen == node_id) {
        path.push(node_id.to_string());
        return true;
    }
    if visited.contains(node_id) {
        return false;
    }
    visited.insert(node_id.to_string());
    path.push(node_id.to_string());
    if let Some(children) = outgoing.get(node_id) {
        for child in children {
            if dfs_cycle(child, outgoing, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use undoable_types::{NodeSchedule, NodeType};

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            name: id.to_uppercase(),
            node_type: NodeType::AgentTask,
            prompt: None,
            agent_id: None,
            skill_refs: Vec::new(),
            schedule: NodeSchedule::Dependency,
            enabled: true,
            job_id: None,
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let nodes = vec![node("a"), node("a")];
        assert!(matches!(
            validate_graph(&nodes, &[]),
            Err(WorkflowError::DuplicateNodeId(_))
        ));
    }

    #[test]
    fn dangling_edges_are_rejected() {
        let nodes = vec![node("a")];
        assert!(matches!(
            validate_graph(&nodes, &[edge("a", "ghost")]),
            Err(WorkflowError::UnknownEdgeEndpoint { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected_with_a_path() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("c", "a")];
        match validate_graph(&nodes, &edges) {
            Err(WorkflowError::CycleDetected { path }) => {
                assert!(path.len() >= 4);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn diamonds_are_fine() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let edges = vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")];
        assert!(validate_graph(&nodes, &edges).is_ok());
    }
}
