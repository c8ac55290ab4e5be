//! Dependency graph: flat adjacency maps, cycle detection and a stable
//! topological order.
//!
//! Task state is referenced by identifier only; the graph never holds a
//! pointer back into scheduler state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{TasklyError, TasklyResult};

/// One dependency declaration: `identifier` runs after every entry of
/// `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DependencyEdge {
    /// The dependent task
    pub identifier: String,
    /// Tasks that must complete first
    pub depends_on: Vec<String>,
}

impl DependencyEdge {
    /// Convenience constructor.
    pub fn new<S: Into<String>>(identifier: S, depends_on: Vec<String>) -> Self {
        Self {
            identifier: identifier.into(),
            depends_on,
        }
    }
}

/// Forward and reverse adjacency over a batch's identifiers.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// id → its dependencies (predecessors)
    forward: HashMap<String, Vec<String>>,
    /// id → its dependents (successors)
    reverse: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate the graph for a batch.
    ///
    /// `ordered_ids` lists every identifier in submission order. Edges
    /// referring to identifiers outside the batch and cyclic declarations
    /// are validation errors.
    pub fn build(edges: &[DependencyEdge], ordered_ids: &[String]) -> TasklyResult<Self> {
        let known: HashSet<&str> = ordered_ids.iter().map(String::as_str).collect();
        let mut graph = Self::default();
        for id in ordered_ids {
            graph.forward.entry(id.clone()).or_default();
            graph.reverse.entry(id.clone()).or_default();
        }

        for edge in edges {
            if !known.contains(edge.identifier.as_str()) {
                return Err(TasklyError::validation(format!(
                    "dependency declared for unknown task: {}",
                    edge.identifier
                )));
            }
            for dep in &edge.depends_on {
                if !known.contains(dep.as_str()) {
                    return Err(TasklyError::validation(format!(
                        "task {} depends on unknown task: {dep}",
                        edge.identifier
                    )));
                }
                if dep == &edge.identifier {
                    return Err(TasklyError::validation(format!(
                        "task {} depends on itself",
                        edge.identifier
                    )));
                }
                let deps = graph.forward.entry(edge.identifier.clone()).or_default();
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                    graph
                        .reverse
                        .entry(dep.clone())
                        .or_default()
                        .push(edge.identifier.clone());
                }
            }
        }

        graph.check_acyclic(ordered_ids)?;
        Ok(graph)
    }

    /// Dependencies (predecessors) of a task.
    pub fn dependencies_of(&self, identifier: &str) -> &[String] {
        self.forward
            .get(identifier)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Dependents (successors) of a task.
    pub fn dependents_of(&self, identifier: &str) -> &[String] {
        self.reverse
            .get(identifier)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any task declares dependencies.
    pub fn has_edges(&self) -> bool {
        self.forward.values().any(|deps| !deps.is_empty())
    }

    /// DFS coloring; a back-edge into the gray set is a cycle.
    fn check_acyclic(&self, ordered_ids: &[String]) -> TasklyResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks: HashMap<&str, Mark> = ordered_ids
            .iter()
            .map(|id| (id.as_str(), Mark::White))
            .collect();

        // Iterative DFS; the explicit stack distinguishes enter/exit.
        for root in ordered_ids {
            if marks[root.as_str()] != Mark::White {
                continue;
            }
            let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];
            while let Some((node, exiting)) = stack.pop() {
                if exiting {
                    marks.insert(node, Mark::Black);
                    continue;
                }
                if marks[node] == Mark::Black {
                    continue;
                }
                marks.insert(node, Mark::Gray);
                stack.push((node, true));
                for dep in self.dependencies_of(node) {
                    match marks[dep.as_str()] {
                        Mark::Gray => {
                            return Err(TasklyError::validation(format!(
                                "dependency cycle detected involving task: {dep}"
                            )));
                        }
                        Mark::White => stack.push((dep.as_str(), false)),
                        Mark::Black => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Topological order, stable by submission index.
    ///
    /// Kahn's algorithm over a `BTreeSet` keyed by `(index, id)` so that
    /// among simultaneously-ready tasks the earliest submitted comes
    /// first. Assumes `check_acyclic` already passed.
    pub fn topological_order(&self, ordered_ids: &[String]) -> Vec<String> {
        let index_of: HashMap<&str, usize> = ordered_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut remaining_deps: HashMap<&str, usize> = ordered_ids
            .iter()
            .map(|id| (id.as_str(), self.dependencies_of(id).len()))
            .collect();

        let mut ready: BTreeSet<(usize, &str)> = remaining_deps
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| (index_of[id], *id))
            .collect();

        let mut order = Vec::with_capacity(ordered_ids.len());
        while let Some(&(index, id)) = ready.iter().next() {
            ready.remove(&(index, id));
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                let count = remaining_deps.get_mut(dependent.as_str()).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert((index_of[dependent.as_str()], dependent.as_str()));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_and_query() {
        let edges = vec![DependencyEdge::new("b", vec!["a".into()])];
        let graph = DependencyGraph::build(&edges, &ids(&["a", "b"])).unwrap();
        assert_eq!(graph.dependencies_of("b"), ["a".to_string()]);
        assert_eq!(graph.dependents_of("a"), ["b".to_string()]);
        assert!(graph.dependencies_of("a").is_empty());
        assert!(graph.has_edges());
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let edges = vec![DependencyEdge::new("b", vec!["ghost".into()])];
        let err = DependencyGraph::build(&edges, &ids(&["a", "b"])).unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let edges = vec![DependencyEdge::new("a", vec!["a".into()])];
        assert!(DependencyGraph::build(&edges, &ids(&["a"])).is_err());
    }

    #[test]
    fn test_cycle_detection() {
        let edges = vec![
            DependencyEdge::new("a", vec!["c".into()]),
            DependencyEdge::new("b", vec!["a".into()]),
            DependencyEdge::new("c", vec!["b".into()]),
        ];
        let err = DependencyGraph::build(&edges, &ids(&["a", "b", "c"])).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let edges = vec![
            DependencyEdge::new("b", vec!["a".into()]),
            DependencyEdge::new("c", vec!["a".into()]),
            DependencyEdge::new("d", vec!["b".into(), "c".into()]),
        ];
        let graph = DependencyGraph::build(&edges, &ids(&["a", "b", "c", "d"])).unwrap();
        let order = graph.topological_order(&ids(&["a", "b", "c", "d"]));
        assert_eq!(order, ids(&["a", "b", "c", "d"]));
    }

    #[test]
    fn test_topological_order_is_stable_by_submission() {
        // c has no deps and was submitted first, so it stays first even
        // though a and b are also immediately ready.
        let edges = vec![DependencyEdge::new("a", vec!["b".into()])];
        let graph = DependencyGraph::build(&edges, &ids(&["c", "a", "b"])).unwrap();
        let order = graph.topological_order(&ids(&["c", "a", "b"]));
        assert_eq!(order, ids(&["c", "b", "a"]));
    }
}
