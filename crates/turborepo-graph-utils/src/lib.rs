#![deny(clippy::all)]
//! petgraph helpers shared by the package graph and the task graph:
//! cycle validation and transitive closures, plus the dependency-ordered
//! `Walker`.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, DfsEvent, Reversed},
};
use thiserror::Error;
pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n{0}")]
    CyclicDependencies(String),
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Validates that the graph is a DAG with no self-edges. Cycles are fatal
/// and reported with their members listed.
pub fn validate_graph<N: Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge references existing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let members = component
                .into_iter()
                .map(|id| graph.node_weight(id).expect("scc references existing node"))
                .format(", ");
            format!("\t{members}")
        })
        .join("\n");

    if cycle_lines.is_empty() {
        Ok(())
    } else {
        Err(Error::CyclicDependencies(cycle_lines))
    }
}

/// All node weights reachable from `indices` following edges in
/// `direction`. The starting nodes are included.
pub fn transitive_closure<N: Hash + Eq, E, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, E>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();
    let mut visitor = |event| {
        if let DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs exists"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, &mut visitor),
        petgraph::Direction::Incoming => {
            depth_first_search(Reversed(&graph), indices, &mut visitor)
        }
    }

    visited
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_dag() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(a, c, ());
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_validate_reports_cycle_members() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cyclic dependency"), "{message}");
        for name in ["a", "b", "c"] {
            assert!(message.contains(name), "{message} missing {name}");
        }
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        assert!(matches!(
            validate_graph(&g),
            Err(Error::SelfDependency(node)) if node == "a"
        ));
    }

    #[test]
    fn test_transitive_closure_directions() {
        // a -> b -> c
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let deps = transitive_closure(&g, Some(a), petgraph::Direction::Outgoing);
        assert_eq!(deps, ["a", "b", "c"].iter().collect());

        let dependents = transitive_closure(&g, Some(c), petgraph::Direction::Incoming);
        assert_eq!(dependents, ["a", "b", "c"].iter().collect());

        let only_b_down = transitive_closure(&g, Some(b), petgraph::Direction::Outgoing);
        assert_eq!(only_b_down, ["b", "c"].iter().collect());
    }
}
