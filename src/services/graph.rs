use crate::domain::{ConfigError, ContainerSpec};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// Link graph over one environment's containers.
///
/// Edges point from a dependency to its dependent, so a topological sort
/// yields dependencies first.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a container node; adding the same name twice returns the same node.
    pub fn add_container(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), idx);
        idx
    }

    /// Records that `dependent` links to `dependency`.
    pub fn add_dependency(&mut self, dependent: NodeIndex, dependency: NodeIndex) {
        self.graph.add_edge(dependency, dependent, ());
    }

    /// Returns container names with every dependency before its dependents.
    pub fn resolve_order(&self) -> Result<Vec<String>, ConfigError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .map_err(|cycle| ConfigError::DependencyCycle {
                container: self.graph[cycle.node_id()].clone(),
            })
    }
}

/// Orders `specs` so that every container starts after the containers it
/// links to. All link targets must be part of `specs`.
pub fn start_order(specs: &[Arc<ContainerSpec>]) -> Result<Vec<Arc<ContainerSpec>>, ConfigError> {
    let mut graph = DependencyGraph::new();
    for spec in specs {
        graph.add_container(&spec.name);
    }
    for spec in specs {
        let dependent = graph.add_container(&spec.name);
        for dependency in spec.dependencies() {
            let dependency = graph.add_container(dependency);
            graph.add_dependency(dependent, dependency);
        }
    }

    let by_name: HashMap<&str, &Arc<ContainerSpec>> =
        specs.iter().map(|spec| (spec.name.as_str(), spec)).collect();

    Ok(graph
        .resolve_order()?
        .iter()
        .filter_map(|name| by_name.get(name.as_str()).map(|spec| Arc::clone(spec)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImageRef, Link};

    fn spec(name: &str, links: &[&str]) -> Arc<ContainerSpec> {
        let mut spec = ContainerSpec::new(name, ImageRef::parse("alpine").unwrap());
        spec.links = links.iter().map(|l| l.parse::<Link>().unwrap()).collect();
        Arc::new(spec)
    }

    fn names(specs: &[Arc<ContainerSpec>]) -> Vec<&str> {
        specs.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn empty_graph_resolves_to_empty() {
        let graph = DependencyGraph::new();
        assert!(graph.resolve_order().unwrap().is_empty());
    }

    #[test]
    fn dependency_starts_before_dependent() {
        let order = start_order(&[spec("web", &["db"]), spec("db", &[])]).unwrap();
        assert_eq!(names(&order), vec!["db", "web"]);
    }

    #[test]
    fn diamond_dependency() {
        let order = start_order(&[
            spec("app", &["api", "worker"]),
            spec("api", &["db"]),
            spec("worker", &["db"]),
            spec("db", &[]),
        ])
        .unwrap();

        assert_eq!(order.len(), 4);
        let pos = |name: &str| order.iter().position(|s| s.name == name).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("db") < pos("worker"));
        assert!(pos("api") < pos("app"));
        assert!(pos("worker") < pos("app"));
    }

    #[test]
    fn aliased_links_still_order_by_target() {
        let order = start_order(&[spec("web", &["db:database"]), spec("db", &[])]).unwrap();
        assert_eq!(names(&order), vec!["db", "web"]);
    }

    #[test]
    fn detects_cycle() {
        let err = start_order(&[spec("a", &["b"]), spec("b", &["a"])]).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn detects_self_link() {
        let err = start_order(&[spec("a", &["a"])]).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle { ref container } if container == "a"));
    }

    #[test]
    fn independent_containers_all_present() {
        let order = start_order(&[spec("x", &[]), spec("y", &[]), spec("z", &[])]).unwrap();
        let mut got = names(&order);
        got.sort();
        assert_eq!(got, vec!["x", "y", "z"]);
    }
}
