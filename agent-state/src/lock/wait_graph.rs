//! Wait-for graph between operations.
//!
//! Nodes are operation ids; an edge `w → h` means operation `w` is blocked on
//! a lock held by `h`. The graph is rebuilt from the lock table at each
//! blocked acquire, so edges always reflect current holders.

use petgraph::algo::{all_simple_paths, has_path_connecting};
use petgraph::graphmap::DiGraphMap;

/// Directed wait-for graph borrowed from the lock table.
#[derive(Debug, Default)]
pub struct WaitForGraph<'a> {
    graph: DiGraphMap<&'a str, ()>,
}

impl<'a> WaitForGraph<'a> {
    pub fn new() -> Self {
        Self {
            graph: DiGraphMap::new(),
        }
    }

    /// Record that `waiter` is blocked on `holder`. Self-waits are ignored.
    pub fn add_wait(&mut self, waiter: &'a str, holder: &'a str) {
        if waiter != holder {
            self.graph.add_edge(waiter, holder, ());
        }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Cycle that would close if `waiter` started waiting on `holders`.
    ///
    /// Returned as `[waiter, holder, .., waiter]`.
    pub fn cycle_through(&self, waiter: &'a str, holders: &[&'a str]) -> Option<Vec<String>> {
        if !self.graph.contains_node(waiter) {
            return None;
        }
        holders
            .iter()
            .copied()
            .filter(|holder| *holder != waiter && self.graph.contains_node(*holder))
            .find(|holder| has_path_connecting(&self.graph, *holder, waiter, None))
            .and_then(|holder| {
                all_simple_paths::<Vec<&str>, _>(&self.graph, holder, waiter, 0, None)
                    .next()
                    .map(|path| {
                        std::iter::once(waiter)
                            .chain(path)
                            .map(str::to_string)
                            .collect()
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_party_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait("op-a", "op-b");
        let cycle = graph.cycle_through("op-b", &["op-a"]).unwrap();
        assert_eq!(cycle, vec!["op-b", "op-a", "op-b"]);
    }

    #[test]
    fn test_three_party_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait("op-a", "op-b");
        graph.add_wait("op-b", "op-c");
        let cycle = graph.cycle_through("op-c", &["op-a"]).unwrap();
        assert_eq!(cycle, vec!["op-c", "op-a", "op-b", "op-c"]);
    }

    #[test]
    fn test_chain_without_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait("op-a", "op-b");
        graph.add_wait("op-b", "op-c");
        assert!(graph.cycle_through("op-d", &["op-a"]).is_none());
        assert!(graph.cycle_through("op-a", &["op-c"]).is_none());
    }

    #[test]
    fn test_self_wait_ignored() {
        let mut graph = WaitForGraph::new();
        graph.add_wait("op-a", "op-a");
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.cycle_through("op-a", &["op-a"]).is_none());
    }
}
