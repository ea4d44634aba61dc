//! Field-reference graph over computed fields. Nodes live in an arena and
//! edges are indices, so ordering and cycle detection never chase names.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Fields forming the cycle, with the first repeated at the end.
    pub cycle: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "formula dependency cycle: {}", self.cycle.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[n]` are the fields node `n` reads.
    deps: Vec<Vec<usize>>,
    /// `dependents[n]` are the fields that read node `n`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from (field, referenced identifiers) pairs. References
    /// that do not name one of the fields are raw attributes and are dropped.
    pub fn build<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let entries: Vec<(String, Vec<String>)> =
            fields.into_iter().map(|(f, r)| (f.into(), r)).collect();
        let mut graph = Self::new();
        for (field, _) in &entries {
            graph.add_node(field);
        }
        for (field, refs) in &entries {
            for r in refs {
                if graph.index.contains_key(r) {
                    graph.add_edge(field, r);
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.deps.push(Vec::new());
        self.dependents.push(Vec::new());
        idx
    }

    /// Record that `dependent` reads `dependency`.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_node(dependent);
        let to = self.add_node(dependency);
        if !self.deps[from].contains(&to) {
            self.deps[from].push(to);
            self.dependents[to].push(from);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fields that directly read `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|&idx| {
                self.dependents[idx]
                    .iter()
                    .map(|&d| self.nodes[d].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Kahn's algorithm; dependencies come before their dependents. Ties are
    /// broken by insertion order so the result is deterministic.
    pub fn topological_order(&self) -> Result<Vec<String>, CycleError> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&n| remaining[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(n) = ready.pop_front() {
            order.push(self.nodes[n].clone());
            for &d in &self.dependents[n] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }
        let stuck: Vec<usize> = (0..self.nodes.len()).filter(|&n| remaining[n] > 0).collect();
        Err(CycleError {
            cycle: self.find_cycle(&stuck),
        })
    }

    /// Walk dependency edges from a node left over by Kahn's algorithm until
    /// a node repeats. Every leftover node has a leftover dependency, so the
    /// walk always closes.
    fn find_cycle(&self, stuck: &[usize]) -> Vec<String> {
        let in_stuck = |n: usize| stuck.contains(&n);
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.deps[current].iter().find(|&&d| in_stuck(d)) else {
                break;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&p| self.nodes[p].clone()).collect();
                cycle.push(self.nodes[next].clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }
        path.iter().map(|&p| self.nodes[p].clone()).collect()
    }
}
