use crate::types::AgentLoader;
use conductor_core::{ConductorError, ConductorResult};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// One schedulable agent and the names it depends on.
pub struct AgentNode {
    pub name: String,
    pub dependencies: Vec<String>,
    loader: Arc<dyn AgentLoader>,
    /// Position in registration order, used to break ties.
    seq: usize,
}

impl AgentNode {
    pub fn loader(&self) -> Arc<dyn AgentLoader> {
        self.loader.clone()
    }
}

impl std::fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentNode")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// The agent dependency relation.
///
/// The execution order is cached after a successful build and dropped on the
/// next registration; it is always recomputed from the current edge set.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, AgentNode>,
    registration: Vec<String>,
    execution_order: Option<Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Dependencies may name agents registered later.
    pub fn register_agent(
        &mut self,
        name: impl Into<String>,
        loader: Arc<dyn AgentLoader>,
        dependencies: &[&str],
    ) -> ConductorResult<()> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(ConductorError::DuplicateAgent(name));
        }

        let mut seen = HashSet::new();
        let dependencies: Vec<String> = dependencies
            .iter()
            .filter(|d| seen.insert(**d))
            .map(|d| (*d).to_string())
            .collect();

        let seq = self.registration.len();
        self.registration.push(name.clone());
        self.nodes.insert(
            name.clone(),
            AgentNode {
                name,
                dependencies,
                loader,
                seq,
            },
        );
        self.execution_order = None;
        Ok(())
    }

    /// Topologically sort every registered node, breaking ties by
    /// registration order, and cache the result.
    pub fn build_execution_order(&mut self) -> ConductorResult<Vec<String>> {
        if let Some(order) = &self.execution_order {
            return Ok(order.clone());
        }
        self.check_dependencies_known()?;
        let order = self.kahn()?;
        self.execution_order = Some(order.clone());
        Ok(order)
    }

    /// The cached order from the last successful build, if still valid.
    pub fn cached_execution_order(&self) -> Option<&[String]> {
        self.execution_order.as_deref()
    }

    /// The execution order restricted to `targets` and everything they
    /// transitively depend on.
    pub fn execution_order_for(&mut self, targets: &[String]) -> ConductorResult<Vec<String>> {
        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for target in targets {
            let Some(node) = self.nodes.get(target) else {
                return Err(ConductorError::UnknownAgent(target.clone()));
            };
            stack.push(&node.name);
        }
        while let Some(name) = stack.pop() {
            if !wanted.insert(name) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                stack.extend(node.dependencies.iter().map(String::as_str));
            }
        }
        let wanted: HashSet<String> = wanted.into_iter().map(str::to_string).collect();

        let order = self.build_execution_order()?;
        Ok(order.into_iter().filter(|n| wanted.contains(n)).collect())
    }

    /// Non-failing cycle check. Unknown dependencies are ignored.
    pub fn has_circular_dependencies(&self) -> bool {
        self.kahn().is_err()
    }

    /// Every agent that transitively depends on `name`, in registration order.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let reverse = self.reverse_edges();
        let mut found: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for dependent in reverse.get(current).into_iter().flatten() {
                if found.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }
        self.registration
            .iter()
            .filter(|n| found.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// Direct dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.nodes.get(name).map(|n| n.dependencies.as_slice())
    }

    pub fn get(&self, name: &str) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Agent names in registration order.
    pub fn agent_names(&self) -> &[String] {
        &self.registration
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `(agent, dependency)` pairs whose dependency was never registered, in
    /// registration order.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        self.registration
            .iter()
            .flat_map(|name| {
                self.nodes[name]
                    .dependencies
                    .iter()
                    .filter(|d| !self.nodes.contains_key(*d))
                    .map(move |d| (name.clone(), d.clone()))
            })
            .collect()
    }

    fn check_dependencies_known(&self) -> ConductorResult<()> {
        match self.missing_dependencies().into_iter().next() {
            Some((agent, dependency)) => {
                Err(ConductorError::UnknownDependency { agent, dependency })
            }
            None => Ok(()),
        }
    }

    fn reverse_edges(&self) -> HashMap<&str, Vec<&str>> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &self.registration {
            for dep in &self.nodes[name].dependencies {
                reverse.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }
        reverse
    }

    /// Kahn's algorithm. The ready set is ordered by registration sequence so
    /// identical input always yields identical output.
    fn kahn(&self) -> ConductorResult<Vec<String>> {
        let reverse = self.reverse_edges();
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| {
                let known = n
                    .dependencies
                    .iter()
                    .filter(|d| self.nodes.contains_key(*d))
                    .count();
                (n.name.as_str(), known)
            })
            .collect();

        let mut ready: BTreeSet<(usize, &str)> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&name, _)| (self.nodes[name].seq, name))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, name)) = ready.pop_first() {
            order.push(name.to_string());
            for dependent in reverse.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((self.nodes[*dependent].seq, *dependent));
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let remaining: HashSet<&str> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n)
            .collect();
        Err(ConductorError::CircularDependency(self.trace_cycle(&remaining)))
    }

    /// Walk dependency edges among the nodes Kahn could not remove until a
    /// node repeats. Every such node has a remaining dependency, so the walk
    /// always closes a cycle.
    fn trace_cycle(&self, remaining: &HashSet<&str>) -> Vec<String> {
        let Some(start) = self
            .registration
            .iter()
            .find(|n| remaining.contains(n.as_str()))
        else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if let Some(pos) = path.iter().position(|n| *n == current) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);
            let next = self.nodes[current]
                .dependencies
                .iter()
                .find(|d| remaining.contains(d.as_str()));
            match next {
                Some(next) => current = next.as_str(),
                None => return remaining_sorted(self, remaining),
            }
        }
    }
}

fn remaining_sorted(graph: &DependencyGraph, remaining: &HashSet<&str>) -> Vec<String> {
    graph
        .registration
        .iter()
        .filter(|n| remaining.contains(n.as_str()))
        .cloned()
        .collect()
}
