//! Static dependency ordering between services.
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::Service;
use crate::error::StackError;

/// Dependency graph over the declared services.
///
/// Services are stored in declaration order; `edges[i]` holds the indices
/// service `i` depends on and `reverse[i]` the indices that depend on it.
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    services: Vec<Service>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
    reverse: Vec<Vec<usize>>,
}

impl ServiceGraph {
    /// Builds the graph, rejecting unknown dependencies and cycles.
    pub fn new(services: Vec<Service>) -> Result<Self, StackError> {
        let mut index = HashMap::with_capacity(services.len());
        for (position, service) in services.iter().enumerate() {
            if index.insert(service.name.clone(), position).is_some() {
                return Err(StackError::Config(format!(
                    "service '{}' is declared more than once",
                    service.name
                )));
            }
        }

        let mut edges = vec![Vec::new(); services.len()];
        let mut reverse = vec![Vec::new(); services.len()];
        for (position, service) in services.iter().enumerate() {
            for dependency in &service.depends_on {
                let Some(&target) = index.get(dependency) else {
                    return Err(StackError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if !edges[position].contains(&target) {
                    edges[position].push(target);
                    reverse[target].push(position);
                }
            }
        }

        let graph = Self {
            services,
            index,
            edges,
            reverse,
        };
        graph.topological_order()?;
        Ok(graph)
    }

    /// Orders services so each follows all of its dependencies.
    ///
    /// Independent services keep their declaration order.
    pub fn topological_order(&self) -> Result<Vec<&Service>, StackError> {
        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| position)
            .collect();

        let mut order = Vec::with_capacity(self.services.len());
        while let Some(next) = ready.pop_first() {
            order.push(&self.services[next]);
            for &dependent in &self.reverse[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.services.len() {
            return Err(StackError::DependencyCycle {
                members: self.find_cycle(),
            });
        }

        Ok(order)
    }

    /// Reverse topological order: dependents before their dependencies.
    pub fn stop_order(&self) -> Result<Vec<&Service>, StackError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// All services in declaration order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Names of every service that depends on `name`, directly or transitively.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let mut stack = self.reverse[start].clone();
        let mut visited: HashSet<usize> = stack.iter().copied().collect();
        while let Some(position) = stack.pop() {
            for &dependent in &self.reverse[position] {
                if visited.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }

        let mut names: Vec<usize> = visited.into_iter().collect();
        names.sort_unstable();
        names
            .into_iter()
            .map(|position| self.services[position].name.clone())
            .collect()
    }

    /// Finds one cycle, returned as a path whose last element repeats the first.
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = vec![false; self.services.len()];
        let mut on_stack = vec![false; self.services.len()];
        let mut path = Vec::new();

        for start in 0..self.services.len() {
            if !visited[start]
                && let Some(cycle) =
                    self.find_cycle_dfs(start, &mut visited, &mut on_stack, &mut path)
            {
                return cycle
                    .into_iter()
                    .map(|position| self.services[position].name.clone())
                    .collect();
            }
        }

        Vec::new()
    }

    fn find_cycle_dfs(
        &self,
        node: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited[node] = true;
        on_stack[node] = true;
        path.push(node);

        for &dependency in &self.edges[node] {
            if !visited[dependency] {
                if let Some(cycle) = self.find_cycle_dfs(dependency, visited, on_stack, path)
                {
                    return Some(cycle);
                }
            } else if on_stack[dependency] {
                let cycle_start = path
                    .iter()
                    .position(|&candidate| candidate == dependency)
                    .unwrap_or(0);
                let mut cycle = path[cycle_start..].to_vec();
                cycle.push(dependency);
                return Some(cycle);
            }
        }

        on_stack[node] = false;
        path.pop();
        None
    }
}
