// Dependency ordering of services (Kahn's algorithm).
//
// Ties are broken by input order. Dependencies that name no known service are
// skipped with a warning and do not block their dependents.

use keel_common::log_warn;
use keel_common::logging::Logger;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyOutcome {
    /// Every service, dependencies first
    Ordered(Vec<String>),
    /// Services that could be ordered, and those left on or behind a cycle
    CycleDetected {
        resolved: Vec<String>,
        involved: Vec<String>,
    },
}

impl TopologyOutcome {
    pub fn is_ordered(&self) -> bool {
        matches!(self, TopologyOutcome::Ordered(_))
    }

    /// Services in an order safe to add, whether or not a cycle was found
    pub fn resolved(&self) -> &[String] {
        match self {
            TopologyOutcome::Ordered(order) => order,
            TopologyOutcome::CycleDetected { resolved, .. } => resolved,
        }
    }
}

/// Order `(name, dependencies)` pairs so that every service follows its dependencies
pub fn sort_services(services: &[(String, Vec<String>)], logger: &Logger) -> TopologyOutcome {
    let known: HashSet<&str> = services.iter().map(|(name, _)| name.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(services.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, dependencies) in services {
        let mut seen = HashSet::new();
        let mut degree = 0;
        for dependency in dependencies {
            if !known.contains(dependency.as_str()) {
                log_warn!(logger, "Service `{}` depends on unknown service `{}`", name, dependency);
                continue;
            }
            if seen.insert(dependency.as_str()) {
                degree += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }
        in_degree.insert(name.as_str(), degree);
    }

    let mut queue: VecDeque<&str> = services
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(services.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if order.len() == services.len() {
        return TopologyOutcome::Ordered(order);
    }

    let resolved: HashSet<&str> = order.iter().map(String::as_str).collect();
    let involved = services
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| !resolved.contains(name))
        .map(str::to_string)
        .collect();
    TopologyOutcome::CycleDetected {
        resolved: order,
        involved,
    }
}
