//! Dependency-ordered priority scheduling.
//!
//! Deployable units declare local dependencies on each other; a unit may only
//! be versioned and shipped after everything it depends on has settled.
//! [`assign_priorities`] turns the dependency graph into per-unit priorities
//! (a dependency always receives a strictly lower priority than anything that
//! depends on it), [`priority_groups`] partitions items into tiers of equal
//! priority, and [`run`] executes the tiers lowest-priority first with a
//! strict barrier between tiers and bounded concurrency within each tier.
//!
//! Item failures never abort siblings or later tiers; every settlement result
//! is returned to the caller, which decides whether to continue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;

use futures::future::join_all;
use thiserror::Error;
use tracing::debug;

/// Priority of a unit nothing depends on is `BASE_PRIORITY + 1`; every level
/// of dependency nesting below it subtracts one.
pub const BASE_PRIORITY: i64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("unit {unit:?} depends on unknown unit {dependency:?}")]
    UnknownDependency { unit: String, dependency: String },
    #[error("dependency cycle among units: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Assign a scheduling priority to every unit from its dependency sets.
///
/// For every edge A→B (A depends on B) the result satisfies
/// `priority(B) < priority(A)`, computed as the longest dependent chain above
/// each unit. Dependency names must all resolve to keys of `deps`, and the
/// graph must be acyclic; both are surfaced as errors rather than producing
/// an undefined ordering.
pub fn assign_priorities(
    deps: &BTreeMap<String, BTreeSet<String>>,
) -> Result<BTreeMap<String, i64>, WorkerError> {
    for (unit, dependencies) in deps {
        for dependency in dependencies {
            if !deps.contains_key(dependency) {
                return Err(WorkerError::UnknownDependency {
                    unit: unit.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // Number of dependents per unit; units with none seed the traversal.
    let mut dependent_count: BTreeMap<&str, usize> =
        deps.keys().map(|u| (u.as_str(), 0)).collect();
    for dependencies in deps.values() {
        for dependency in dependencies {
            if let Some(count) = dependent_count.get_mut(dependency.as_str()) {
                *count += 1;
            }
        }
    }

    let mut depth: BTreeMap<&str, i64> = deps.keys().map(|u| (u.as_str(), 0)).collect();
    let mut queue: VecDeque<&str> = dependent_count
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(unit, _)| *unit)
        .collect();

    let mut visited = 0usize;
    while let Some(unit) = queue.pop_front() {
        visited += 1;
        let unit_depth = depth.get(unit).copied().unwrap_or(0);
        if let Some(dependencies) = deps.get(unit) {
            for dependency in dependencies {
                let d = depth.entry(dependency.as_str()).or_insert(0);
                if *d < unit_depth + 1 {
                    *d = unit_depth + 1;
                }
                if let Some(count) = dependent_count.get_mut(dependency.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependency.as_str());
                    }
                }
            }
        }
    }

    if visited < deps.len() {
        let cyclic = dependent_count
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(unit, _)| unit.to_string())
            .collect();
        return Err(WorkerError::DependencyCycle(cyclic));
    }

    Ok(depth
        .into_iter()
        .map(|(unit, d)| (unit.to_string(), BASE_PRIORITY + 1 - d))
        .collect())
}

/// Partition items into tiers of equal priority, ordered so that lower
/// priorities (dependencies) come first. The sort is stable, so items of
/// equal priority keep their input order within a tier.
pub fn priority_groups<T>(items: Vec<T>, priority_of: impl Fn(&T) -> i64) -> Vec<Vec<T>> {
    let mut tagged: Vec<(i64, T)> = items
        .into_iter()
        .map(|item| (priority_of(&item), item))
        .collect();
    tagged.sort_by_key(|(priority, _)| *priority);

    let mut groups: Vec<Vec<T>> = Vec::new();
    let mut current: Option<i64> = None;
    for (priority, item) in tagged {
        match groups.last_mut() {
            Some(group) if current == Some(priority) => group.push(item),
            _ => {
                groups.push(vec![item]);
                current = Some(priority);
            }
        }
    }
    groups
}

/// Execute `items` in priority tiers.
///
/// Tiers run strictly sequentially: a tier never starts before every item of
/// the previous tier has settled, success or failure. Within a tier,
/// `max_concurrency` bounds parallelism: `0` runs the whole tier at once,
/// `1` runs items one at a time, and `n` runs chunks of `n` items with a join
/// between chunks. Results are returned in scheduling order and include every
/// failure; nothing is swallowed or aborted early.
pub async fn run<T, R, E, F, Fut>(
    items: Vec<T>,
    priority_of: impl Fn(&T) -> i64,
    max_concurrency: usize,
    worker: F,
) -> Vec<Result<R, E>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let groups = priority_groups(items, priority_of);
    let mut results = Vec::new();

    for group in groups {
        debug!(items = group.len(), "running scheduling tier");
        match max_concurrency {
            0 => results.extend(join_all(group.into_iter().map(&worker)).await),
            1 => {
                for item in group {
                    results.push(worker(item).await);
                }
            }
            n => {
                let mut remaining = group.into_iter();
                loop {
                    let chunk: Vec<T> = remaining.by_ref().take(n).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    results.extend(join_all(chunk.into_iter().map(&worker)).await);
                }
            }
        }
    }

    results
}
