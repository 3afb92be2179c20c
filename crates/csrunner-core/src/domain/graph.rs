//! Dependency graph utilities.
//!
//! Group start walks applications in dependency order, group stop in reverse
//! order extended by dependents. Both the store (cycle rejection at
//! create/update) and the process manager use the same Kahn sort so the two
//! can never disagree about what a valid graph is.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Topologically sort `ids` by their `depends_on` edges using Kahn's
/// algorithm. Dependencies sort before dependents. The output is
/// deterministic: ties break on id order.
///
/// Returns the ids left unsortable on a cycle; that set contains every cycle
/// member (plus anything downstream of one).
pub fn topo_sort(
    ids: &[String],
    deps: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, Vec<String>> {
    let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

    // indegree = number of in-set dependencies; BTreeMap keeps ties stable
    let mut indegree: BTreeMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in ids {
        if let Some(dep_list) = deps.get(id) {
            for dep in dep_list {
                if id_set.contains(dep.as_str()) {
                    *indegree.get_mut(id.as_str()).unwrap() += 1;
                    dependents.entry(dep.as_str()).or_default().push(id.as_str());
                }
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(ids.len());

    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children {
                let d = indegree.get_mut(*child).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if sorted.len() == ids.len() {
        Ok(sorted)
    } else {
        let stuck: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| (*id).to_string())
            .collect();
        Err(stuck)
    }
}

/// Extend `targets` with everything they transitively depend on.
///
/// Returns an error naming the first unknown dependency id.
pub fn expand_with_dependencies(
    targets: &[String],
    deps: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = targets.iter().cloned().collect();
    let mut out = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(dep_list) = deps.get(&id) else {
            return Err(id);
        };
        for dep in dep_list {
            queue.push_back(dep.clone());
        }
        out.push(id);
    }

    Ok(out)
}

/// Extend `targets` with everything that transitively depends on them.
/// Anyone depending on a stopped application must be stopped first.
pub fn expand_with_dependents(
    targets: &[String],
    deps: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    // Invert the edge direction, then walk the same way
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, dep_list) in deps {
        for dep in dep_list {
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = targets.iter().cloned().collect();
    let mut out = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(children) = dependents.get(id.as_str()) {
            for child in children {
                queue.push_back((*child).to_string());
            }
        }
        out.push(id);
    }

    out
}
