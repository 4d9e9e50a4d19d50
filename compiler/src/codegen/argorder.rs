//! Argument-ordering resolution (§4.4.3).
//!
//! A non-tail call with `k` arguments must place the evaluated results into
//! the first `k` argument slots. Evaluating argument `i` may reference a
//! variable that currently occupies one of those destination slots; naive
//! left-to-right writing would corrupt it before it is read. This module
//! computes a safe evaluation order, and the evictions needed to break any
//! unavoidable cycle, from a dependency bit-matrix over which argument
//! expressions reference which destination slots' current occupants.
//!
//! The same resolver powers ordinary calls, calls through a closure value,
//! and in-place tail-call argument rewrites.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgPlan {
    /// Evaluation order: argument indices, in the order they should be
    /// evaluated and written into their destination slots.
    pub order: Vec<usize>,
    /// Destination slot indices whose occupant must be evicted (via
    /// `Environment::reassign_after`) before evaluation begins, to break a
    /// dependency cycle.
    pub evictions: Vec<usize>,
}

/// `depends[i]` is the set of destination-slot indices (each `< k`) whose
/// *original* occupant argument expression `i` reads.
pub fn resolve_argument_order(k: usize, depends: &[HashSet<usize>]) -> ArgPlan {
    assert_eq!(depends.len(), k);

    // edges[i] = { j : argument i must be evaluated before argument j is
    // written to slot j, because j depends on slot i's original content }.
    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); k];
    for j in 0..k {
        for &i in &depends[j] {
            if i != j {
                edges[i].insert(j);
            }
        }
    }

    let mut evictions = Vec::new();
    loop {
        match topo_attempt(k, &edges) {
            Ok(order) => return ArgPlan { order, evictions },
            Err(done) => {
                let cycle_node = (0..k)
                    .find(|&i| !done[i])
                    .expect("topo_attempt failed but reported every node done");
                evictions.push(cycle_node);
                // The evicted slot's original content now lives elsewhere,
                // so any edge that existed solely to protect it is
                // satisfied regardless of evaluation order.
                for e in edges.iter_mut() {
                    e.remove(&cycle_node);
                }
            }
        }
    }
}

/// Kahn's algorithm, deterministically preferring the lowest-indexed ready
/// node. Returns `Err(done)` (a per-node completion flag) if a cycle
/// prevents full resolution.
fn topo_attempt(k: usize, edges: &[HashSet<usize>]) -> Result<Vec<usize>, Vec<bool>> {
    let mut indeg = vec![0usize; k];
    for edge_set in edges {
        for &j in edge_set {
            indeg[j] += 1;
        }
    }
    let mut done = vec![false; k];
    let mut order = Vec::with_capacity(k);
    for _ in 0..k {
        let Some(next) = (0..k).find(|&i| !done[i] && indeg[i] == 0) else {
            return Err(done);
        };
        done[next] = true;
        order.push(next);
        for &j in &edges[next] {
            indeg[j] = indeg[j].saturating_sub(1);
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(usize, &[usize])], k: usize) -> Vec<HashSet<usize>> {
        let mut v = vec![HashSet::new(); k];
        for &(i, js) in pairs {
            v[i] = js.iter().copied().collect();
        }
        v
    }

    #[test]
    fn independent_arguments_keep_natural_order() {
        let d = deps(&[], 3);
        let plan = resolve_argument_order(3, &d);
        assert_eq!(plan.order, vec![0, 1, 2]);
        assert!(plan.evictions.is_empty());
    }

    #[test]
    fn dependency_forces_reordering() {
        // arg 1 depends on slot 0's original value: must evaluate arg 1
        // (or at least place it) before arg 0 overwrites slot 0... actually
        // arg 1 reads slot 0, so arg 0 (which writes slot 0) must come
        // *after* arg 1 is evaluated.
        let d = deps(&[(1, &[0])], 2);
        let plan = resolve_argument_order(2, &d);
        assert_eq!(plan.order, vec![1, 0]);
        assert!(plan.evictions.is_empty());
    }

    #[test]
    fn cycle_requires_eviction() {
        // arg 0 depends on slot 1's original value, arg 1 depends on slot
        // 0's original value: a genuine swap, unbreakable without eviction.
        let d = deps(&[(0, &[1]), (1, &[0])], 2);
        let plan = resolve_argument_order(2, &d);
        assert_eq!(plan.evictions.len(), 1);
        assert_eq!(plan.order.len(), 2);
    }

    #[test]
    fn three_way_cycle_resolves() {
        let d = deps(&[(0, &[1]), (1, &[2]), (2, &[0])], 3);
        let plan = resolve_argument_order(3, &d);
        assert_eq!(plan.evictions.len(), 1);
        assert_eq!(plan.order.len(), 3);
    }
}
