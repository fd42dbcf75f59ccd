use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use crate::distance::{normalize_in_place, Metric};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::types::{Candidate, CloserFirst, PointId, Visited};

/// One search hit: a point id and its distance from the query.
///
/// Distances are squared euclidean for L2, `1 - cos` for angular, and the
/// true (un-negated) inner product for dot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub pid: PointId,
    pub distance: f32,
}

/// Single-threaded query state over a shared model: a visit marker, the
/// normalized-query buffer and the ensure-k path stack, all reused across
/// calls. Batch search uses one `Searcher` per worker from a pool.
pub(crate) struct Searcher {
    model: Arc<Model>,
    visited: Visited,
    normalized: Vec<f32>,
    path: Vec<(PointId, f32)>,
}

impl Searcher {
    pub fn new(model: Arc<Model>) -> Self {
        let capacity = model.num_nodes();
        let dim = model.data_dim();
        Self {
            model,
            visited: Visited::with_capacity(capacity),
            normalized: Vec::with_capacity(dim),
            path: Vec::new(),
        }
    }

    /// Hierarchical search for the `k` points nearest to `query`.
    ///
    /// `ef_search` of `None` defaults to `50 * k`. With `ensure_k`, the
    /// greedy descent path is recorded and replayed entry by entry until
    /// `k` results accumulate or the path is exhausted.
    pub fn search_by_vector(
        &mut self,
        query: &[f32],
        k: usize,
        ef_search: Option<usize>,
        ensure_k: bool,
        out: &mut Vec<Neighbor>,
    ) -> Result<()> {
        let Searcher {
            model,
            visited,
            normalized,
            path,
        } = self;
        let model = &**model;
        if query.len() != model.data_dim() {
            return Err(Error::config(format!(
                "invalid query dimension: {}, index dimension: {}",
                query.len(),
                model.data_dim()
            )));
        }
        let ef_search = ef_search.unwrap_or(50 * k);

        let qraw: &[f32] = if model.metric().needs_normalization() {
            normalized.clear();
            normalized.extend_from_slice(query);
            normalize_in_place(normalized);
            normalized.as_slice()
        } else {
            query
        };

        let mut cur = model.enterpoint_id();
        let mut cur_dist = model.metric().evaluate(qraw, model.vector(cur));
        if ensure_k {
            path.clear();
            path.push((cur, cur_dist));
        }

        for level in (1..=model.max_level()).rev() {
            visited.clear();
            visited.insert(cur);
            let mut changed = true;
            while changed {
                changed = false;
                let offset = model.higher_offset_of(cur);
                for fid in model.higher_neighbors(offset, level) {
                    if !visited.insert(fid) {
                        continue;
                    }
                    let d = model.metric().evaluate(qraw, model.vector(fid));
                    if d < cur_dist {
                        cur_dist = d;
                        cur = fid;
                        changed = true;
                        if ensure_k {
                            path.push((cur, cur_dist));
                        }
                    }
                }
            }
        }

        if ensure_k {
            while out.len() < k {
                let Some((seed, seed_dist)) = path.pop() else {
                    break;
                };
                search_level0(model, visited, seed, seed_dist, qraw, k, ef_search, true, out);
            }
        } else {
            search_level0(model, visited, cur, cur_dist, qraw, k, ef_search, false, out);
        }

        finish_results(model.metric(), out);
        Ok(())
    }

    /// Search seeded directly at a stored point, at distance zero.
    /// The ensure-k fallback does not apply on this path.
    pub fn search_by_id(
        &mut self,
        id: PointId,
        k: usize,
        ef_search: Option<usize>,
        out: &mut Vec<Neighbor>,
    ) -> Result<()> {
        let Searcher { model, visited, .. } = self;
        let model = &**model;
        if id.idx() >= model.num_nodes() {
            return Err(Error::config(format!(
                "query id out of range: {} (index holds {} points)",
                id.0,
                model.num_nodes()
            )));
        }
        let ef_search = ef_search.unwrap_or(50 * k);

        let qraw = model.vector(id);
        search_level0(model, visited, id, 0.0, qraw, k, ef_search, false, out);
        finish_results(model.metric(), out);
        Ok(())
    }
}

/// Level-0 dispatch: an `ef_search` below `k` selects the bounded-visit
/// variant, which may legitimately return fewer than `k` results.
#[allow(clippy::too_many_arguments)]
fn search_level0(
    model: &Model,
    visited: &mut Visited,
    seed: PointId,
    seed_dist: f32,
    qraw: &[f32],
    k: usize,
    ef_search: usize,
    ensure_k: bool,
    out: &mut Vec<Neighbor>,
) {
    if ef_search < k {
        search_level0_v1(model, visited, seed, seed_dist, qraw, k, ef_search, ensure_k, out);
    } else {
        search_level0_v2(model, visited, seed, seed_dist, qraw, k, ef_search, ensure_k, out);
    }
}

/// Standard HNSW search at level 0: stop once the closest open candidate
/// is farther than the worst of the best `ef_search` distances seen.
#[allow(clippy::too_many_arguments)]
fn search_level0_v2(
    model: &Model,
    visited: &mut Visited,
    seed: PointId,
    seed_dist: f32,
    qraw: &[f32],
    k: usize,
    ef_search: usize,
    ensure_k: bool,
    out: &mut Vec<Neighbor>,
) {
    let metric = model.metric();
    let mut candidates = CloserFirst::default();
    let mut visited_nodes = CloserFirst::default();
    let mut found_distances: BinaryHeap<OrderedFloat<f32>> = BinaryHeap::new();

    candidates.push(Candidate::new(seed_dist, seed));
    found_distances.push(OrderedFloat(seed_dist));
    visited.clear();
    visited.insert(seed);

    if ensure_k && !out.is_empty() && !seed_prior_results(seed, visited, &mut visited_nodes, out) {
        return;
    }

    while let Some(candidate) = candidates.pop() {
        if candidate.distance > *found_distances.peek().expect("seeded above") {
            break;
        }
        let cur = candidate.pid;
        visited_nodes.push(candidate);

        for fid in model.level0_neighbors(cur) {
            if !visited.insert(fid) {
                continue;
            }
            let d = metric.evaluate(qraw, model.vector(fid));
            let worst = found_distances.peek().expect("seeded above").into_inner();
            if d < worst || found_distances.len() < ef_search {
                candidates.push(Candidate::new(d, fid));
                found_distances.push(OrderedFloat(d));
                if found_distances.len() > ef_search {
                    found_distances.pop();
                }
            }
        }
    }

    merge_results(k, &mut candidates, &mut visited_nodes, out);
}

/// Small-result fallback for `ef_search < k`: advance until `ef_search`
/// nodes have been expanded, admitting neighbors against the farthest
/// distance seen so far.
#[allow(clippy::too_many_arguments)]
fn search_level0_v1(
    model: &Model,
    visited: &mut Visited,
    seed: PointId,
    seed_dist: f32,
    qraw: &[f32],
    k: usize,
    ef_search: usize,
    ensure_k: bool,
    out: &mut Vec<Neighbor>,
) {
    let metric = model.metric();
    let mut candidates = CloserFirst::default();
    let mut visited_nodes = CloserFirst::default();

    candidates.push(Candidate::new(seed_dist, seed));
    visited.clear();
    visited.insert(seed);

    if ensure_k && !out.is_empty() && !seed_prior_results(seed, visited, &mut visited_nodes, out) {
        return;
    }

    let mut farthest_distance = seed_dist;
    let mut candidate_found_cnt = 1usize;
    let mut visited_cnt = 0usize;

    while visited_cnt < ef_search {
        let Some(candidate) = candidates.pop() else {
            break;
        };
        let cur = candidate.pid;
        visited_nodes.push(candidate);
        visited_cnt += 1;

        let minimum_distance = farthest_distance;
        for fid in model.level0_neighbors(cur) {
            if !visited.insert(fid) {
                continue;
            }
            let d = metric.evaluate(qraw, model.vector(fid));
            if d < minimum_distance || candidate_found_cnt < ef_search {
                candidates.push(Candidate::new(d, fid));
                if d > farthest_distance {
                    farthest_distance = d;
                }
                candidate_found_cnt += 1;
            }
        }
    }

    merge_results(k, &mut candidates, &mut visited_nodes, out);
}

/// Move results accumulated by earlier ensure-k replays into the
/// visited-nodes heap so this pass cannot emit duplicates. Returns false
/// when the replay seed is itself already a result, which makes the pass
/// redundant; `out` is left untouched in that case.
fn seed_prior_results(
    seed: PointId,
    visited: &mut Visited,
    visited_nodes: &mut CloserFirst,
    out: &mut Vec<Neighbor>,
) -> bool {
    if out.iter().any(|neighbor| neighbor.pid == seed) {
        return false;
    }
    for neighbor in out.drain(..) {
        visited.insert(neighbor.pid);
        visited_nodes.push(Candidate::new(neighbor.distance, neighbor.pid));
    }
    true
}

/// Merge the two heaps in ascending distance order until `k` results.
fn merge_results(
    k: usize,
    candidates: &mut CloserFirst,
    visited_nodes: &mut CloserFirst,
    out: &mut Vec<Neighbor>,
) {
    while out.len() < k {
        let from_candidates = match (candidates.top(), visited_nodes.top()) {
            (Some(c), Some(v)) => c.distance < v.distance,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = match from_candidates {
            true => candidates.pop(),
            false => visited_nodes.pop(),
        };
        let next = next.expect("chosen heap is non-empty");
        out.push(Neighbor {
            pid: next.pid,
            distance: next.distance.into_inner(),
        });
    }
}

/// Dot distances are ranked negated internally; flip them back to true
/// inner products once per public call.
fn finish_results(metric: Metric, out: &mut [Neighbor]) {
    if metric == Metric::Dot {
        for neighbor in out.iter_mut() {
            neighbor.distance = -neighbor.distance;
        }
    }
}

/// Reusable searcher instances for multi-threaded batch search.
pub(crate) struct SearcherPool {
    model: Arc<Model>,
    pool: Mutex<Vec<Searcher>>,
}

impl SearcherPool {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Searcher {
        match self.pool.lock().pop() {
            Some(searcher) => searcher,
            None => Searcher::new(self.model.clone()),
        }
    }

    pub fn put(&self, searcher: Searcher) {
        self.pool.lock().push(searcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_interleaves_both_heaps_in_distance_order() {
        let mut candidates = CloserFirst::default();
        let mut visited_nodes = CloserFirst::default();
        candidates.push(Candidate::new(2.0, PointId(2)));
        candidates.push(Candidate::new(5.0, PointId(5)));
        visited_nodes.push(Candidate::new(1.0, PointId(1)));
        visited_nodes.push(Candidate::new(3.0, PointId(3)));

        let mut out = Vec::new();
        merge_results(3, &mut candidates, &mut visited_nodes, &mut out);
        let ids: Vec<u32> = out.iter().map(|n| n.pid.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn merge_stops_at_k_or_exhaustion() {
        let mut candidates = CloserFirst::default();
        let mut visited_nodes = CloserFirst::default();
        visited_nodes.push(Candidate::new(1.0, PointId(1)));

        let mut out = Vec::new();
        merge_results(5, &mut candidates, &mut visited_nodes, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn prior_results_seed_the_visited_heap() {
        let mut visited = Visited::with_capacity(8);
        let mut visited_nodes = CloserFirst::default();
        let mut out = vec![
            Neighbor {
                pid: PointId(3),
                distance: 0.5,
            },
            Neighbor {
                pid: PointId(4),
                distance: 0.9,
            },
        ];

        assert!(seed_prior_results(
            PointId(7),
            &mut visited,
            &mut visited_nodes,
            &mut out
        ));
        assert!(out.is_empty());
        assert_eq!(visited_nodes.len(), 2);
        assert!(!visited.insert(PointId(3)));

        // a replay seeded at an existing result is redundant
        let mut out = vec![Neighbor {
            pid: PointId(7),
            distance: 0.1,
        }];
        let mut visited = Visited::with_capacity(8);
        let mut visited_nodes = CloserFirst::default();
        assert!(!seed_prior_results(
            PointId(7),
            &mut visited,
            &mut visited_nodes,
            &mut out
        ));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn dot_results_are_flipped_back() {
        let mut out = [Neighbor {
            pid: PointId(0),
            distance: -3.5,
        }];
        finish_results(Metric::Dot, &mut out);
        assert_eq!(out[0].distance, 3.5);
        finish_results(Metric::L2, &mut out);
        assert_eq!(out[0].distance, 3.5);
    }
}
