use crate::config::NeighborSelecting;
use crate::distance::Metric;
use crate::node::VectorSet;
use crate::types::{Candidate, CloserFirst, FurtherFirst};

/// Prunes a candidate set down to at most `m` surviving edges.
///
/// The heuristic variants implement algorithm 4 from the HNSW paper: a
/// candidate survives only if it is closer to the insertion point than to
/// every already-picked neighbor, which keeps edges that bridge between
/// clusters instead of piling up inside one.
pub(crate) struct NeighborSelector {
    policy: NeighborSelecting,
    preserve_nearest: bool,
}

impl NeighborSelector {
    pub fn new(policy: NeighborSelecting) -> Self {
        Self {
            policy,
            preserve_nearest: false,
        }
    }

    /// Reserve `m / 4` slots for the unconditional nearest candidates
    /// before the heuristic test applies. Improves recall of near-duplicate
    /// points; used for level-0 post-merge selection.
    pub fn preserve_nearest(mut self) -> Self {
        self.preserve_nearest = true;
        self
    }

    pub fn is_naive(&self) -> bool {
        self.policy == NeighborSelecting::Naive
    }

    /// Shrink `result` in place to at most `m` candidates. Distances in
    /// `result` are relative to the insertion point.
    pub fn select(&self, m: usize, vectors: &VectorSet, metric: Metric, result: &mut FurtherFirst) {
        match self.policy {
            NeighborSelecting::Naive => {
                while result.len() > m {
                    result.pop();
                }
            }
            NeighborSelecting::Heuristic => self.heuristic(m, false, vectors, metric, result),
            NeighborSelecting::HeuristicSaveRemains => {
                self.heuristic(m, true, vectors, metric, result)
            }
        }
    }

    fn heuristic(
        &self,
        m: usize,
        save_remains: bool,
        vectors: &VectorSet,
        metric: Metric,
        result: &mut FurtherFirst,
    ) {
        if result.len() < m {
            return;
        }

        // drained furthest-first, walked back to front (nearest first)
        let mut neighbors = Vec::with_capacity(result.len());
        while let Some(candidate) = result.pop() {
            neighbors.push(candidate);
        }

        let reserved = if self.preserve_nearest { m / 4 } else { 0 };
        let mut picked: Vec<Candidate> = Vec::with_capacity(m);
        let mut skipped = CloserFirst::default();

        for &candidate in neighbors.iter().rev() {
            let cur_dist = candidate.distance.into_inner();
            let keep = picked.len() < reserved
                || picked.iter().all(|p| {
                    metric.evaluate(vectors.get(candidate.pid), vectors.get(p.pid)) >= cur_dist
                });

            if keep {
                picked.push(candidate);
            } else if save_remains {
                skipped.push(candidate);
            }

            if picked.len() == m {
                break;
            }
        }

        for candidate in picked {
            result.push(candidate);
        }
        if save_remains {
            while result.len() < m {
                match skipped.pop() {
                    Some(candidate) => result.push(candidate),
                    None => break,
                }
            }
        }
    }
}
