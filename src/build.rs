use std::cmp::min;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::iter::{
    IndexedParallelIterator, IntoParallelIterator, IntoParallelRefMutIterator, ParallelIterator,
};
use tracing::info;

use crate::config::{BuildConfig, GraphMerging, NeighborSelecting};
use crate::distance::{normalize_in_place, Metric};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::node::{BuildNode, NodeLinks, VectorSet};
use crate::select::NeighborSelector;
use crate::types::{Candidate, CloserFirst, FurtherFirst, PointId, Visited};

/// Accumulates vectors and configuration, then constructs the graph and
/// seals it into a [`Model`].
pub(crate) struct HnswBuilder {
    dim: usize,
    metric: Metric,
    config: BuildConfig,
    vectors: VectorSet,
}

impl HnswBuilder {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            config: BuildConfig::default(),
            vectors: VectorSet::new(dim),
        }
    }

    pub fn add_data(&mut self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::config(format!(
                "invalid dimension data inserted: {}, predefined dimension: {}",
                vector.len(),
                self.dim
            )));
        }
        if self.metric.needs_normalization() {
            let mut normalized = vector.to_vec();
            normalize_in_place(&mut normalized);
            self.vectors.push(&normalized);
        } else {
            self.vectors.push(vector);
        }
        Ok(())
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.config.apply(key, value)
    }

    pub fn set_build_config(&mut self, config: BuildConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Construct the graph and serialize it. Consumes the accumulated
    /// vectors; the builder is empty afterwards.
    pub fn build(&mut self) -> Result<Model> {
        if self.vectors.count() == 0 {
            return Err(Error::state("no data to fit; add vectors first"));
        }
        let config = self.config.clone();
        info!(
            n = self.vectors.count(),
            m = config.m,
            max_m0 = config.max_m0,
            ef_construction = config.ef_construction,
            n_threads = config.n_threads,
            metric = ?self.metric,
            "building index"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_threads)
            .build()
            .map_err(|e| Error::state(format!("failed to start build threads: {e}")))?;
        let selector = NeighborSelector::new(config.neighbor_selecting);

        let mut graph = self.build_graph(&pool, &config, &selector, false);
        if config.graph_merging == GraphMerging::MergeLevel0 {
            info!("graph post processing: merge_level0");
            let first = graph;
            graph = self.build_graph(&pool, &config, &selector, true);
            self.merge_level0(&pool, &config, &mut graph, &first);
        }

        let model = Model::from_graph(
            &graph.nodes,
            &self.vectors,
            self.metric,
            graph.enterpoint,
            graph.max_level,
            config.m,
            config.max_m0,
        )?;
        self.vectors = VectorSet::new(self.dim);
        Ok(model)
    }

    fn build_graph(
        &self,
        pool: &rayon::ThreadPool,
        config: &BuildConfig,
        selector: &NeighborSelector,
        reverse: bool,
    ) -> Graph {
        let count = self.vectors.count();
        let state = GraphState {
            vectors: &self.vectors,
            metric: self.metric,
            m: config.m,
            max_m: config.m,
            max_m0: config.max_m0,
            ef_construction: config.ef_construction,
            level_mult: config.level_mult(),
            selector,
            nodes: (0..count).map(|_| BuildNode::unassigned()).collect(),
            max_level: AtomicU32::new(0),
            enterpoint: AtomicU32::new(0),
            level_guard: Mutex::new(()),
            scratch: (0..config.n_threads)
                .map(|tid| Mutex::new(WorkerScratch::new(seed_for_thread(tid), count)))
                .collect(),
        };

        let first_level = {
            let mut scratch = state.scratch[0].lock();
            random_level(&mut scratch.rng, state.level_mult)
        };
        state.nodes[0].assign(first_level, state.max_m, state.max_m0);
        state.max_level.store(first_level as u32, Ordering::Relaxed);
        state.enterpoint.store(0, Ordering::Relaxed);

        pool.install(|| {
            if reverse {
                (1..count)
                    .into_par_iter()
                    .rev()
                    .for_each(|i| state.insert(PointId(i as u32)));
            } else {
                (1..count)
                    .into_par_iter()
                    .for_each(|i| state.insert(PointId(i as u32)));
            }
        });

        Graph {
            max_level: state.max_level.load(Ordering::Relaxed) as usize,
            enterpoint: PointId(state.enterpoint.load(Ordering::Relaxed)),
            nodes: state.nodes.into_iter().map(BuildNode::into_links).collect(),
        }
    }

    /// Union each node's level-0 edges from both graphs and keep the best
    /// `max_m0` of them. Runs over the second (reverse-built) graph, which
    /// becomes the final one.
    fn merge_level0(
        &self,
        pool: &rayon::ThreadPool,
        config: &BuildConfig,
        graph: &mut Graph,
        first: &Graph,
    ) {
        let post_selector =
            NeighborSelector::new(NeighborSelecting::HeuristicSaveRemains).preserve_nearest();
        let vectors = &self.vectors;
        let metric = self.metric;
        let max_m0 = config.max_m0;

        pool.install(|| {
            graph.nodes[1..]
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, links)| {
                    let pid = PointId(idx as u32 + 1);
                    let mut merged: HashSet<PointId> = links.friends[0].iter().copied().collect();
                    merged.extend(first.nodes[pid.idx()].friends[0].iter().copied());

                    let own = vectors.get(pid);
                    let mut heap = FurtherFirst::default();
                    for neighbor in merged {
                        let d = metric.evaluate(vectors.get(neighbor), own);
                        heap.push(Candidate::new(d, neighbor));
                    }
                    post_selector.select(max_m0, vectors, metric, &mut heap);

                    let mut survivors = Vec::with_capacity(heap.len());
                    while let Some(candidate) = heap.pop() {
                        survivors.push(candidate.pid);
                    }
                    links.friends[0] = survivors;
                });
        });
    }
}

/// Fully built graph, unwrapped from the per-node locks.
pub(crate) struct Graph {
    pub nodes: Vec<NodeLinks>,
    pub enterpoint: PointId,
    pub max_level: usize,
}

struct WorkerScratch {
    rng: SmallRng,
    visited: Visited,
}

impl WorkerScratch {
    fn new(seed: u64, capacity: usize) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            visited: Visited::with_capacity(capacity),
        }
    }
}

/// Shared state for one parallel graph construction pass.
struct GraphState<'a> {
    vectors: &'a VectorSet,
    metric: Metric,
    m: usize,
    max_m: usize,
    max_m0: usize,
    ef_construction: usize,
    level_mult: f64,
    selector: &'a NeighborSelector,
    nodes: Vec<BuildNode>,
    /// Upper bound on any node's level. The enterpoint always carries
    /// exactly this level; both are published together under `level_guard`.
    max_level: AtomicU32,
    enterpoint: AtomicU32,
    level_guard: Mutex<()>,
    scratch: Vec<Mutex<WorkerScratch>>,
}

impl<'a> GraphState<'a> {
    fn insert(&self, pid: PointId) {
        let tid = rayon::current_thread_index().unwrap_or(0);
        let mut scratch = self.scratch[tid].lock();
        let WorkerScratch { rng, visited } = &mut *scratch;

        let level = random_level(rng, self.level_mult);
        self.nodes[pid.idx()].assign(level, self.max_m, self.max_m0);
        self.insert_node(pid, level, visited);
    }

    fn insert_node(&self, pid: PointId, level: usize, visited: &mut Visited) {
        // A node raising the level ceiling holds the guard for its whole
        // insertion so the enterpoint switch happens against a settled
        // graph. Everyone else proceeds on a possibly stale snapshot; the
        // top-down descent self-corrects.
        let _guard = if level > self.max_level.load(Ordering::Acquire) as usize {
            Some(self.level_guard.lock())
        } else {
            None
        };

        let max_level_copy = self.max_level.load(Ordering::Acquire) as usize;
        let mut entry = PointId(self.enterpoint.load(Ordering::Relaxed));
        let qvec = self.vectors.get(pid);

        if level < max_level_copy {
            let mut cur = entry;
            let mut cur_dist = self.metric.evaluate(qvec, self.vectors.get(cur));
            for layer in ((level + 1)..=max_level_copy).rev() {
                let mut changed = true;
                while changed {
                    changed = false;
                    let scan = cur;
                    let links = self.nodes[scan.idx()].lock();
                    for &neighbor in &links.friends[layer] {
                        let d = self.metric.evaluate(qvec, self.vectors.get(neighbor));
                        if d < cur_dist {
                            cur_dist = d;
                            cur = neighbor;
                            changed = true;
                        }
                    }
                }
            }
            entry = cur;
        }

        for layer in (0..=min(max_level_copy, level)).rev() {
            let mut result = FurtherFirst::default();
            self.search_at_layer(qvec, entry, layer, visited, &mut result);
            self.selector
                .select(self.m, self.vectors, self.metric, &mut result);
            while let Some(candidate) = result.pop() {
                self.link(candidate.pid, pid, layer);
                self.link(pid, candidate.pid, layer);
            }
        }

        if level > self.max_level.load(Ordering::Relaxed) as usize {
            self.enterpoint.store(pid.0, Ordering::Relaxed);
            self.max_level.store(level as u32, Ordering::Release);
        }
    }

    /// Beam search over one layer with capacity `ef_construction`,
    /// returning the result set furthest-first.
    fn search_at_layer(
        &self,
        qvec: &[f32],
        entry: PointId,
        layer: usize,
        visited: &mut Visited,
        result: &mut FurtherFirst,
    ) {
        let mut candidates = CloserFirst::default();
        let d = self.metric.evaluate(qvec, self.vectors.get(entry));
        result.push(Candidate::new(d, entry));
        candidates.push(Candidate::new(d, entry));

        visited.clear();
        visited.insert(entry);

        let mut neighbors = Vec::new();
        while let Some(candidate) = candidates.pop() {
            let lower_bound = result.top().expect("result is seeded").distance;
            if candidate.distance > lower_bound {
                break;
            }

            neighbors.clear();
            {
                let links = self.nodes[candidate.pid.idx()].lock();
                neighbors.extend_from_slice(&links.friends[layer]);
            }
            for &neighbor in &neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.metric.evaluate(qvec, self.vectors.get(neighbor));
                let worst = result.top().expect("result is seeded").distance.into_inner();
                if result.len() < self.ef_construction || worst > d {
                    result.push(Candidate::new(d, neighbor));
                    candidates.push(Candidate::new(d, neighbor));
                    if result.len() > self.ef_construction {
                        result.pop();
                    }
                }
            }
        }
    }

    /// Append `target` to `source`'s adjacency at `layer` and shrink back
    /// under the degree cap if the list overflowed.
    fn link(&self, source: PointId, target: PointId, layer: usize) {
        let cap = if layer > 0 { self.max_m } else { self.max_m0 };
        let mut links = self.nodes[source.idx()].lock();
        let friends = &mut links.friends[layer];
        friends.push(target);
        if friends.len() <= cap {
            return;
        }

        let svec = self.vectors.get(source);
        if self.selector.is_naive() {
            let mut max_dist = self.metric.evaluate(svec, self.vectors.get(friends[0]));
            let mut max_at = 0;
            for (i, &neighbor) in friends.iter().enumerate().skip(1) {
                let d = self.metric.evaluate(svec, self.vectors.get(neighbor));
                if d > max_dist {
                    max_dist = d;
                    max_at = i;
                }
            }
            friends.remove(max_at);
        } else {
            let mut heap = FurtherFirst::default();
            for &neighbor in friends.iter() {
                let d = self.metric.evaluate(svec, self.vectors.get(neighbor));
                heap.push(Candidate::new(d, neighbor));
            }
            let shrunk = heap.len() - 1;
            self.selector.select(shrunk, self.vectors, self.metric, &mut heap);
            friends.clear();
            while let Some(candidate) = heap.pop() {
                friends.push(candidate.pid);
            }
        }
    }
}

/// `floor(-ln(r) * level_mult)` with r uniform in [0, 1); draws of
/// (sub-)epsilon r count as 1 so the logarithm stays finite.
fn random_level(rng: &mut SmallRng, level_mult: f64) -> usize {
    let mut r: f64 = rng.gen();
    if r < f64::EPSILON {
        r = 1.0;
    }
    (-r.ln() * level_mult) as usize
}

/// Deterministic per-worker seed, derived from the thread index with the
/// classic LCG so repeated builds draw identical level sequences.
fn seed_for_thread(tid: usize) -> u64 {
    let mut seed: i32 = 17;
    for _ in 0..=tid {
        seed = seed.wrapping_mul(214013).wrapping_add(2531011);
    }
    ((seed >> 16) & 0x7fff) as u64
}
