//! Approximate nearest neighbor search over hierarchical navigable
//! small-world (HNSW) graphs.
//!
//! An [`Hnsw`] index is built once from a set of fixed-dimension `f32`
//! vectors and is immutable afterwards. Construction is multi-threaded;
//! the sealed index is a single contiguous buffer that can be written to
//! disk and opened again either in memory or through a read-only memory
//! mapping, so large indexes come up without copying their bulk.
//!
//! ```
//! use smallworld::{BuildConfig, Hnsw, Metric};
//!
//! # fn main() -> smallworld::Result<()> {
//! let mut index = Hnsw::new(3, Metric::L2);
//! index.add_data(&[2.0, 1.0, 0.0])?;
//! index.add_data(&[1.0, 2.0, 0.0])?;
//! index.add_data(&[0.0, 0.0, 1.0])?;
//! index.build(BuildConfig::default().m(5).max_m0(10))?;
//!
//! let nearest = index.search_by_vector(&[2.0, 1.0, 0.1], 2, Some(30))?;
//! assert_eq!(nearest[0].pid.0, 0);
//! # Ok(())
//! # }
//! ```

mod build;
mod config;
mod distance;
mod error;
mod model;
mod node;
mod search;
mod select;
mod types;

pub use crate::config::{BuildConfig, GraphMerging, NeighborSelecting};
pub use crate::distance::{
    angular_distance, dot_distance, normalize_in_place, squared_l2_distance, Metric,
};
pub use crate::error::{Error, Result};
pub use crate::search::Neighbor;
pub use crate::types::PointId;

use std::path::Path;
use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::info;

use crate::build::HnswBuilder;
use crate::model::Model;
use crate::search::{Searcher, SearcherPool};

/// An HNSW index through its whole lifecycle: accumulate vectors, build
/// (or load) the sealed model, then search it.
///
/// Single searches reuse one internal searcher; batch searches draw
/// per-thread searchers from a pool. The sealed model is shared by
/// reference counting, so it is released (and unmapped, when mmap-backed)
/// only after the last searcher holding it is gone.
pub struct Hnsw {
    dim: usize,
    metric: Metric,
    ensure_k: bool,
    builder: Option<HnswBuilder>,
    model: Option<Arc<Model>>,
    searcher: Option<Searcher>,
    searcher_pool: Option<SearcherPool>,
}

impl Hnsw {
    /// Create an empty index for `dim`-dimensional vectors.
    ///
    /// A `dim` of 0 leaves the dimension open until a model is loaded.
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            ensure_k: false,
            builder: None,
            model: None,
            searcher: None,
            searcher_pool: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Append one vector; its id is the number of vectors added before it.
    pub fn add_data(&mut self, vector: &[f32]) -> Result<()> {
        if self.model.is_some() {
            return Err(Error::state(
                "this index already has a model; adding data is not allowed",
            ));
        }
        let (dim, metric) = (self.dim, self.metric);
        self.builder
            .get_or_insert_with(|| HnswBuilder::new(dim, metric))
            .add_data(vector)
    }

    /// Apply configuration key/value pairs (see the crate documentation
    /// for the recognized keys). Unknown keys are rejected.
    pub fn set_configs<K, V>(&mut self, configs: &[(K, V)]) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if self.builder.is_none() && self.model.is_none() {
            let (dim, metric) = (self.dim, self.metric);
            self.builder = Some(HnswBuilder::new(dim, metric));
        }
        if let Some(builder) = &mut self.builder {
            for (key, value) in configs {
                builder.set_config(key.as_ref(), value.as_ref())?;
            }
        }
        for (key, value) in configs {
            if key.as_ref() == "EnsureK" {
                self.ensure_k = value.as_ref() == "true";
            }
        }
        Ok(())
    }

    /// Require searches to return exactly `k` results whenever the index
    /// holds at least `k` points, retrying from recorded descent entries
    /// when the primary search comes up short.
    pub fn set_ensure_k(&mut self, ensure_k: bool) {
        self.ensure_k = ensure_k;
    }

    /// Build the graph with the given parameters and seal the index.
    pub fn build(&mut self, config: BuildConfig) -> Result<()> {
        if self.model.is_some() {
            return Err(Error::state(
                "this index already has a model; building is not allowed",
            ));
        }
        let (dim, metric) = (self.dim, self.metric);
        let builder = self
            .builder
            .get_or_insert_with(|| HnswBuilder::new(dim, metric));
        builder.set_build_config(config);
        let model = builder.build()?;
        self.builder = None;
        self.install_model(Arc::new(model));
        Ok(())
    }

    /// Build with the previously applied configuration.
    pub fn fit(&mut self) -> Result<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| Error::state("no data to fit; load data first"))?;
        let model = builder.build()?;
        self.builder = None;
        self.install_model(Arc::new(model));
        Ok(())
    }

    /// Write the sealed model to disk.
    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<()> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::state("no model to save; build or load an index first"))?
            .save(path.as_ref())
    }

    /// Load a sealed model from disk, optionally through a read-only
    /// memory mapping. The index adopts the model's dimension and metric;
    /// a pre-declared dimension must match the file.
    pub fn load_model(&mut self, path: impl AsRef<Path>, use_mmap: bool) -> Result<()> {
        let model = Model::load(path.as_ref(), use_mmap, self.dim)?;
        self.dim = model.data_dim();
        self.metric = model.metric();
        self.builder = None;
        self.install_model(Arc::new(model));
        Ok(())
    }

    /// Drop the model and all searchers. The buffer is released once the
    /// last outstanding reference is gone.
    pub fn unload_model(&mut self) {
        self.searcher = None;
        self.searcher_pool = None;
        self.model = None;
    }

    /// Search the `k` points nearest to `query`. `ef_search` of `None`
    /// defaults to `50 * k`.
    pub fn search_by_vector(
        &mut self,
        query: &[f32],
        k: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        let ensure_k = self.ensure_k;
        let searcher = self.searcher_mut()?;
        let mut out = Vec::with_capacity(k);
        searcher.search_by_vector(query, k, ef_search, ensure_k, &mut out)?;
        Ok(out)
    }

    /// Search the `k` points nearest to a stored point. The point itself
    /// ranks first at distance zero.
    pub fn search_by_id(
        &mut self,
        id: PointId,
        k: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        let searcher = self.searcher_mut()?;
        let mut out = Vec::with_capacity(k);
        searcher.search_by_id(id, k, ef_search, &mut out)?;
        Ok(out)
    }

    /// Run many vector queries on `n_threads` threads (0 = all cores).
    /// Results are returned in query order.
    pub fn batch_search_by_vectors(
        &mut self,
        queries: &[Vec<f32>],
        k: usize,
        ef_search: Option<usize>,
        n_threads: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        let ensure_k = self.ensure_k;
        let pool = self.batch_pool(n_threads)?;
        let searchers = self.searcher_pool.as_ref().expect("installed above");
        pool.install(|| {
            queries
                .par_iter()
                .map(|query| {
                    let mut searcher = searchers.get();
                    let mut out = Vec::with_capacity(k);
                    let outcome =
                        searcher.search_by_vector(query, k, ef_search, ensure_k, &mut out);
                    searchers.put(searcher);
                    outcome.map(|()| out)
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Run many id queries on `n_threads` threads (0 = all cores).
    pub fn batch_search_by_ids(
        &mut self,
        ids: &[PointId],
        k: usize,
        ef_search: Option<usize>,
        n_threads: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        let pool = self.batch_pool(n_threads)?;
        let searchers = self.searcher_pool.as_ref().expect("installed above");
        pool.install(|| {
            ids.par_iter()
                .map(|&id| {
                    let mut searcher = searchers.get();
                    let mut out = Vec::with_capacity(k);
                    let outcome = searcher.search_by_id(id, k, ef_search, &mut out);
                    searchers.put(searcher);
                    outcome.map(|()| out)
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Log the level-0 degree distribution of the sealed model.
    pub fn print_degree_dist(&self) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::state("no model; build or load an index first"))?;

        let mut degrees: Vec<usize> = Vec::new();
        for id in 0..model.num_nodes() {
            let degree = model.level0_degree(PointId(id as u32));
            if degree >= degrees.len() {
                degrees.resize(degree + 1, 0);
            }
            degrees[degree] += 1;
        }
        info!(nodes = model.num_nodes(), "level-0 degree distribution");
        for (degree, count) in degrees.iter().enumerate() {
            if *count > 0 {
                info!(degree, count = *count, "degree bucket");
            }
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn print_configs(&self) {
        info!(
            dim = self.dim,
            metric = ?self.metric,
            ensure_k = self.ensure_k,
            sealed = self.model.is_some(),
            "index configuration"
        );
        if let Some(builder) = &self.builder {
            info!(config = ?builder.config(), "build configuration");
        }
    }

    fn install_model(&mut self, model: Arc<Model>) {
        self.searcher = Some(Searcher::new(model.clone()));
        self.searcher_pool = None;
        self.model = Some(model);
    }

    fn searcher_mut(&mut self) -> Result<&mut Searcher> {
        self.searcher
            .as_mut()
            .ok_or_else(|| Error::state("no model; build or load an index first"))
    }

    /// Lazily create the shared searcher pool and a rayon pool for one
    /// batch call.
    fn batch_pool(&mut self, n_threads: usize) -> Result<rayon::ThreadPool> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| Error::state("no model; build or load an index first"))?;
        if self.searcher_pool.is_none() {
            self.searcher_pool = Some(SearcherPool::new(model));
        }
        let n_threads = if n_threads == 0 {
            num_cpus::get()
        } else {
            n_threads
        };
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::state(format!("failed to start search threads: {e}")))
    }
}
