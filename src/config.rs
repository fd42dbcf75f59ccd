use crate::error::{Error, Result};

/// How the builder chooses which candidate edges to keep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NeighborSelecting {
    /// Keep the m nearest candidates.
    Naive,
    /// Algorithm 4 from the HNSW paper.
    #[default]
    Heuristic,
    /// Algorithm 4, back-filling up to m from the pruned candidates.
    HeuristicSaveRemains,
}

/// Post-processing applied after the first graph build.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum GraphMerging {
    /// No post-processing (recommended beyond ~10M points).
    #[default]
    Skip,
    /// Build a second graph in reverse insertion order and merge level-0
    /// edges. Doubles build time, usually improves recall on smaller sets.
    MergeLevel0,
}

/// Parameters for building an index.
///
/// `max_m` always equals `m`; the level-0 cap is `max_m0`.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub(crate) m: usize,
    pub(crate) max_m0: usize,
    pub(crate) ef_construction: usize,
    pub(crate) n_threads: usize,
    pub(crate) mult: Option<f64>,
    pub(crate) neighbor_selecting: NeighborSelecting,
    pub(crate) graph_merging: GraphMerging,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            m: 12,
            max_m0: 24,
            ef_construction: 150,
            n_threads: 1,
            mult: None,
            neighbor_selecting: NeighborSelecting::default(),
            graph_merging: GraphMerging::default(),
        }
    }
}

impl BuildConfig {
    /// Max neighbors per node at level > 0.
    pub fn m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    /// Max neighbors per node at level 0.
    pub fn max_m0(mut self, max_m0: usize) -> Self {
        self.max_m0 = max_m0;
        self
    }

    /// Beam width during construction.
    pub fn ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    /// Number of worker threads for the build.
    pub fn n_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    /// Level multiplier. Defaults to `1 / ln(m)` when unset.
    pub fn mult(mut self, mult: f64) -> Self {
        self.mult = Some(mult);
        self
    }

    pub fn neighbor_selecting(mut self, policy: NeighborSelecting) -> Self {
        self.neighbor_selecting = policy;
        self
    }

    pub fn graph_merging(mut self, merging: GraphMerging) -> Self {
        self.graph_merging = merging;
        self
    }

    pub(crate) fn level_mult(&self) -> f64 {
        self.mult.unwrap_or_else(|| 1.0 / (self.m as f64).ln())
    }

    /// Apply one string key/value pair.
    ///
    /// `EnsureK` is recognized but handled by the index facade, not the
    /// builder; any key outside the known set is rejected.
    pub(crate) fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "M" => self.m = parse_positive_int(key, value)?,
            "MaxM0" => self.max_m0 = parse_positive_int(key, value)?,
            "efConstruction" => self.ef_construction = parse_positive_int(key, value)?,
            "NumThread" => self.n_threads = parse_positive_int(key, value)?,
            "Mult" => {
                let mult: f64 = value.parse().map_err(|_| {
                    Error::config(format!("invalid value for Mult: {value}"))
                })?;
                if mult <= 0.0 {
                    return Err(Error::config(format!("invalid value for Mult: {value}")));
                }
                self.mult = Some(mult);
            }
            "NeighborSelecting" => {
                self.neighbor_selecting = match value {
                    "heuristic" => NeighborSelecting::Heuristic,
                    "heuristic_save_remains" => NeighborSelecting::HeuristicSaveRemains,
                    "naive" => NeighborSelecting::Naive,
                    other => {
                        return Err(Error::config(format!(
                            "invalid value for NeighborSelecting: {other}"
                        )))
                    }
                };
            }
            "GraphMerging" => {
                self.graph_merging = match value {
                    "skip" => GraphMerging::Skip,
                    "merge_level0" => GraphMerging::MergeLevel0,
                    other => {
                        return Err(Error::config(format!(
                            "invalid value for GraphMerging: {other}"
                        )))
                    }
                };
            }
            "EnsureK" => {}
            other => return Err(Error::config(format!("invalid configuration key: {other}"))),
        }
        Ok(())
    }
}

fn parse_positive_int(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(Error::config(format!("invalid value for {key}: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BuildConfig::default();
        assert_eq!(config.m, 12);
        assert_eq!(config.max_m0, 24);
        assert_eq!(config.ef_construction, 150);
        assert_eq!(config.n_threads, 1);
        assert!((config.level_mult() - 1.0 / (12f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn applies_known_keys() {
        let mut config = BuildConfig::default();
        config.apply("M", "5").unwrap();
        config.apply("MaxM0", "10").unwrap();
        config.apply("efConstruction", "90").unwrap();
        config.apply("NumThread", "4").unwrap();
        config.apply("Mult", "0.5").unwrap();
        config.apply("NeighborSelecting", "naive").unwrap();
        config.apply("GraphMerging", "merge_level0").unwrap();
        config.apply("EnsureK", "true").unwrap();

        assert_eq!(config.m, 5);
        assert_eq!(config.max_m0, 10);
        assert_eq!(config.ef_construction, 90);
        assert_eq!(config.n_threads, 4);
        assert_eq!(config.level_mult(), 0.5);
        assert_eq!(config.neighbor_selecting, NeighborSelecting::Naive);
        assert_eq!(config.graph_merging, GraphMerging::MergeLevel0);
    }

    #[test]
    fn rejects_unknown_key() {
        let mut config = BuildConfig::default();
        assert!(matches!(
            config.apply("EfSearch", "10"),
            Err(crate::Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = BuildConfig::default();
        assert!(config.apply("M", "0").is_err());
        assert!(config.apply("M", "-3").is_err());
        assert!(config.apply("Mult", "nope").is_err());
        assert!(config.apply("NeighborSelecting", "closest").is_err());
        assert!(config.apply("GraphMerging", "merge_all").is_err());
    }
}
