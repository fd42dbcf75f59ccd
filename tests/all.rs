use std::collections::HashSet;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use smallworld::{
    BuildConfig, Error, GraphMerging, Hnsw, Metric, NeighborSelecting, PointId,
};

fn small_config() -> BuildConfig {
    BuildConfig::default().m(5).max_m0(10)
}

#[test]
fn search_by_vector_angular() {
    let mut index = Hnsw::new(3, Metric::Angular);
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.add_data(&[0.0, 1.0, 0.0]).unwrap();
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.build(small_config()).unwrap();

    let result = index
        .search_by_vector(&[3.0, 2.0, 1.0], 3, Some(30))
        .unwrap();
    assert_eq!(result.len(), 3);

    // [0,1,0] is nearest to the query; the two identical [0,0,1] vectors
    // tie behind it, in either order.
    assert_eq!(result[0].pid, PointId(1));
    let tied: HashSet<u32> = result[1..].iter().map(|n| n.pid.0).collect();
    assert_eq!(tied, HashSet::from([0, 2]));
    assert_eq!(result[1].distance, result[2].distance);
}

#[test]
fn search_by_id_l2() {
    let mut index = Hnsw::new(3, Metric::L2);
    index.add_data(&[2.0, 1.0, 0.0]).unwrap();
    index.add_data(&[1.0, 2.0, 0.0]).unwrap();
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index
        .build(small_config().ef_construction(150).n_threads(1))
        .unwrap();

    let result = index.search_by_id(PointId(0), 3, Some(30)).unwrap();
    let ids: Vec<u32> = result.iter().map(|n| n.pid.0).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(result[0].distance, 0.0);

    let result = index.search_by_id(PointId(1), 3, Some(30)).unwrap();
    let ids: Vec<u32> = result.iter().map(|n| n.pid.0).collect();
    assert_eq!(ids, vec![1, 0, 2]);
}

#[test]
fn saved_model_answers_like_the_live_index() {
    let mut index = Hnsw::new(3, Metric::Angular);
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.add_data(&[0.0, 1.0, 0.0]).unwrap();
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.build(small_config()).unwrap();
    let before = index
        .search_by_vector(&[3.0, 2.0, 1.0], 3, Some(30))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.n2");
    index.save_model(&path).unwrap();

    for use_mmap in [true, false] {
        let mut loaded = Hnsw::new(0, Metric::L2);
        loaded.load_model(&path, use_mmap).unwrap();
        assert_eq!(loaded.metric(), Metric::Angular);
        assert_eq!(loaded.dimension(), 3);

        let after = loaded
            .search_by_vector(&[3.0, 2.0, 1.0], 3, Some(30))
            .unwrap();
        assert_eq!(after, before);
    }
}

#[test]
fn ensure_k_caps_at_index_size_without_crashing() {
    let mut index = Hnsw::new(3, Metric::L2);
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.add_data(&[0.0, 1.0, 0.0]).unwrap();
    // a tiny multiplier pins both nodes to level 0
    index.build(small_config().mult(0.01)).unwrap();
    index.set_ensure_k(true);

    let result = index
        .search_by_vector(&[0.0, 1.0, 0.0], 5, Some(1))
        .unwrap();
    assert_eq!(result.len(), 2);
}

#[test]
fn ensure_k_returns_exactly_k() {
    let mut index = Hnsw::new(2, Metric::L2);
    for i in 0..50 {
        index.add_data(&[i as f32, (i % 7) as f32]).unwrap();
    }
    index
        .set_configs(&[("EnsureK", "true"), ("M", "5"), ("MaxM0", "10")])
        .unwrap();
    index.fit().unwrap();

    for query in [[25.0, 3.0], [-10.0, 0.0], [100.0, 100.0]] {
        let result = index.search_by_vector(&query, 10, Some(40)).unwrap();
        assert_eq!(result.len(), 10);
        let unique: HashSet<u32> = result.iter().map(|n| n.pid.0).collect();
        assert_eq!(unique.len(), 10);
    }
}

#[test]
fn self_query_ranks_itself_first() {
    let mut index = Hnsw::new(4, Metric::L2);
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..64 {
        let v: [f32; 4] = rng.gen();
        index.add_data(&v).unwrap();
    }
    index.build(small_config()).unwrap();

    for i in [0u32, 17, 63] {
        let result = index.search_by_id(PointId(i), 3, Some(30)).unwrap();
        assert_eq!(result[0].pid, PointId(i));
        assert_eq!(result[0].distance, 0.0);
    }
}

#[test]
fn angular_query_is_scale_invariant() {
    let mut index = Hnsw::new(3, Metric::Angular);
    index.add_data(&[1.0, 0.0, 0.0]).unwrap();
    index.add_data(&[0.0, 1.0, 0.0]).unwrap();
    index.add_data(&[0.7, 0.7, 0.0]).unwrap();
    index.build(small_config()).unwrap();

    for scale in [1.0, 2.0, 100.0] {
        let result = index
            .search_by_vector(&[0.7 * scale, 0.7 * scale, 0.0], 1, Some(30))
            .unwrap();
        assert_eq!(result[0].pid, PointId(2));
        assert!(result[0].distance.abs() < 1e-5);
    }
}

#[test]
fn dimension_mismatch_is_a_config_error() {
    let mut index = Hnsw::new(3, Metric::L2);
    assert!(matches!(
        index.add_data(&[0.0, 0.0, 1.0, 2.0]),
        Err(Error::Config { .. })
    ));
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    assert!(matches!(
        index.search_by_vector(&[1.0, 2.0], 1, None),
        Err(Error::State { .. })
    ));
}

#[test]
fn lifecycle_violations_are_state_errors() {
    let mut index = Hnsw::new(2, Metric::L2);
    assert!(matches!(index.fit(), Err(Error::State { .. })));
    assert!(matches!(
        index.search_by_vector(&[0.0, 0.0], 1, None),
        Err(Error::State { .. })
    ));
    assert!(matches!(
        index.save_model("nowhere.bin"),
        Err(Error::State { .. })
    ));

    index.add_data(&[0.0, 1.0]).unwrap();
    index.add_data(&[1.0, 0.0]).unwrap();
    index.build(small_config()).unwrap();
    assert!(matches!(
        index.add_data(&[0.5, 0.5]),
        Err(Error::State { .. })
    ));
    assert!(matches!(
        index.build(small_config()),
        Err(Error::State { .. })
    ));

    index.unload_model();
    assert!(matches!(
        index.search_by_vector(&[0.0, 0.0], 1, None),
        Err(Error::State { .. })
    ));
}

#[test]
fn unknown_config_key_is_rejected() {
    let mut index = Hnsw::new(2, Metric::L2);
    assert!(matches!(
        index.set_configs(&[("Parallelism", "4")]),
        Err(Error::Config { .. })
    ));
    index
        .set_configs(&[
            ("M", "6"),
            ("MaxM0", "12"),
            ("efConstruction", "80"),
            ("NumThread", "2"),
            ("NeighborSelecting", "heuristic_save_remains"),
            ("GraphMerging", "skip"),
            ("EnsureK", "false"),
        ])
        .unwrap();
}

#[test]
fn single_threaded_builds_are_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();

    for round in 0..2 {
        let mut index = Hnsw::new(8, Metric::L2);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let v: [f32; 8] = rng.gen();
            index.add_data(&v).unwrap();
        }
        index
            .build(
                small_config()
                    .n_threads(1)
                    .graph_merging(GraphMerging::MergeLevel0),
            )
            .unwrap();
        let path = dir.path().join(format!("model-{round}.bin"));
        index.save_model(&path).unwrap();
        paths.push(path);
    }

    let first = std::fs::read(&paths[0]).unwrap();
    let second = std::fs::read(&paths[1]).unwrap();
    assert_eq!(first, second);
}

#[test]
fn dot_metric_returns_true_inner_products() {
    let mut index = Hnsw::new(2, Metric::Dot);
    index.add_data(&[3.0, 0.0]).unwrap();
    index.add_data(&[2.0, 0.0]).unwrap();
    index.add_data(&[1.0, 0.0]).unwrap();
    index.build(small_config()).unwrap();

    let result = index.search_by_vector(&[1.0, 0.0], 3, Some(30)).unwrap();
    let ids: Vec<u32> = result.iter().map(|n| n.pid.0).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    let distances: Vec<f32> = result.iter().map(|n| n.distance).collect();
    assert_eq!(distances, vec![3.0, 2.0, 1.0]);
}

#[test]
fn small_ef_falls_back_to_the_bounded_variant() {
    let mut index = Hnsw::new(2, Metric::L2);
    for i in 0..30 {
        index.add_data(&[i as f32, 0.0]).unwrap();
    }
    index.build(small_config()).unwrap();

    // ef < k takes the bounded-visit path, which may return fewer than k
    let result = index.search_by_vector(&[4.2, 0.0], 10, Some(2)).unwrap();
    assert!(!result.is_empty());
    assert!(result.len() <= 10);
    for pair in result.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn batch_search_matches_single_searches() {
    let mut index = Hnsw::new(4, Metric::L2);
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..100 {
        let v: [f32; 4] = rng.gen();
        index.add_data(&v).unwrap();
    }
    index.build(small_config()).unwrap();

    let queries: Vec<Vec<f32>> = (0..16).map(|_| (0..4).map(|_| rng.gen()).collect()).collect();
    let batched = index
        .batch_search_by_vectors(&queries, 5, Some(50), 4)
        .unwrap();
    assert_eq!(batched.len(), queries.len());
    for (query, batch_result) in queries.iter().zip(&batched) {
        let single = index.search_by_vector(query, 5, Some(50)).unwrap();
        assert_eq!(batch_result, &single);
    }

    let ids: Vec<PointId> = (0..10).map(PointId).collect();
    let by_ids = index.batch_search_by_ids(&ids, 3, Some(30), 2).unwrap();
    for (id, result) in ids.iter().zip(&by_ids) {
        assert_eq!(result[0].pid, *id);
    }
}

#[test]
fn merge_level0_build_is_searchable() {
    let mut index = Hnsw::new(2, Metric::L2);
    let mut rng = StdRng::seed_from_u64(9);
    for _ in 0..150 {
        let v: [f32; 2] = rng.gen();
        index.add_data(&v).unwrap();
    }
    index
        .build(
            small_config()
                .graph_merging(GraphMerging::MergeLevel0)
                .neighbor_selecting(NeighborSelecting::HeuristicSaveRemains),
        )
        .unwrap();

    let result = index.search_by_vector(&[0.5, 0.5], 10, Some(100)).unwrap();
    assert_eq!(result.len(), 10);
    index.print_degree_dist().unwrap();
}

#[test]
fn randomized_recall_against_brute_force() {
    let seed = 123456789;
    let mut rng = StdRng::seed_from_u64(seed);
    let points: Vec<[f32; 8]> = (0..512).map(|_| rng.gen()).collect();
    let query: [f32; 8] = rng.gen();

    let mut nearest: Vec<(OrderedFloat<f32>, u32)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            (
                OrderedFloat(smallworld::squared_l2_distance(&query, p)),
                i as u32,
            )
        })
        .collect();
    nearest.sort_unstable();
    let expected: HashSet<u32> = nearest[..10].iter().map(|(_, i)| *i).collect();

    let mut index = Hnsw::new(8, Metric::L2);
    for p in &points {
        index.add_data(p).unwrap();
    }
    index
        .build(BuildConfig::default().m(12).max_m0(24).ef_construction(200))
        .unwrap();

    let found: HashSet<u32> = index
        .search_by_vector(&query, 10, Some(300))
        .unwrap()
        .iter()
        .map(|n| n.pid.0)
        .collect();

    let recall = expected.intersection(&found).count();
    println!("recall (seed = {seed}) = {recall}/10");
    assert!(recall >= 9, "expected at least 9 of 10, got {recall}");
}

#[test]
fn naive_selection_also_builds_a_searchable_graph() {
    let mut index = Hnsw::new(2, Metric::L2);
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..80 {
        let v: [f32; 2] = rng.gen();
        index.add_data(&v).unwrap();
    }
    index
        .build(small_config().neighbor_selecting(NeighborSelecting::Naive))
        .unwrap();

    let result = index.search_by_vector(&[0.3, 0.3], 5, Some(60)).unwrap();
    assert_eq!(result.len(), 5);
}

#[test]
fn load_missing_file_is_an_io_error() {
    let mut index = Hnsw::new(0, Metric::L2);
    assert!(matches!(
        index.load_model("definitely-not-here.n2", false),
        Err(Error::Io { .. })
    ));
}

#[test]
fn load_rejects_dimension_conflict() {
    let mut index = Hnsw::new(3, Metric::L2);
    index.add_data(&[0.0, 0.0, 1.0]).unwrap();
    index.add_data(&[0.0, 1.0, 0.0]).unwrap();
    index.build(small_config()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("d3.n2");
    index.save_model(&path).unwrap();

    let mut other = Hnsw::new(4, Metric::L2);
    assert!(matches!(
        other.load_model(&path, false),
        Err(Error::Format { .. })
    ));
}
