//! Thread-safety tests: parallel inserts and search-under-insert.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use cairn::{HierIndex, HierParams, SearchParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim).map(|_| rng.random::<f32>() * 4.0 - 2.0).collect()
}

fn params(capacity: usize) -> HierParams {
    HierParams {
        max_degree: 12,
        ef_construct: 40,
        capacity,
        seed: Some(17),
        ..HierParams::default()
    }
}

#[test]
fn parallel_inserts_preserve_invariants() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 100;
    const DIM: usize = 8;

    let index = HierIndex::new(DIM, params(THREADS * PER_THREAD)).unwrap();

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let index = &index;
            scope.spawn(move || {
                let vectors = random_vectors(PER_THREAD, DIM, t as u64);
                let labels: Vec<u64> =
                    ((t * PER_THREAD) as u64..((t + 1) * PER_THREAD) as u64).collect();
                let failed = index.insert(&labels, &vectors).unwrap();
                assert!(failed.is_empty());
            });
        }
    });

    assert_eq!(index.len(), THREADS * PER_THREAD);
    index.check_integrity().unwrap();

    // The entry point must live at the top of the hierarchy and searches
    // must traverse the merged graph.
    assert!(index.entry_point().is_some());
    let query = random_vectors(1, DIM, 999);
    let hits = index
        .knn_search(&query, 10, &SearchParams { ef_search: 50 }, None)
        .unwrap();
    assert_eq!(hits.len(), 10);
}

#[test]
fn concurrent_duplicate_labels_resolve_to_one_winner() {
    const THREADS: usize = 4;
    const N: usize = 50;
    const DIM: usize = 4;

    let index = HierIndex::new(DIM, params(THREADS * N)).unwrap();

    // Every thread tries the same label range; exactly one insert per label
    // may win.
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let index = &index;
            scope.spawn(move || {
                let vectors = random_vectors(N, DIM, 100 + t as u64);
                let labels: Vec<u64> = (0..N as u64).collect();
                index.insert(&labels, &vectors).unwrap();
            });
        }
    });

    assert_eq!(index.len(), N);
    index.check_integrity().unwrap();
}

#[test]
fn search_during_insert_returns_only_registered_labels() {
    const DIM: usize = 8;
    const WRITER_BATCHES: usize = 20;
    const BATCH: usize = 25;

    let index = HierIndex::new(DIM, params(WRITER_BATCHES * BATCH)).unwrap();
    // Seed a little data so searches have something to chew on immediately.
    let labels: Vec<u64> = (0..BATCH as u64).collect();
    index
        .insert(&labels, &random_vectors(BATCH, DIM, 0))
        .unwrap();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let index_ref = &index;
        let done_ref = &done;

        scope.spawn(move || {
            for b in 1..WRITER_BATCHES {
                let labels: Vec<u64> = ((b * BATCH) as u64..((b + 1) * BATCH) as u64).collect();
                index_ref
                    .insert(&labels, &random_vectors(BATCH, DIM, b as u64))
                    .unwrap();
            }
            done_ref.store(true, Ordering::Release);
        });

        for r in 0..2 {
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(7000 + r);
                let all: HashSet<u64> = (0..(WRITER_BATCHES * BATCH) as u64).collect();
                while !done_ref.load(Ordering::Acquire) {
                    let query: Vec<f32> =
                        (0..DIM).map(|_| rng.random::<f32>() * 4.0 - 2.0).collect();
                    let hits = index_ref
                        .knn_search(&query, 5, &SearchParams { ef_search: 30 }, None)
                        .unwrap();
                    for (label, distance) in &hits {
                        assert!(all.contains(label), "unknown label {label} returned");
                        assert!(distance.is_finite());
                    }
                    // Ascending order must hold even mid-construction.
                    for pair in hits.windows(2) {
                        assert!(pair[0].1 <= pair[1].1);
                    }
                }
            });
        }
    });

    assert_eq!(index.len(), WRITER_BATCHES * BATCH);
    index.check_integrity().unwrap();
}
