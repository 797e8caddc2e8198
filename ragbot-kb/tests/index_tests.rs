//! Property tests for similarity index search ordering.

use ragbot_kb::{Chunk, KbError, LinearIndex, SimilarityIndex, cosine_similarity};
use proptest::prelude::*;

/// Generate a non-zero L2-normalized vector of the given dimension.
fn arb_normalized_vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim).prop_filter_map("non-zero vector", |mut v| {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < 1e-6 {
            return None;
        }
        for val in &mut v {
            *val /= norm;
        }
        Some(v)
    })
}

fn indexed(vectors: &[Vec<f32>]) -> LinearIndex {
    let mut index = LinearIndex::new();
    for (i, vector) in vectors.iter().enumerate() {
        let chunk = Chunk::new(format!("doc_{}", i % 3), i, format!("chunk {i}"), 0, 0);
        index.add(chunk, vector.clone()).unwrap();
    }
    index
}

/// **Property: search results are bounded, filtered and ordered**
/// *For any* indexed vectors, query, k and threshold, search returns at most
/// k results, each scoring at least the threshold, in non-increasing score
/// order, and no qualifying entry is left out while fewer than k are returned.
mod prop_search_ordering {
    use super::*;

    const DIM: usize = 8;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn results_bounded_filtered_and_descending(
            vectors in proptest::collection::vec(arb_normalized_vector(DIM), 1..30),
            query in arb_normalized_vector(DIM),
            k in 1usize..35,
            threshold in 0.0f32..1.0f32,
        ) {
            let index = indexed(&vectors);
            let results = index.search(&query, k, threshold).unwrap();

            prop_assert!(results.len() <= k);
            for result in &results {
                prop_assert!(result.score >= threshold);
            }
            for pair in results.windows(2) {
                prop_assert!(
                    pair[0].score >= pair[1].score,
                    "not descending: {} < {}",
                    pair[0].score,
                    pair[1].score
                );
            }

            let qualifying = vectors
                .iter()
                .filter(|v| cosine_similarity(&query, v) >= threshold)
                .count();
            prop_assert_eq!(results.len(), qualifying.min(k));
        }

        #[test]
        fn equal_scores_keep_insertion_order(
            vector in arb_normalized_vector(DIM),
            copies in 2usize..10,
        ) {
            let vectors = vec![vector.clone(); copies];
            let index = indexed(&vectors);
            let results = index.search(&vector, copies, 0.0).unwrap();

            let order: Vec<usize> = results.iter().map(|r| r.chunk.index).collect();
            prop_assert_eq!(order, (0..copies).collect::<Vec<_>>());
        }
    }
}

#[test]
fn empty_index_and_zero_k_return_nothing() {
    let index = LinearIndex::new();
    assert!(index.search(&[1.0, 0.0], 3, 0.0).unwrap().is_empty());

    let index = indexed(&[vec![1.0, 0.0]]);
    assert!(index.search(&[1.0, 0.0], 0, 0.0).unwrap().is_empty());
}

#[test]
fn query_dimension_mismatch_is_an_error() {
    let index = indexed(&[vec![1.0, 0.0, 0.0]]);
    let err = index.search(&[1.0, 0.0], 1, 0.0).unwrap_err();
    assert!(matches!(err, KbError::DimensionMismatch { expected: 3, actual: 2 }));
}

#[test]
fn failed_replace_leaves_previous_entries() {
    let mut index = LinearIndex::new();
    index.add(Chunk::new("a", 0, "alpha", 0, 0), vec![1.0, 0.0]).unwrap();
    index.add(Chunk::new("b", 0, "beta", 0, 0), vec![0.0, 1.0]).unwrap();

    let err = index
        .replace_document(
            "a",
            vec![
                (Chunk::new("a", 0, "alpha v2", 0, 0), vec![1.0, 0.0]),
                (Chunk::new("a", 1, "more", 8, 0), vec![1.0, 0.0, 0.0]),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, KbError::DimensionMismatch { .. }));
    assert_eq!(index.chunk_count_for("a"), 1);

    let results = index.search(&[1.0, 0.0], 1, 0.5).unwrap();
    assert_eq!(results[0].chunk.text, "alpha");
}

#[test]
fn replacing_the_only_document_may_change_dimension() {
    let mut index = LinearIndex::new();
    index.add(Chunk::new("a", 0, "alpha", 0, 0), vec![1.0, 0.0]).unwrap();

    let count = index
        .replace_document("a", vec![(Chunk::new("a", 0, "alpha", 0, 0), vec![0.0, 0.0, 1.0])])
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(index.dimensions(), Some(3));
}

#[test]
fn removal_drops_a_document_from_results() {
    let mut index = indexed(&[vec![1.0, 0.0], vec![0.9, 0.1], vec![0.8, 0.2]]);
    assert_eq!(index.document_ids(), vec!["doc_0", "doc_1", "doc_2"]);

    assert_eq!(index.remove("doc_1"), 1);
    let results = index.search(&[1.0, 0.0], 10, 0.0).unwrap();
    assert!(results.iter().all(|r| r.document_id() != "doc_1"));
    assert_eq!(index.remove("doc_1"), 0);
}
