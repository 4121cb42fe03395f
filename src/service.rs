//! Query service: composes catalog, vector store, similarity engine, and
//! result cache behind the request contract the transport adapter exposes.
//!
//! Everything except the cache is immutable after startup, so the service
//! is shared across request tasks as a plain `Arc` with lock-free reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::cache::ResultCache;
use crate::catalog::MetadataCatalog;
use crate::config::ServeConfig;
use crate::engine::SimilarityEngine;
use crate::error::{ServiceError, ServiceResult};
use crate::index::{IvfIndex, NO_MATCH_ROW};
use crate::matrix::EmbeddingMatrix;
use crate::model::{PuzzleRecord, SimilarPuzzle, SimilarResponse};
use crate::store::VectorStore;

pub struct QueryService {
    catalog: MetadataCatalog,
    store: VectorStore,
    engine: SimilarityEngine,
    cache: ResultCache,
}

impl QueryService {
    /// Load all serving sources and verify the structural invariants.
    /// Any failure here is fatal; the service must not accept traffic.
    pub fn open(config: &ServeConfig) -> Result<Arc<Self>> {
        let index = Arc::new(
            IvfIndex::load(&config.index_path)
                .context("load index artifact")?
                .with_nprobe(config.nprobe),
        );
        let catalog = MetadataCatalog::load(&config.metadata_path).context("load metadata")?;
        let fallback = match &config.embeddings_path {
            Some(path) => Some(EmbeddingMatrix::open(path).context("open fallback embeddings")?),
            None => None,
        };
        let service = Self::assemble(catalog, index, fallback, config.cache_ttl)?;
        Ok(Arc::new(service))
    }

    /// Wire the components together, enforcing row-count and dimension
    /// agreement across all sources.
    pub fn assemble(
        catalog: MetadataCatalog,
        index: Arc<IvfIndex>,
        fallback: Option<EmbeddingMatrix>,
        cache_ttl: Duration,
    ) -> Result<Self, ServiceError> {
        catalog.ensure_row_count(index.count())?;
        if let Some(matrix) = &fallback {
            if matrix.rows() != index.count() {
                return Err(ServiceError::StructuralMismatch(format!(
                    "index holds {} vectors but fallback matrix has {} rows",
                    index.count(),
                    matrix.rows()
                )));
            }
        }
        let store = VectorStore::new(Arc::clone(&index), fallback)?;
        Ok(Self {
            catalog,
            store,
            engine: SimilarityEngine::new(index),
            cache: ResultCache::new(cache_ttl),
        })
    }

    /// Top-`top_k` most similar puzzles to `puzzle_id`, post-filtered by
    /// the rating ceiling. Deterministic for a frozen index; identical
    /// parameters within the cache TTL are served from cache.
    pub fn find_similar(
        &self,
        puzzle_id: &str,
        top_k: usize,
        exclude_self: bool,
        max_rating: i32,
    ) -> ServiceResult<SimilarResponse> {
        let key = format!("sim:{puzzle_id}:{top_k}:{exclude_self}:{max_rating}");
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let query_row = self
            .catalog
            .row_for_id(puzzle_id)
            .ok_or_else(|| ServiceError::NotFound(puzzle_id.to_string()))?;
        let query = self.store.vector_for_row(query_row)?;
        let candidates = self.engine.search(&query, top_k)?;

        let mut results = Vec::with_capacity(top_k);
        for (raw_row, distance) in candidates {
            if raw_row == NO_MATCH_ROW {
                continue;
            }
            let row = raw_row as usize;
            if exclude_self && row == query_row {
                continue;
            }
            let Some(record) = self.catalog.by_row(row) else {
                continue;
            };
            if record.rating >= max_rating {
                continue;
            }
            results.push(SimilarPuzzle {
                puzzle_id: record.id.clone(),
                score: distance,
                fen: record.fen.clone(),
                moves: record.moves.clone(),
                rating: record.rating,
                themes: record.themes.clone(),
            });
            if results.len() >= top_k {
                break;
            }
        }

        let payload = SimilarResponse {
            query_puzzle_id: puzzle_id.to_string(),
            results,
        };
        self.cache.put(key, payload.clone());
        Ok(payload)
    }

    pub fn get_puzzle(&self, puzzle_id: &str) -> ServiceResult<PuzzleRecord> {
        let row = self
            .catalog
            .row_for_id(puzzle_id)
            .ok_or_else(|| ServiceError::NotFound(puzzle_id.to_string()))?;
        self.catalog
            .by_row(row)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(puzzle_id.to_string()))
    }

    /// Theme-diverse random sample: shuffle the under-ceiling pool, accept
    /// puzzles whose primary theme is unseen, then top up from the
    /// remaining pool (shuffle order, no duplicate ids) if diversity
    /// exhausts before `limit`. Non-deterministic per call.
    pub fn sample_diverse(&self, limit: usize, max_rating: i32) -> Vec<PuzzleRecord> {
        self.sample_diverse_with(limit, max_rating, &mut StdRng::from_entropy())
    }

    /// Deterministic variant with an injected random source, for tests.
    pub fn sample_diverse_with<R: Rng>(
        &self,
        limit: usize,
        max_rating: i32,
        rng: &mut R,
    ) -> Vec<PuzzleRecord> {
        let mut pool: Vec<&PuzzleRecord> = self
            .catalog
            .records()
            .iter()
            .filter(|record| record.rating < max_rating)
            .collect();
        pool.shuffle(rng);

        let mut seen_themes = std::collections::HashSet::new();
        let mut out: Vec<&PuzzleRecord> = Vec::with_capacity(limit);
        for record in &pool {
            if out.len() >= limit {
                break;
            }
            if seen_themes.insert(record.primary_theme()) {
                out.push(record);
            }
        }

        if out.len() < limit {
            let chosen: std::collections::HashSet<&str> =
                out.iter().map(|r| r.id.as_str()).collect();
            for record in &pool {
                if out.len() >= limit {
                    break;
                }
                if !chosen.contains(record.id.as_str()) {
                    out.push(record);
                }
            }
        }

        out.into_iter().cloned().collect()
    }

    /// Warm the cache for a likely upcoming query. Fire-and-forget:
    /// returns immediately, and the background computation's outcome is
    /// deliberately discarded.
    pub fn prefetch(
        self: &Arc<Self>,
        puzzle_id: String,
        top_k: usize,
        exclude_self: bool,
        max_rating: i32,
    ) {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = service.find_similar(&puzzle_id, top_k, exclude_self, max_rating) {
                tracing::debug!(puzzle_id = %puzzle_id, error = %err, "prefetch_skipped");
            }
        });
    }

    pub fn cached_responses(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CoarseQuantizer;

    fn record(id: &str, rating: i32, themes: &[&str]) -> PuzzleRecord {
        PuzzleRecord {
            id: id.to_string(),
            fen: format!("fen-{id}"),
            moves: vec!["e2e4".to_string()],
            rating,
            themes: themes.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn build_service(records: Vec<PuzzleRecord>, vectors: Vec<Vec<f32>>) -> Arc<QueryService> {
        let dimension = vectors[0].len();
        let training: Vec<f32> = vectors.iter().flatten().copied().collect();
        let mut rng = StdRng::seed_from_u64(17);
        let quantizer = CoarseQuantizer::train(dimension, 1, &training, &mut rng).unwrap();
        let index = Arc::new(
            IvfIndex::build(
                quantizer,
                vectors.into_iter().enumerate().map(|(i, v)| (i as u32, v)),
            )
            .unwrap(),
        );
        let catalog = MetadataCatalog::from_records(records).unwrap();
        Arc::new(
            QueryService::assemble(catalog, index, None, Duration::from_secs(300)).unwrap(),
        )
    }

    /// Unit vectors with controlled distance from the first axis:
    /// squared L2 between unit vectors is 2 - 2cos.
    fn vector_at(cos_to_a: f32) -> Vec<f32> {
        vec![cos_to_a, (1.0 - cos_to_a * cos_to_a).sqrt(), 0.0]
    }

    fn abc_service() -> Arc<QueryService> {
        // Distances from "a": 0.05 to "c", 0.1 to "b"; c is closer but
        // over the default rating ceiling.
        build_service(
            vec![
                record("a", 1200, &["pin"]),
                record("b", 1800, &["fork"]),
                record("c", 2200, &["pin"]),
            ],
            vec![vector_at(1.0), vector_at(0.95), vector_at(0.975)],
        )
    }

    #[test]
    fn rating_ceiling_drops_closer_candidate() -> ServiceResult<()> {
        let service = abc_service();
        let response = service.find_similar("a", 2, true, 2100)?;
        let ids: Vec<&str> = response.results.iter().map(|r| r.puzzle_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
        assert!(response.results[0].rating < 2100);
        Ok(())
    }

    #[test]
    fn results_ascend_by_score_without_ceiling() -> ServiceResult<()> {
        let service = abc_service();
        let response = service.find_similar("a", 3, true, 4000)?;
        let ids: Vec<&str> = response.results.iter().map(|r| r.puzzle_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        for pair in response.results.windows(2) {
            assert!(pair[0].score <= pair[1].score);
        }
        Ok(())
    }

    #[test]
    fn self_row_is_kept_when_not_excluded() -> ServiceResult<()> {
        let service = abc_service();
        let response = service.find_similar("a", 3, false, 4000)?;
        assert_eq!(response.results[0].puzzle_id, "a");
        assert!(response.results[0].score.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn unknown_id_is_not_found() {
        let service = abc_service();
        let err = service.find_similar("zzzzz", 5, true, 2100).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let err = service.get_puzzle("unknown-id").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn get_puzzle_returns_full_record() -> ServiceResult<()> {
        let service = abc_service();
        let puzzle = service.get_puzzle("b")?;
        assert_eq!(puzzle.rating, 1800);
        assert_eq!(puzzle.themes, vec!["fork"]);
        Ok(())
    }

    #[test]
    fn repeated_queries_hit_the_cache() -> ServiceResult<()> {
        let service = abc_service();
        let first = service.find_similar("a", 2, true, 2100)?;
        let second = service.find_similar("a", 2, true, 2100)?;
        assert_eq!(first, second);
        assert_eq!(service.cached_responses(), 1);
        Ok(())
    }

    fn diverse_service() -> Arc<QueryService> {
        build_service(
            vec![
                record("a", 1200, &["pin"]),
                record("b", 1800, &["fork"]),
                record("c", 1900, &["pin"]),
            ],
            vec![vector_at(1.0), vector_at(0.95), vector_at(0.975)],
        )
    }

    #[test]
    fn diverse_sample_prefers_distinct_primary_themes() {
        let service = diverse_service();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picks = service.sample_diverse_with(2, 2100, &mut rng);
            assert_eq!(picks.len(), 2);
            let themes: std::collections::HashSet<&str> =
                picks.iter().map(|p| p.primary_theme()).collect();
            assert_eq!(themes.len(), 2, "seed {seed} produced duplicate themes");
            assert!(picks.iter().all(|p| p.rating < 2100));
        }
    }

    #[test]
    fn diverse_sample_tops_up_when_themes_exhaust() {
        let service = build_service(
            vec![
                record("a", 1200, &["pin"]),
                record("b", 1500, &["pin"]),
                record("c", 1900, &["pin"]),
            ],
            vec![vector_at(1.0), vector_at(0.95), vector_at(0.975)],
        );
        let mut rng = StdRng::seed_from_u64(4);
        let picks = service.sample_diverse_with(3, 2100, &mut rng);
        assert_eq!(picks.len(), 3);
        let ids: std::collections::HashSet<&str> = picks.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn diverse_sample_is_bounded_by_the_filtered_pool() {
        let service = diverse_service();
        let mut rng = StdRng::seed_from_u64(8);
        let picks = service.sample_diverse_with(50, 1850, &mut rng);
        // Only a (1200) and b (1800) clear the ceiling.
        assert_eq!(picks.len(), 2);
    }

    #[tokio::test]
    async fn prefetch_warms_the_cache() {
        let service = abc_service();
        assert_eq!(service.cached_responses(), 0);
        service.prefetch("a".to_string(), 2, true, 2100);
        for _ in 0..100 {
            if service.cached_responses() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("prefetch never populated the cache");
    }

    #[tokio::test]
    async fn prefetch_swallows_unknown_ids() {
        let service = abc_service();
        service.prefetch("missing".to_string(), 2, true, 2100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.cached_responses(), 0);
    }
}
