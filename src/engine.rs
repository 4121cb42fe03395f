//! Similarity engine: oversampled raw search against the inverted-file
//! index.
//!
//! Downstream filtering (self-exclusion, rating ceiling, metadata
//! existence) may remove candidates, so the engine requests more raw
//! candidates than the caller's final `k`. If filtering still leaves fewer
//! than `k`, the caller returns the shorter list; there is no
//! retry-with-larger-oversample loop.

use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::index::IvfIndex;

pub struct SimilarityEngine {
    index: Arc<IvfIndex>,
}

impl SimilarityEngine {
    pub fn new(index: Arc<IvfIndex>) -> Self {
        Self { index }
    }

    /// Raw candidates for a final top-`k`, ascending by squared L2
    /// distance, padded with sentinel `(-1, f32::MAX)` entries that
    /// callers must filter.
    pub fn search(&self, query: &[f32], k: usize) -> ServiceResult<Vec<(i64, f32)>> {
        let oversampled = (k + 32).min(k + 128);
        self.index
            .search(query, oversampled)
            .map_err(|e| ServiceError::StructuralMismatch(e.to_string()))
    }
}
