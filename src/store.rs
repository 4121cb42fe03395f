//! Vector store: row-indexed vector lookup with a fallback chain.
//!
//! The primary path reconstructs the raw vector from the index itself
//! (IVF-flat retains raw vectors); rows the index cannot produce fall back
//! to the memory-mapped embedding matrix at the same row index. Only when
//! both sources fail does the request-scoped `ReconstructionFailure`
//! surface.

use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::index::IvfIndex;
use crate::matrix::EmbeddingMatrix;

#[derive(Debug)]
pub struct VectorStore {
    index: Arc<IvfIndex>,
    fallback: Option<EmbeddingMatrix>,
}

impl VectorStore {
    /// Both sources must agree on dimension; disagreement is a fatal
    /// configuration error at startup.
    pub fn new(
        index: Arc<IvfIndex>,
        fallback: Option<EmbeddingMatrix>,
    ) -> Result<Self, ServiceError> {
        if let Some(matrix) = &fallback {
            if matrix.dim() != index.dimension() {
                return Err(ServiceError::StructuralMismatch(format!(
                    "index dimension {} but fallback matrix dimension {}",
                    index.dimension(),
                    matrix.dim()
                )));
            }
        }
        Ok(Self { index, fallback })
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn vector_for_row(&self, row: usize) -> ServiceResult<Vec<f32>> {
        if let Some(vector) = self.index.reconstruct(row) {
            return Ok(vector);
        }
        if let Some(matrix) = &self.fallback {
            if let Ok(vector) = matrix.row(row) {
                return Ok(vector.to_vec());
            }
        }
        Err(ServiceError::ReconstructionFailure(format!(
            "no source can produce a vector for row {row}"
        )))
    }
}
