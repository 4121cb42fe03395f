//! Client-facing error taxonomy for the query service.
//!
//! Startup and build failures travel through `anyhow` and abort the process;
//! the variants here are the errors a single request can surface without
//! affecting other in-flight requests.

use std::fmt;

/// Error type for query-service operations.
#[derive(Debug)]
pub enum ServiceError {
    /// The requested public puzzle id is not in the catalog.
    NotFound(String),
    /// Neither the index nor the fallback matrix could produce a vector
    /// for the resolved row. Affects only the current request.
    ReconstructionFailure(String),
    /// The loaded sources disagree structurally (count or dimension).
    /// Fatal at startup; a request hitting this indicates a broken deploy.
    StructuralMismatch(String),
    /// An offline build step failed. Never surfaced by the serving path.
    BuildFailure(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::NotFound(id) => write!(f, "puzzle id {id} not found"),
            ServiceError::ReconstructionFailure(msg) => {
                write!(f, "cannot reconstruct vector: {msg}")
            }
            ServiceError::StructuralMismatch(msg) => write!(f, "structural mismatch: {msg}"),
            ServiceError::BuildFailure(msg) => write!(f, "index build failed: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Result type for query-service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
