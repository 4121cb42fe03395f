//! Offline index build pipeline: train on a sample, populate with every
//! vector, persist the artifact and the canonical metadata array.
//!
//! This is a rerunnable batch job; any step failure aborts the whole build
//! and no partial artifacts are published (persistence is atomic).

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{SeedableRng, seq::index::sample};

use crate::catalog::{self, MetadataCatalog};
use crate::error::ServiceError;
use crate::index::ivf::{CoarseQuantizer, IvfIndex};
use crate::matrix::EmbeddingMatrix;

/// Training sample cap; beyond this k-means gains little and slows down.
pub const TRAIN_SAMPLE_CAP: usize = 200_000;

/// Cluster count default for multi-hundred-thousand-row collections. Too
/// few clusters degrades recall, too many degrades training stability and
/// query latency from boundary effects.
pub const DEFAULT_NLIST: usize = 4096;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// NPY float32 matrix, shape (N, d), row order = metadata order.
    pub vectors_path: PathBuf,
    /// Metadata in any supported encoding (.json / .jsonl / .parquet).
    pub metadata_path: PathBuf,
    /// Output PZIV artifact.
    pub index_out: PathBuf,
    /// Output canonical metadata JSON array, row order = build order.
    pub metadata_out: PathBuf,
    pub nlist: usize,
    /// Seed for the training sample and k-means init; None draws from
    /// the OS for production builds.
    pub seed: Option<u64>,
}

pub fn run_build(opts: BuildOptions) -> Result<()> {
    let matrix = EmbeddingMatrix::open(&opts.vectors_path).context("open vector matrix")?;
    let catalog = MetadataCatalog::load(&opts.metadata_path).context("load metadata")?;
    catalog
        .ensure_row_count(matrix.rows())
        .map_err(|e| ServiceError::BuildFailure(e.to_string()))?;

    let n = matrix.rows();
    let dimension = matrix.dim();
    let mut rng = match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let train_size = TRAIN_SAMPLE_CAP.min(n);
    let nlist = opts.nlist.min(train_size).max(1);
    if nlist < opts.nlist {
        tracing::warn!(
            requested = opts.nlist,
            effective = nlist,
            "nlist clamped to training sample size"
        );
    }

    tracing::info!(n, dimension, train_size, nlist, "ivf_train_start");
    let mut training = Vec::with_capacity(train_size * dimension);
    for row in sample(&mut rng, n, train_size) {
        training.extend_from_slice(matrix.row(row)?);
    }
    let quantizer = CoarseQuantizer::train(dimension, nlist, &training, &mut rng)
        .context("train coarse quantizer")?;
    drop(training);
    tracing::info!("ivf_train_complete");

    let mut entries = Vec::with_capacity(n);
    for row in 0..n {
        entries.push((row as u32, matrix.row(row)?.to_vec()));
    }
    let index = IvfIndex::build(quantizer, entries).context("populate inverted lists")?;
    tracing::info!(count = index.count(), "ivf_populate_complete");

    index
        .save(&opts.index_out)
        .with_context(|| format!("persist index to {}", opts.index_out.display()))?;
    catalog::write_json_array(&opts.metadata_out, catalog.records())
        .with_context(|| format!("persist metadata to {}", opts.metadata_out.display()))?;
    tracing::info!(
        index = %opts.index_out.display(),
        metadata = %opts.metadata_out.display(),
        "build_complete"
    );
    Ok(())
}
