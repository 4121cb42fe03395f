//! Startup configuration, resolved once at process start.
//!
//! Defaults mirror the environment variables the service has historically
//! honored (`INDEX_PATH`, `META_PATH`, `EMB_PATH`, `SIM_TTL_SEC`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::index::BuildOptions;
use crate::index::builder::DEFAULT_NLIST;
use crate::index::ivf::DEFAULT_NPROBE;

/// Resolved serving configuration.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
    /// Optional raw embedding matrix consumed only as a reconstruction
    /// fallback.
    pub embeddings_path: Option<PathBuf>,
    pub cache_ttl: Duration,
    pub nprobe: usize,
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Persisted index artifact
    #[arg(long, env = "INDEX_PATH", default_value = "./db/index.pziv")]
    pub index: PathBuf,

    /// Metadata file (.json / .jsonl / .parquet)
    #[arg(long, env = "META_PATH", default_value = "./db/metadata.json")]
    pub metadata: PathBuf,

    /// Optional NPY fallback embedding matrix
    #[arg(long, env = "EMB_PATH")]
    pub embeddings: Option<PathBuf>,

    /// Result cache time-to-live in seconds
    #[arg(long, env = "SIM_TTL_SEC", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Inverted lists probed per query (recall/latency knob)
    #[arg(long, default_value_t = DEFAULT_NPROBE)]
    pub nprobe: usize,

    /// Listen address for the HTTP adapter
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,
}

impl ServeArgs {
    pub fn into_config(self) -> ServeConfig {
        ServeConfig {
            index_path: self.index,
            metadata_path: self.metadata,
            embeddings_path: self.embeddings,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            nprobe: self.nprobe,
            listen: self.listen,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// NPY float32 matrix of shape (N, d), row order = metadata order
    #[arg(long, env = "VECTORS_PATH", default_value = "./db/vectors_merged.npy")]
    pub vectors: PathBuf,

    /// Source metadata (.json / .jsonl / .parquet)
    #[arg(long, env = "META_PATH", default_value = "./db/metadata_fixed_ids.jsonl")]
    pub metadata: PathBuf,

    /// Output index artifact
    #[arg(long, default_value = "./db/index.pziv")]
    pub index_out: PathBuf,

    /// Output canonical metadata JSON array
    #[arg(long, default_value = "./db/metadata.json")]
    pub metadata_out: PathBuf,

    /// Cluster count for the coarse quantizer
    #[arg(long, default_value_t = DEFAULT_NLIST)]
    pub nlist: usize,

    /// RNG seed for deterministic builds
    #[arg(long)]
    pub seed: Option<u64>,
}

impl BuildArgs {
    pub fn into_options(self) -> BuildOptions {
        BuildOptions {
            vectors_path: self.vectors,
            metadata_path: self.metadata,
            index_out: self.index_out,
            metadata_out: self.metadata_out,
            nlist: self.nlist,
            seed: self.seed,
        }
    }
}
