//! Inverted-file vector index: offline construction and the persisted
//! artifact the serving process memory-maps.

pub mod builder;
pub mod ivf;

pub use builder::{BuildOptions, DEFAULT_NLIST, run_build};
pub use ivf::{CoarseQuantizer, IvfIndex, NO_MATCH_ROW};
