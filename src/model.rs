//! Puzzle records and response payload types.

use serde::{Deserialize, Serialize};

/// One puzzle from the catalog. Row order at build time is the join key
/// to the embedding matrix and the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleRecord {
    /// Unique, stable, opaque public token.
    pub id: String,
    #[serde(default)]
    pub fen: String,
    #[serde(default)]
    pub moves: Vec<String>,
    #[serde(default)]
    pub rating: i32,
    #[serde(default)]
    pub themes: Vec<String>,
}

impl PuzzleRecord {
    /// Theme used for diversity bucketing: the first tag, or "Other" when
    /// the record carries none.
    pub fn primary_theme(&self) -> &str {
        self.themes.first().map(String::as_str).unwrap_or("Other")
    }
}

/// One entry of a similarity response, ordered by ascending score
/// (squared L2 distance, smaller = more similar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPuzzle {
    pub puzzle_id: String,
    pub score: f32,
    pub fen: String,
    pub moves: Vec<String>,
    pub rating: i32,
    pub themes: Vec<String>,
}

/// Payload for a similarity query, also the unit stored in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarResponse {
    pub query_puzzle_id: String,
    pub results: Vec<SimilarPuzzle>,
}
