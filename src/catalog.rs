//! Metadata catalog: the row-indexed puzzle records and the inverse id map.
//!
//! Built once at startup from a persisted collection. Three physical
//! encodings are supported, chosen by file extension:
//!
//! - `.json`: whole-document JSON array of records
//! - `.jsonl`: newline-delimited JSON, one record per line
//! - `.parquet`: columnar table with the same column names
//!
//! All three normalize to [`PuzzleRecord`]: `themes` (and `moves`) become a
//! list of strings whatever the source shape was (absent/null -> empty list,
//! bare scalar -> single-element list), `rating` defaults to 0. Row order in
//! the file is the row index, the join key to the vector store.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::error::ServiceError;
use crate::model::PuzzleRecord;

pub struct MetadataCatalog {
    records: Vec<PuzzleRecord>,
    id_to_row: HashMap<String, usize>,
}

impl MetadataCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let values = match ext {
            "jsonl" => load_jsonl(path)?,
            "parquet" => load_parquet(path)?,
            _ => load_json_array(path)?,
        };
        let catalog = Self::from_values(values)?;
        tracing::info!(records = catalog.len(), path = %path.display(), "catalog_loaded");
        Ok(catalog)
    }

    /// Normalize raw JSON objects into the uniform record list and build the
    /// inverse id index. A duplicate or missing id is a fatal load error.
    pub fn from_values(values: Vec<Value>) -> Result<Self> {
        let mut records = Vec::with_capacity(values.len());
        let mut id_to_row = HashMap::with_capacity(values.len());
        for (row, value) in values.into_iter().enumerate() {
            let record = record_from_value(value)
                .with_context(|| format!("invalid metadata record at row {row}"))?;
            if id_to_row.insert(record.id.clone(), row).is_some() {
                bail!("duplicate puzzle id {:?} at row {row}", record.id);
            }
            records.push(record);
        }
        Ok(Self { records, id_to_row })
    }

    pub fn from_records(records: Vec<PuzzleRecord>) -> Result<Self> {
        let mut id_to_row = HashMap::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            if id_to_row.insert(record.id.clone(), row).is_some() {
                bail!("duplicate puzzle id {:?} at row {row}", record.id);
            }
        }
        Ok(Self { records, id_to_row })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_row(&self, row: usize) -> Option<&PuzzleRecord> {
        self.records.get(row)
    }

    pub fn row_for_id(&self, id: &str) -> Option<usize> {
        self.id_to_row.get(id).copied()
    }

    pub fn records(&self) -> &[PuzzleRecord] {
        &self.records
    }

    /// Row-to-record must be a bijection over `[0, N)` with the vector set.
    pub fn ensure_row_count(&self, vector_count: usize) -> Result<(), ServiceError> {
        if self.records.len() != vector_count {
            return Err(ServiceError::StructuralMismatch(format!(
                "{} metadata records but {} vectors",
                self.records.len(),
                vector_count
            )));
        }
        Ok(())
    }
}

fn load_json_array(path: &Path) -> Result<Vec<Value>> {
    let file =
        File::open(path).with_context(|| format!("open metadata file {}", path.display()))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse metadata JSON {}", path.display()))?;
    match value {
        Value::Array(values) => Ok(values),
        other => bail!(
            "metadata file {} is not a JSON array (got {})",
            path.display(),
            json_type_name(&other)
        ),
    }
}

fn load_jsonl(path: &Path) -> Result<Vec<Value>> {
    let file =
        File::open(path).with_context(|| format!("open metadata file {}", path.display()))?;
    let mut values = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {} line {}", path.display(), line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), line_no + 1))?;
        values.push(value);
    }
    Ok(values)
}

fn load_parquet(path: &Path) -> Result<Vec<Value>> {
    use parquet::file::reader::{FileReader, SerializedFileReader};

    let file =
        File::open(path).with_context(|| format!("open metadata file {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet metadata {}", path.display()))?;
    let mut values = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row.context("read parquet row")?;
        values.push(row.to_json_value());
    }
    Ok(values)
}

fn record_from_value(value: Value) -> Result<PuzzleRecord> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => bail!("expected a JSON object, got {}", json_type_name(&other)),
    };
    let id = match obj.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => bail!("id must be a string, got {}", json_type_name(other)),
        None => bail!("record has no id field"),
    };
    let fen = obj
        .get("fen")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let rating = obj
        .get("rating")
        .and_then(Value::as_f64)
        .map(|r| r as i32)
        .unwrap_or(0);
    Ok(PuzzleRecord {
        id,
        fen,
        moves: string_list(obj.get("moves")),
        rating,
        themes: string_list(obj.get("themes")),
    })
}

/// Coerce a source field to a list of strings: absent/null -> empty,
/// list -> element-wise string coercion, bare scalar -> one-element list.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(scalar_string).collect(),
        Some(scalar) => vec![scalar_string(scalar)],
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Persist the catalog as a single JSON array in row order, the canonical
/// encoding the serving process reads after a build.
pub fn write_json_array(path: &Path, records: &[PuzzleRecord]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = path.with_extension("json.tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("create temp metadata file {}", temp_path.display()))?;
    serde_json::to_writer(&file, records).context("serialize metadata array")?;
    file.sync_all().context("fsync metadata temp file")?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("rename metadata temp file {}", temp_path.display()))?;
    let dir = File::open(parent)?;
    dir.sync_all().context("fsync metadata directory")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_json_array_and_builds_inverse_index() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(
            &dir,
            "meta.json",
            r#"[
                {"id": "00001", "fen": "8/8/8/8/8/8/8/8 w - -", "moves": ["e2e4"], "rating": 1200, "themes": ["pin", "endgame"]},
                {"id": "00002", "fen": "8/8/8/8/8/8/8/8 b - -", "moves": [], "rating": 1800, "themes": ["fork"]}
            ]"#,
        );
        let catalog = MetadataCatalog::load(&path)?;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.row_for_id("00002"), Some(1));
        assert_eq!(catalog.by_row(0).unwrap().themes, vec!["pin", "endgame"]);
        Ok(())
    }

    #[test]
    fn loads_jsonl_skipping_blank_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(
            &dir,
            "meta.jsonl",
            "{\"id\": \"a\", \"rating\": 900}\n\n{\"id\": \"b\", \"rating\": 1100}\n",
        );
        let catalog = MetadataCatalog::load(&path)?;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.by_row(1).unwrap().id, "b");
        Ok(())
    }

    #[test]
    fn normalizes_theme_shapes() -> Result<()> {
        let values = vec![
            serde_json::json!({"id": "a", "themes": null}),
            serde_json::json!({"id": "b"}),
            serde_json::json!({"id": "c", "themes": "pin"}),
            serde_json::json!({"id": "d", "themes": ["pin", "fork"]}),
        ];
        let catalog = MetadataCatalog::from_values(values)?;
        assert!(catalog.by_row(0).unwrap().themes.is_empty());
        assert!(catalog.by_row(1).unwrap().themes.is_empty());
        assert_eq!(catalog.by_row(2).unwrap().themes, vec!["pin"]);
        assert_eq!(catalog.by_row(3).unwrap().themes, vec!["pin", "fork"]);
        Ok(())
    }

    #[test]
    fn missing_rating_defaults_to_zero() -> Result<()> {
        let catalog = MetadataCatalog::from_values(vec![serde_json::json!({"id": "a"})])?;
        assert_eq!(catalog.by_row(0).unwrap().rating, 0);
        Ok(())
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let values = vec![
            serde_json::json!({"id": "same"}),
            serde_json::json!({"id": "same"}),
        ];
        assert!(MetadataCatalog::from_values(values).is_err());
    }

    #[test]
    fn non_string_id_is_rejected() {
        let values = vec![serde_json::json!({"id": 7})];
        assert!(MetadataCatalog::from_values(values).is_err());
    }

    #[test]
    fn row_id_round_trip_is_a_bijection() -> Result<()> {
        let values = (0..20)
            .map(|i| serde_json::json!({"id": format!("{i:05}"), "rating": 1000 + i}))
            .collect();
        let catalog = MetadataCatalog::from_values(values)?;
        for row in 0..catalog.len() {
            let record = catalog.by_row(row).unwrap();
            assert_eq!(catalog.row_for_id(&record.id), Some(row));
        }
        Ok(())
    }

    #[test]
    fn row_count_mismatch_is_structural() -> Result<()> {
        let catalog = MetadataCatalog::from_values(vec![serde_json::json!({"id": "a"})])?;
        assert!(catalog.ensure_row_count(1).is_ok());
        let err = catalog.ensure_row_count(2).unwrap_err();
        assert!(matches!(err, ServiceError::StructuralMismatch(_)));
        Ok(())
    }

    #[test]
    fn json_array_round_trips_through_canonical_form() -> Result<()> {
        let dir = TempDir::new()?;
        let records = vec![
            PuzzleRecord {
                id: "a".into(),
                fen: "fen-a".into(),
                moves: vec!["e2e4".into()],
                rating: 1500,
                themes: vec!["pin".into()],
            },
            PuzzleRecord {
                id: "b".into(),
                fen: "fen-b".into(),
                moves: vec![],
                rating: 1700,
                themes: vec![],
            },
        ];
        let path = dir.path().join("meta.json");
        write_json_array(&path, &records)?;
        let loaded = MetadataCatalog::load(&path)?;
        assert_eq!(loaded.records(), records.as_slice());
        Ok(())
    }
}
