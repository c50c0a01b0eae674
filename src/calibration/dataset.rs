//! Dataset collaborator
//!
//! Records are JSON objects; the calibration pipeline only looks at their
//! `code`, `prompt` or `text` field.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub type Record = Map<String, Value>;

/// Fields tried, in order, for the text of a record
pub const TEXT_FIELDS: [&str; 3] = ["code", "prompt", "text"];

/// Loads the records of one dataset split
pub trait DatasetLoader: Send + Sync {
    fn load(&self, name: &str, split: &str) -> Result<Vec<Record>>;
}

/// Split used for calibration: code benchmarks only ship a test split
pub fn split_for(dataset: &str) -> &'static str {
    match dataset {
        "mbpp" | "openai_humaneval" => "test",
        _ => "train",
    }
}

/// Text of a record from the first present text field
pub fn record_text(record: &Record) -> Result<&str> {
    TEXT_FIELDS
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))
        .ok_or(Error::UnrecognizedDatasetSchema)
}

/// Reads `<root>/<name>/<split>.jsonl`, or `name` itself when it is a
/// `.jsonl` file
#[derive(Debug, Clone)]
pub struct JsonlDatasetLoader {
    root: PathBuf,
}

impl JsonlDatasetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str, split: &str) -> PathBuf {
        let direct = Path::new(name);
        if direct.extension().is_some_and(|e| e == "jsonl") {
            return direct.to_path_buf();
        }
        self.root.join(name).join(format!("{split}.jsonl"))
    }
}

impl DatasetLoader for JsonlDatasetLoader {
    fn load(&self, name: &str, split: &str) -> Result<Vec<Record>> {
        let path = self.resolve(name, split);
        let file = std::fs::File::open(&path).map_err(|_| Error::CheckpointNotFound {
            path: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            file: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line)? {
                Value::Object(obj) => records.push(obj),
                _ => return Err(Error::UnrecognizedDatasetSchema),
            }
        }
        tracing::debug!(path = %path.display(), records = records.len(), "dataset loaded");
        Ok(records)
    }
}

/// Datasets held in memory, keyed by `(name, split)`
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    splits: BTreeMap<(String, String), Vec<Record>>,
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_split(mut self, name: &str, split: &str, records: Vec<Record>) -> Self {
        self.splits.insert((name.to_string(), split.to_string()), records);
        self
    }

    /// Single-split dataset of `{"text": ...}` records
    pub fn from_texts<'a>(name: &str, texts: impl IntoIterator<Item = &'a str>) -> Self {
        let records = texts
            .into_iter()
            .map(|t| {
                let mut r = Record::new();
                r.insert("text".to_string(), Value::String(t.to_string()));
                r
            })
            .collect();
        Self::new().with_split(name, split_for(name), records)
    }
}

impl DatasetLoader for InMemoryDataset {
    fn load(&self, name: &str, split: &str) -> Result<Vec<Record>> {
        self.splits
            .get(&(name.to_string(), split.to_string()))
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("dataset `{name}` has no `{split}` split")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_prompt_field_is_used() {
        let r = record(json!({"prompt": "def f():", "id": 3}));
        assert_eq!(record_text(&r).unwrap(), "def f():");
    }

    #[test]
    fn test_code_takes_priority() {
        let r = record(json!({"text": "b", "code": "a"}));
        assert_eq!(record_text(&r).unwrap(), "a");
    }

    #[test]
    fn test_unknown_schema_is_rejected() {
        let r = record(json!({"question": "?"}));
        assert!(matches!(record_text(&r), Err(Error::UnrecognizedDatasetSchema)));
    }

    #[test]
    fn test_code_benchmarks_use_test_split() {
        assert_eq!(split_for("mbpp"), "test");
        assert_eq!(split_for("openai_humaneval"), "test");
        assert_eq!(split_for("NeelNanda/pile-10k"), "train");
    }

    #[test]
    fn test_jsonl_loader_reads_split_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let split_dir = dir.path().join("pile");
        std::fs::create_dir_all(&split_dir).unwrap();
        let mut f = std::fs::File::create(split_dir.join("train.jsonl")).unwrap();
        writeln!(f, "{{\"text\": \"one\"}}").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{{\"text\": \"two\"}}").unwrap();
        let records = JsonlDatasetLoader::new(dir.path()).load("pile", "train").unwrap();
        assert_eq!(records.len(), 2);
        assert!(JsonlDatasetLoader::new(dir.path()).load("pile", "test").is_err());
    }
}
