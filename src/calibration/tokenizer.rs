//! Tokenizer collaborator

use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;

/// File name of a serialized HuggingFace tokenizer
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Tokenizer files a model directory may carry alongside its weights
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
];

/// Text ↔ token ids
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode_batch(&self, batch: &[Vec<u32>]) -> Result<Vec<String>>;

    fn vocab_size(&self) -> usize;
}

/// Byte-level tokenizer: each UTF-8 byte becomes one id, shifted past the
/// special ids `0` (unk), `1` (pad) and `2` (eos)
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const SPECIAL_IDS: u32 = 3;
    pub const PAD_ID: u32 = 1;
    pub const EOS_ID: u32 = 2;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| u32::from(b) + Self::SPECIAL_IDS).collect())
    }

    fn decode_batch(&self, batch: &[Vec<u32>]) -> Result<Vec<String>> {
        Ok(batch
            .iter()
            .map(|ids| {
                let bytes: Vec<u8> = ids
                    .iter()
                    .filter(|&&id| id >= Self::SPECIAL_IDS && id < Self::SPECIAL_IDS + 256)
                    .map(|&id| (id - Self::SPECIAL_IDS) as u8)
                    .collect();
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .collect())
    }

    fn vocab_size(&self) -> usize {
        256 + Self::SPECIAL_IDS as usize
    }
}

/// The model's own tokenizer, read from a `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Tokenization(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok(Self { inner })
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(format!("encoding failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_batch(&self, batch: &[Vec<u32>]) -> Result<Vec<String>> {
        batch
            .iter()
            .map(|ids| {
                self.inner
                    .decode(ids, true)
                    .map_err(|e| Error::Tokenization(format!("decoding failed: {e}")))
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Tokenizer for a model directory: its `tokenizer.json` when present,
/// otherwise the byte-level fallback
pub fn tokenizer_for(model_dir: &Path) -> Result<Arc<dyn Tokenizer>> {
    let path = model_dir.join(TOKENIZER_FILE);
    if path.is_file() {
        tracing::debug!("Using tokenizer from {}", path.display());
        return Ok(Arc::new(HfTokenizer::from_file(&path)?));
    }
    tracing::warn!(
        "{} has no {TOKENIZER_FILE}; tokenizing calibration text byte by byte",
        model_dir.display()
    );
    Ok(Arc::new(ByteTokenizer))
}

/// Copy every tokenizer file of `src` into `dst`; returns the names copied
pub fn copy_tokenizer_files(src: &Path, dst: &Path) -> Result<Vec<&'static str>> {
    let mut copied = Vec::new();
    if src == dst {
        return Ok(copied);
    }
    for name in TOKENIZER_FILES {
        let from = src.join(name);
        if from.is_file() {
            std::fs::create_dir_all(dst)?;
            std::fs::copy(&from, dst.join(name))?;
            copied.push(*name);
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Whitespace-split word-level tokenizer over a four-word vocabulary
    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "hello": 1, "world": 2, "def": 3},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn test_byte_tokenizer_skips_special_ids_on_decode() {
        let tok = ByteTokenizer;
        let mut ids = tok.encode("héllo").unwrap();
        assert_eq!(ids.len(), 6);
        ids.push(ByteTokenizer::EOS_ID);
        assert_eq!(tok.decode_batch(&[ids]).unwrap(), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_tokenizer_for_reads_the_model_vocabulary() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), WORD_LEVEL_JSON).unwrap();

        let tok = tokenizer_for(dir.path()).unwrap();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.encode("hello world nope").unwrap(), vec![1, 2, 0]);
        assert_eq!(tok.decode_batch(&[vec![1, 2]]).unwrap(), vec!["hello world".to_string()]);
    }

    #[test]
    fn test_tokenizer_for_falls_back_to_bytes() {
        let dir = TempDir::new().unwrap();
        let tok = tokenizer_for(dir.path()).unwrap();
        assert_eq!(tok.vocab_size(), ByteTokenizer.vocab_size());
        assert_eq!(tok.encode("a").unwrap(), vec![u32::from(b'a') + ByteTokenizer::SPECIAL_IDS]);
    }

    #[test]
    fn test_broken_tokenizer_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), "{not json").unwrap();
        assert!(matches!(tokenizer_for(dir.path()), Err(Error::Tokenization(_))));
    }

    #[test]
    fn test_copy_tokenizer_files_skips_missing_ones() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("tokenizer.json"), WORD_LEVEL_JSON).unwrap();
        std::fs::write(src.path().join("tokenizer_config.json"), "{}").unwrap();

        let copied = copy_tokenizer_files(src.path(), dst.path()).unwrap();
        assert_eq!(copied, vec!["tokenizer.json", "tokenizer_config.json"]);
        assert!(dst.path().join("tokenizer_config.json").is_file());
        assert!(!dst.path().join("merges.txt").exists());
    }
}
