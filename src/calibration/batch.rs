//! Calibration batches
//!
//! One record becomes one batch row: token ids truncated (first `calib_len`
//! kept) or right-padded to exactly `calib_len`, an attention mask, and
//! position ids only for architectures that need them.

use serde::{Deserialize, Serialize};

/// Architectures whose forward takes explicit position ids
pub const MODEL_TYPES_REQUIRING_POSITION_IDS: [&str; 10] = [
    "codegen",
    "gpt2",
    "gpt_bigcode",
    "gpt_neo",
    "gpt_neox",
    "gptj",
    "imagegpt",
    "llama",
    "mistral",
    "chatglm",
];

/// Architectures whose attention mask carries a leading masked-out slot
pub const SENTINEL_POSITION_MODEL_TYPES: [&str; 2] = ["bloom", "qwen"];

pub fn requires_position_ids(model_type: &str) -> bool {
    MODEL_TYPES_REQUIRING_POSITION_IDS.contains(&model_type)
}

/// Shape of the zero-length past-key-value placeholders a traced forward
/// expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastKeyValues {
    pub layers: usize,
    pub heads: usize,
    pub head_dim: usize,
    /// Beam-aware layout of the LLM graph optimization; 1 otherwise
    pub beams: usize,
}

impl PastKeyValues {
    pub fn new(layers: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            layers,
            heads,
            head_dim,
            beams: 1,
        }
    }

    /// `[layers][k|v]` shapes: `[beams, heads, 0, head_dim]`
    pub fn shapes(&self) -> Vec<[usize; 4]> {
        vec![[self.beams, self.heads, 0, self.head_dim]; self.layers * 2]
    }
}

/// One model-ready calibration input
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBatch {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub position_ids: Option<Vec<u32>>,
    pub past_key_values: Option<PastKeyValues>,
    /// Index of the last real token
    pub last_ind: usize,
}

impl CalibrationBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Turns token sequences into batches for one architecture
#[derive(Debug, Clone, PartialEq)]
pub struct BatchBuilder {
    pub model_type: String,
    pub max_len: usize,
    pub padding: bool,
    pub pad_val: u32,
    pub past_key_values: Option<PastKeyValues>,
}

impl BatchBuilder {
    pub fn new(model_type: impl Into<String>, max_len: usize, padding: bool, pad_val: u32) -> Self {
        Self {
            model_type: model_type.into(),
            max_len,
            padding,
            pad_val,
            past_key_values: None,
        }
    }

    pub fn with_past_key_values(mut self, past: PastKeyValues) -> Self {
        self.past_key_values = Some(past);
        self
    }

    /// Pad or truncate to `max_len`; chatglm rows are only truncated, never padded
    pub fn build(&self, mut ids: Vec<u32>) -> CalibrationBatch {
        let chatglm = self.model_type == "chatglm";
        if self.padding && !chatglm {
            ids.resize(self.max_len, self.pad_val);
        } else {
            ids.truncate(self.max_len);
        }
        let len = ids.len();
        let attention_mask = if SENTINEL_POSITION_MODEL_TYPES.contains(&self.model_type.as_str()) {
            std::iter::once(0).chain(std::iter::repeat(1).take(len)).collect()
        } else {
            vec![1; len]
        };
        let position_ids =
            requires_position_ids(&self.model_type).then(|| (0..len as u32).collect());
        CalibrationBatch {
            input_ids: ids,
            attention_mask,
            position_ids,
            past_key_values: self.past_key_values,
            last_ind: len.saturating_sub(1),
        }
    }

    /// Group rows into batches of up to `batch_size` rows of equal length
    pub fn build_batches(
        &self,
        sequences: Vec<Vec<u32>>,
        batch_size: usize,
    ) -> Vec<Vec<CalibrationBatch>> {
        let batch_size = batch_size.max(1);
        let mut batches: Vec<Vec<CalibrationBatch>> = Vec::new();
        for ids in sequences {
            let row = self.build(ids);
            match batches.last_mut() {
                Some(last) if last.len() < batch_size && last[0].len() == row.len() => {
                    last.push(row)
                }
                _ => batches.push(vec![row]),
            }
        }
        batches
    }
}
