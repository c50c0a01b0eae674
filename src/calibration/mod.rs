//! Calibration pipeline
//!
//! Turns a raw text dataset into a bounded stream of model-ready batches for
//! the paths that need activation statistics (AWQ, TEQ, GPTQ, AutoRound,
//! SmoothQuant, static quantization) and for quantization-aware training.

mod batch;
mod dataset;
mod loader;
mod tokenizer;

pub use batch::{
    requires_position_ids, BatchBuilder, CalibrationBatch, PastKeyValues,
    MODEL_TYPES_REQUIRING_POSITION_IDS, SENTINEL_POSITION_MODEL_TYPES,
};
pub use dataset::{
    record_text, split_for, DatasetLoader, InMemoryDataset, JsonlDatasetLoader, Record, TEXT_FIELDS,
};
pub use loader::{CalibFn, CalibrationInputs, CalibrationLoader, DEFAULT_DATASET_ROOT, SHUFFLE_SEED};
pub use tokenizer::{
    copy_tokenizer_files, tokenizer_for, ByteTokenizer, HfTokenizer, Tokenizer, TOKENIZER_FILE,
    TOKENIZER_FILES,
};
