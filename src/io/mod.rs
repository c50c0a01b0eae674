//! Model I/O: checkpoint files, key manifest and the save/reload lifecycle
//!
//! Low-bit models are written as `config.json` (embedding the quantization
//! config), safetensors weights (sharded past a size threshold), the
//! `all_checkpoint_keys.json` manifest and `quantization_config.json`.

mod checkpoint;
mod load;
mod manifest;
mod persist;

pub use checkpoint::{
    read_state_dict, resolve_checkpoint, write_state_dict, CheckpointFiles, ShardIndex,
    ShardMetadata, DEFAULT_MAX_SHARD_SIZE, SAFE_WEIGHTS_INDEX_NAME, SAFE_WEIGHTS_NAME,
    WEIGHTS_INDEX_NAME, WEIGHTS_NAME,
};
pub use load::{load_low_bit, load_pretrained};
pub use manifest::{CheckpointManifest, MANIFEST_NAME};
pub use persist::{save_low_bit, LowBitPersister, Persister, PlainPersister};
