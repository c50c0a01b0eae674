//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported quantization method: {0}")]
    UnsupportedMethod(String),

    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error(
        "Invalid weight dtype `{0}`: expected one of 'int8', 'int4_fullrange', 'int4_clip', \
         'nf4', 'fp4_e2m1_bnb', 'fp4_e2m1', 'fp8_e5m2', 'fp8_e4m3'"
    )]
    InvalidWeightDtype(String),

    #[error(
        "Unrecognized dataset schema: record has none of the fields `code`, `prompt`, `text` \
         (NeelNanda/pile-10k is the default calibration dataset)"
    )]
    UnrecognizedDatasetSchema,

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Missing calibration inputs: {0}")]
    MissingCalibrationInputs(String),

    #[error("{path} does not appear to have a file named {file}")]
    CheckpointNotFound { path: String, file: String },

    #[error("{path} has {found} but no loadable variant ({expected})")]
    CheckpointVariantMissing {
        path: String,
        found: String,
        expected: String,
    },

    #[error("Shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Detected this model is not a low-bit model")]
    NotLowBit,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Configuration and missing-input errors end the run: the caller should
    /// log them and terminate instead of retrying or falling back.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedMethod(_)
                | Error::UnsupportedCombination(_)
                | Error::InvalidWeightDtype(_)
                | Error::UnrecognizedDatasetSchema
                | Error::MissingCalibrationInputs(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON: {e}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(format!("YAML: {e}"))
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Error::Serialization(format!("SafeTensors: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
