//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! cuantizar quantize ./opt-125m --woq --woq-algo gptq --bits 4 --desc-act
//! cuantizar quantize ./opt-125m --load-in-4bit --output-dir ./saved_results
//! cuantizar quantize ./opt-125m --recipe recipe.yaml
//! cuantizar load ./saved_results
//! cuantizar benchmark ./saved_results --iters 10 --max-new-tokens 32
//! ```

use super::dtype::{Device, WeightDtype};
use super::quantization::{
    AutoRoundConfig, AwqConfig, BitsAndBytesConfig, CalibrationParams, GptqConfig,
    QuantizationConfig, RtnConfig, TeqConfig, WeightOnlyParams, DEFAULT_CALIB_DATASET,
};
use crate::{Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cuantizar: weight-only post-training quantization
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cuantizar")]
#[command(version)]
#[command(about = "Quantize causal language models and manage low-bit checkpoints")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Quantize a model and save the low-bit checkpoint
    Quantize(QuantizeArgs),

    /// Reload a saved low-bit model and print its layers
    Load(LoadArgs),

    /// Measure greedy generation latency and throughput
    Benchmark(BenchmarkArgs),
}

/// Weight-only algorithm selected by `--woq-algo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WoqAlgo {
    #[default]
    Rtn,
    Awq,
    Teq,
    Gptq,
    AutoRound,
}

impl std::str::FromStr for WoqAlgo {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rtn" => Ok(WoqAlgo::Rtn),
            "awq" => Ok(WoqAlgo::Awq),
            "teq" => Ok(WoqAlgo::Teq),
            "gptq" => Ok(WoqAlgo::Gptq),
            "autoround" => Ok(WoqAlgo::AutoRound),
            _ => Err(format!(
                "Unknown weight-only algorithm: {s}. Valid algorithms: rtn, awq, teq, gptq, autoround"
            )),
        }
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct QuantizeArgs {
    /// Model directory (or hub repository id with the `hub` feature)
    #[arg(value_name = "MODEL")]
    pub model: String,

    /// Apply weight-only quantization
    #[arg(long)]
    pub woq: bool,

    #[arg(long, default_value = "rtn")]
    pub woq_algo: WoqAlgo,

    #[arg(long, default_value = "4")]
    pub bits: u8,

    #[arg(long)]
    pub weight_dtype: Option<String>,

    #[arg(long)]
    pub scale_dtype: Option<String>,

    #[arg(long)]
    pub compute_dtype: Option<String>,

    #[arg(long, default_value = "128", allow_hyphen_values = true)]
    pub group_size: i32,

    /// `sym` or `asym`; AutoRound defaults to `asym`
    #[arg(long)]
    pub scheme: Option<String>,

    /// GPTQ: quantize columns by decreasing activation order
    #[arg(long)]
    pub desc_act: bool,

    #[arg(long, default_value = "0.01")]
    pub damp_percent: f32,

    #[arg(long, default_value = "128")]
    pub blocksize: usize,

    #[arg(long, default_value = "512")]
    pub nsamples: usize,

    #[arg(long, default_value = "2048")]
    pub max_input_length: usize,

    #[arg(long)]
    pub static_groups: bool,

    /// AutoRound calibration sequence length
    #[arg(long, default_value = "2048")]
    pub calib_len: usize,

    #[arg(long, default_value = "200")]
    pub calib_iters: usize,

    #[arg(long)]
    pub lr: Option<f32>,

    #[arg(long)]
    pub minmax_lr: Option<f32>,

    #[arg(long)]
    pub use_quant_input: bool,

    /// Calibration dataset name
    #[arg(long, default_value = DEFAULT_CALIB_DATASET)]
    pub dataset: String,

    /// Directory holding `<dataset>/<split>.jsonl`
    #[arg(long)]
    pub dataset_root: Option<PathBuf>,

    #[arg(long)]
    pub bitsandbytes: bool,

    #[arg(long)]
    pub load_in_4bit: bool,

    #[arg(long)]
    pub load_in_8bit: bool,

    /// Quantize on the fast runtime (RTN only)
    #[arg(long)]
    pub use_neural_speed: bool,

    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// YAML recipe; its config replaces the one built from flags
    #[arg(long)]
    pub recipe: Option<PathBuf>,

    #[arg(long, default_value = "./saved_results")]
    pub output_dir: PathBuf,
}

impl QuantizeArgs {
    pub fn device(&self) -> Result<Device> {
        self.device.parse()
    }

    fn weight_params(&self) -> Result<WeightOnlyParams> {
        let weight_dtype = self
            .weight_dtype
            .as_deref()
            .map(str::parse::<WeightDtype>)
            .transpose()?;
        let default_sym = self.woq_algo != WoqAlgo::AutoRound;
        let sym = match self.scheme.as_deref() {
            None => default_sym,
            Some("sym") => true,
            Some("asym") => false,
            Some(other) => {
                return Err(Error::ConfigError(format!(
                    "unknown scheme `{other}`, expected `sym` or `asym`"
                )))
            }
        };
        Ok(WeightOnlyParams {
            bits: self.bits,
            weight_dtype,
            scale_dtype: self.scale_dtype.clone(),
            compute_dtype: self.compute_dtype.clone(),
            group_size: self.group_size,
            sym,
            ..WeightOnlyParams::default()
        })
    }

    /// The config selected by the flags; `None` when no quantization was asked for.
    ///
    /// The 4/8-bit load flags are left to the dispatcher, which maps them per device.
    pub fn to_config(&self) -> Result<Option<QuantizationConfig>> {
        if self.woq {
            let weight = self.weight_params()?;
            let calibration = CalibrationParams {
                dataset: self.dataset.clone(),
                ..CalibrationParams::default()
            };
            let config = match self.woq_algo {
                WoqAlgo::Rtn => QuantizationConfig::Rtn(RtnConfig { weight }),
                WoqAlgo::Awq => QuantizationConfig::Awq(AwqConfig {
                    zero_point: !weight.sym,
                    weight,
                    calibration: Some(calibration),
                    ..AwqConfig::default()
                }),
                WoqAlgo::Teq => QuantizationConfig::Teq(TeqConfig {
                    weight,
                    calibration: Some(calibration),
                    ..TeqConfig::default()
                }),
                WoqAlgo::Gptq => QuantizationConfig::Gptq(GptqConfig {
                    weight,
                    calibration: Some(CalibrationParams {
                        nsamples: self.nsamples,
                        max_input_length: self.max_input_length,
                        ..calibration
                    }),
                    desc_act: self.desc_act,
                    damp_percent: self.damp_percent,
                    blocksize: self.blocksize,
                    static_groups: self.static_groups,
                    ..GptqConfig::default()
                }),
                WoqAlgo::AutoRound => QuantizationConfig::AutoRound(AutoRoundConfig {
                    weight,
                    calibration: Some(CalibrationParams {
                        calib_len: self.calib_len,
                        calib_iters: self.calib_iters,
                        nsamples: self.nsamples,
                        ..calibration
                    }),
                    lr: self.lr,
                    minmax_lr: self.minmax_lr,
                    use_quant_input: self.use_quant_input,
                }),
            };
            return Ok(Some(config));
        }
        if self.bitsandbytes {
            return Ok(Some(QuantizationConfig::BitsAndBytes(BitsAndBytesConfig {
                load_in_4bit: !self.load_in_8bit,
                load_in_8bit: self.load_in_8bit,
                ..BitsAndBytesConfig::default()
            })));
        }
        Ok(None)
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct LoadArgs {
    /// Directory written by `cuantizar quantize`
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    #[arg(long, default_value = "cpu")]
    pub device: String,
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct BenchmarkArgs {
    /// Model directory, dense or low-bit
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    #[arg(long, default_value = "10")]
    pub iters: usize,

    #[arg(long, default_value = "3")]
    pub num_warmup: usize,

    #[arg(long, default_value = "32")]
    pub max_new_tokens: usize,

    #[arg(long, default_value = "Once upon a time, there existed a little girl,")]
    pub prompt: String,
}

/// Parse command line arguments (for testing)
pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}
