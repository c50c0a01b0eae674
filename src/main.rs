//! Cuantizar CLI
//!
//! # Usage
//!
//! ```bash
//! # Weight-only GPTQ, saved to ./saved_results
//! cuantizar quantize ./opt-125m --woq --woq-algo gptq --desc-act
//!
//! # Reload and list the layers of a saved model
//! cuantizar load ./saved_results
//!
//! # Greedy generation latency
//! cuantizar benchmark ./saved_results --iters 10
//! ```

use clap::Parser;
use cuantizar::calibration::{
    tokenizer_for, CalibrationInputs, JsonlDatasetLoader, DEFAULT_DATASET_ROOT,
};
use cuantizar::config::{BenchmarkArgs, Cli, Command, LoadArgs, QuantizeArgs, Recipe};
use cuantizar::nn::MlpLmFactory;
use cuantizar::{Dispatcher, Error, LoadRequest, LoadedModel, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Command::Quantize(args) => run_quantize(args),
        Command::Load(args) => run_load(args),
        Command::Benchmark(args) => run_benchmark(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(fatal = e.is_fatal(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(feature = "hub")]
fn resolve_model(model: &str) -> Result<PathBuf> {
    cuantizar::hub::HubResolver::new().resolve(model)
}

#[cfg(not(feature = "hub"))]
fn resolve_model(model: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(model))
}

fn run_quantize(args: QuantizeArgs) -> Result<()> {
    let recipe = args.recipe.as_deref().map(Recipe::from_file).transpose()?;
    let model_dir = resolve_model(&args.model)?;

    let device = match recipe.as_ref().and_then(|r| r.device) {
        Some(device) => device,
        None => args.device()?,
    };
    let dataset_root = recipe
        .as_ref()
        .and_then(|r| r.dataset_root.clone())
        .or_else(|| args.dataset_root.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_ROOT));
    let output_dir = recipe
        .as_ref()
        .and_then(|r| r.output_dir.clone())
        .unwrap_or_else(|| args.output_dir.clone());
    let config = match recipe {
        Some(r) => Some(r.quantization_config),
        None => args.to_config()?,
    };

    if config.is_none() && !(args.load_in_4bit || args.load_in_8bit) {
        return Err(Error::ConfigError(
            "nothing to quantize: pass --woq, --bitsandbytes, --load-in-4bit, --load-in-8bit or --recipe"
                .to_string(),
        ));
    }

    let mut request = LoadRequest::new(&model_dir)
        .on_device(device)
        .with_fast_runtime(args.use_neural_speed)
        .with_calibration(
            CalibrationInputs::default()
                .with_tokenizer(tokenizer_for(&model_dir)?)
                .with_dataset(Arc::new(JsonlDatasetLoader::new(dataset_root))),
        );
    if let Some(config) = config {
        request = request.with_config(config);
    }
    if args.load_in_4bit {
        request = request.load_in_4bit();
    }
    if args.load_in_8bit {
        request = request.load_in_8bit();
    }

    let started = Instant::now();
    match Dispatcher::new(MlpLmFactory).load(&request)? {
        LoadedModel::Graph(model) => {
            model.save_pretrained(&output_dir)?;
            tracing::info!(
                "Saved quantized model to {} in {:.1}s",
                output_dir.display(),
                started.elapsed().as_secs_f64()
            );
        }
        LoadedModel::Runtime(runtime) => {
            tracing::info!(
                tensors = runtime.len(),
                quantized = runtime.quantized_names().count(),
                bytes = runtime.nbytes(),
                "Fast runtime model ready; runtime models are not written back to disk"
            );
        }
    }
    Ok(())
}

fn run_load(args: LoadArgs) -> Result<()> {
    let request = LoadRequest::new(&args.dir)
        .on_device(args.device.parse()?)
        .with_fast_runtime(false);
    let model = Dispatcher::new(MlpLmFactory).load(&request)?.into_graph()?;
    let method = model
        .quantization_config
        .as_ref()
        .map_or("none", |qc| qc.method().as_str());
    println!("Model: {} ({})", args.dir.display(), model.config.model_type);
    println!("Quantization: {method}");
    for (name, kind) in model.layer_summary() {
        println!("  {name:<48} {kind}");
    }
    Ok(())
}

fn run_benchmark(args: BenchmarkArgs) -> Result<()> {
    let request = LoadRequest::new(&args.model).with_fast_runtime(false);
    let model = Dispatcher::new(MlpLmFactory).load(&request)?.into_graph()?;
    let prompt = tokenizer_for(&args.model)?.encode(&args.prompt)?;
    if prompt.is_empty() {
        return Err(Error::InvalidParameter("prompt must not be empty".to_string()));
    }

    let mut total = 0.0;
    let mut generated = 0usize;
    for i in 0..args.num_warmup + args.iters {
        let tic = Instant::now();
        let ids = model.generate(&prompt, args.max_new_tokens)?;
        let elapsed = tic.elapsed().as_secs_f64();
        if i >= args.num_warmup {
            total += elapsed;
            generated += ids.len() - prompt.len();
        }
    }

    if args.iters == 0 {
        println!("No timed iterations");
        return Ok(());
    }
    let latency = total / args.iters as f64;
    println!("Inference latency: {latency:.3} sec.");
    println!("Throughput: {:.1} tokens/sec.", generated as f64 / total.max(f64::EPSILON));
    Ok(())
}
