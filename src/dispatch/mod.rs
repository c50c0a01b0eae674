//! Quantization dispatcher
//!
//! [`Dispatcher::load`] turns a [`LoadRequest`] into a loaded model by taking
//! exactly one path:
//!
//! - a directory whose `config.json` already carries a quantization config is
//!   reloaded as a saved low-bit model,
//! - a request without quantization config or 4/8-bit flags is a plain load,
//! - otherwise the handler registered for the resolved config's
//!   [`QuantMethod`] runs.
//!
//! Every handler returns a model tagged with its resolved config and bound to
//! a [`crate::io::Persister`].

mod activation;
mod fast_runtime;
mod precision;
mod woq;

pub use activation::{optimize_for_llm, resolve_ipex_opt_llm, IPEX_OPT_LLM_SUPPORTED};
pub use fast_runtime::{
    runtime_supports, RuntimeModel, RuntimeTensor, GPTQ_RUNTIME_MODEL_TYPES, RUNTIME_MODEL_TYPES,
};
pub use precision::flags_to_rtn;

use crate::calibration::CalibrationInputs;
use crate::config::{Device, HostCapabilities, ParamDtype, QuantMethod, QuantizationConfig};
use crate::io::{load_low_bit, load_pretrained};
use crate::nn::{CausalLm, ModelConfig, ModelFactory, CONFIG_NAME};
use crate::ptq::{DefaultPtq, PtqFit};
use crate::qat::TrainFn;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Everything a caller can ask of one load
#[derive(Clone)]
pub struct LoadRequest {
    pub model_dir: PathBuf,
    pub quantization_config: Option<QuantizationConfig>,
    pub load_in_4bit: bool,
    pub load_in_8bit: bool,
    pub device: Device,
    /// `None` picks the fast runtime from the model type
    pub use_fast_runtime: Option<bool>,
    pub torch_dtype: Option<ParamDtype>,
    pub calibration: CalibrationInputs,
    pub train_fn: Option<TrainFn>,
    pub caps: HostCapabilities,
}

impl std::fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRequest")
            .field("model_dir", &self.model_dir)
            .field("quantization_config", &self.quantization_config)
            .field("load_in_4bit", &self.load_in_4bit)
            .field("load_in_8bit", &self.load_in_8bit)
            .field("device", &self.device)
            .field("use_fast_runtime", &self.use_fast_runtime)
            .field("torch_dtype", &self.torch_dtype)
            .field("train_fn", &self.train_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl LoadRequest {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            quantization_config: None,
            load_in_4bit: false,
            load_in_8bit: false,
            device: Device::Cpu,
            use_fast_runtime: None,
            torch_dtype: None,
            calibration: CalibrationInputs::default(),
            train_fn: None,
            caps: HostCapabilities::detect(),
        }
    }

    pub fn with_config(mut self, config: impl Into<QuantizationConfig>) -> Self {
        self.quantization_config = Some(config.into());
        self
    }

    pub fn load_in_4bit(mut self) -> Self {
        self.load_in_4bit = true;
        self
    }

    pub fn load_in_8bit(mut self) -> Self {
        self.load_in_8bit = true;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_fast_runtime(mut self, enabled: bool) -> Self {
        self.use_fast_runtime = Some(enabled);
        self
    }

    pub fn with_dtype(mut self, dtype: ParamDtype) -> Self {
        self.torch_dtype = Some(dtype);
        self
    }

    pub fn with_calibration(mut self, inputs: CalibrationInputs) -> Self {
        self.calibration = inputs;
        self
    }

    pub fn with_train_fn(mut self, train_fn: TrainFn) -> Self {
        self.train_fn = Some(train_fn);
        self
    }

    pub fn with_capabilities(mut self, caps: HostCapabilities) -> Self {
        self.caps = caps;
        self
    }
}

/// Outcome of a load: a module graph, or tensors handed to the fast runtime
#[derive(Debug, Clone)]
pub enum LoadedModel {
    Graph(CausalLm),
    Runtime(RuntimeModel),
}

impl LoadedModel {
    pub fn quantization_config(&self) -> Option<&QuantizationConfig> {
        match self {
            LoadedModel::Graph(m) => m.quantization_config.as_ref(),
            LoadedModel::Runtime(m) => m.quantization_config.as_ref(),
        }
    }

    pub fn as_graph(&self) -> Option<&CausalLm> {
        match self {
            LoadedModel::Graph(m) => Some(m),
            LoadedModel::Runtime(_) => None,
        }
    }

    pub fn as_runtime(&self) -> Option<&RuntimeModel> {
        match self {
            LoadedModel::Runtime(m) => Some(m),
            LoadedModel::Graph(_) => None,
        }
    }

    pub fn into_graph(self) -> Result<CausalLm> {
        match self {
            LoadedModel::Graph(m) => Ok(m),
            LoadedModel::Runtime(m) => Err(Error::UnsupportedCombination(format!(
                "`{}` was loaded by the fast runtime and has no module graph",
                m.config.model_type
            ))),
        }
    }
}

/// State handed to a method handler
pub(crate) struct Context<'a> {
    pub dispatcher: &'a Dispatcher,
    pub request: &'a LoadRequest,
    pub config: ModelConfig,
    pub fast_runtime: bool,
}

impl Context<'_> {
    /// Dense model in `dtype`, else the requested or configured dtype
    pub fn load_dense(&self, dtype: Option<ParamDtype>) -> Result<CausalLm> {
        let mut model = load_pretrained(
            &self.request.model_dir,
            self.dispatcher.factory(),
            dtype.or(self.request.torch_dtype),
        )?;
        model.device = self.request.device;
        Ok(model)
    }

    pub fn model_dtype(&self) -> ParamDtype {
        self.request
            .torch_dtype
            .unwrap_or_else(|| self.config.param_dtype())
    }
}

type Handler = fn(Context<'_>, QuantizationConfig) -> Result<LoadedModel>;

/// One handler per method
const HANDLERS: [(QuantMethod, Handler); 11] = [
    (QuantMethod::Rtn, woq::weight_only),
    (QuantMethod::Awq, woq::weight_only),
    (QuantMethod::Teq, woq::weight_only),
    (QuantMethod::Gptq, woq::weight_only),
    (QuantMethod::AutoRound, woq::weight_only),
    (QuantMethod::SmoothQuant, activation::smooth_quant),
    (QuantMethod::Static, activation::static_quant),
    (QuantMethod::Dynamic, activation::dynamic_quant),
    (QuantMethod::Qat, activation::quant_aware_training),
    (QuantMethod::MixedPrecision, precision::mixed_precision),
    (QuantMethod::BitsAndBytes, precision::bits_and_bytes),
];

fn handler_for(method: QuantMethod) -> Result<Handler> {
    HANDLERS
        .iter()
        .find(|(m, _)| *m == method)
        .map(|(_, h)| *h)
        .ok_or_else(|| Error::UnsupportedMethod(method.to_string()))
}

/// Resolves and runs the quantization path of a load request
pub struct Dispatcher {
    factory: Box<dyn ModelFactory>,
    ptq: Box<dyn PtqFit>,
}

impl Dispatcher {
    pub fn new(factory: impl ModelFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            ptq: Box::new(DefaultPtq::default()),
        }
    }

    /// Replace the post-training fit routine used by SmoothQuant, static and
    /// dynamic quantization
    pub fn with_ptq(mut self, ptq: impl PtqFit + 'static) -> Self {
        self.ptq = Box::new(ptq);
        self
    }

    pub fn factory(&self) -> &dyn ModelFactory {
        self.factory.as_ref()
    }

    pub(crate) fn ptq(&self) -> &dyn PtqFit {
        self.ptq.as_ref()
    }

    /// Whether the request runs on the fast runtime
    fn fast_runtime(&self, request: &LoadRequest, config: &ModelConfig) -> bool {
        if request.device == Device::Xpu {
            return false;
        }
        let method = request.quantization_config.as_ref().map(QuantizationConfig::method);
        match request.use_fast_runtime {
            Some(enabled) => enabled,
            None => {
                let enabled = runtime_supports(&config.model_type, method);
                if enabled {
                    tracing::debug!(model_type = %config.model_type, "fast runtime selected");
                }
                enabled
            }
        }
    }

    /// Load `request.model_dir` the way the request asks.
    ///
    /// Configuration and missing-input errors are fatal; callers are expected
    /// to log them and stop (see [`Error::is_fatal`]).
    pub fn load(&self, request: &LoadRequest) -> Result<LoadedModel> {
        let config = ModelConfig::from_file(request.model_dir.join(CONFIG_NAME))?;
        let fast_runtime = self.fast_runtime(request, &config);

        if let Some(raw) = &config.quantization_config {
            let saved = QuantizationConfig::from_dict(raw)?;
            return self.load_saved(request, &config, saved, fast_runtime);
        }

        let cx = Context {
            dispatcher: self,
            request,
            config,
            fast_runtime,
        };
        match precision::resolve_request_config(&cx)? {
            None => plain_load(cx),
            Some(qc) => {
                let handler = handler_for(qc.method())?;
                handler(cx, qc)
            }
        }
    }

    fn load_saved(
        &self,
        request: &LoadRequest,
        config: &ModelConfig,
        saved: QuantizationConfig,
        fast_runtime: bool,
    ) -> Result<LoadedModel> {
        let dir = request.model_dir.as_path();
        let method = saved.method();
        if fast_runtime && method.is_weight_only() {
            tracing::info!("Loading saved low-bit {method} model with the fast runtime.");
            return RuntimeModel::from_low_bit(
                dir,
                self.factory(),
                request.caps,
            )
            .map(LoadedModel::Runtime);
        }
        match method {
            QuantMethod::MixedPrecision | QuantMethod::BitsAndBytes => {
                let mut model = load_pretrained(dir, self.factory(), request.torch_dtype)?;
                model.device = request.device;
                model.quantization_config = Some(saved);
                tracing::debug!(model_type = %config.model_type, "reloaded {method} model");
                Ok(LoadedModel::Graph(model))
            }
            _ => load_saved_low_bit(dir, self.factory(), request).map(LoadedModel::Graph),
        }
    }
}

fn load_saved_low_bit(
    dir: &Path,
    factory: &dyn ModelFactory,
    request: &LoadRequest,
) -> Result<CausalLm> {
    load_low_bit(dir, factory, request.device, request.caps).map_err(|e| {
        tracing::error!("Saved low bit model loading failed, please check your model.");
        e
    })
}

/// No quantization config and no 4/8-bit flags
fn plain_load(cx: Context<'_>) -> Result<LoadedModel> {
    if cx.fast_runtime {
        tracing::info!("Using the fast runtime with FP32 model dtype.");
        let model = RuntimeModel::from_dense_checkpoint(&cx.request.model_dir, cx.config)?;
        return Ok(LoadedModel::Runtime(model));
    }
    cx.load_dense(None).map(LoadedModel::Graph)
}
