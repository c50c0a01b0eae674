//! Bounded, restartable calibration stream and the calibration function seam

use super::batch::{BatchBuilder, CalibrationBatch};
use super::dataset::{record_text, split_for, DatasetLoader, JsonlDatasetLoader};
use super::tokenizer::Tokenizer;
use crate::config::CalibrationParams;
use crate::nn::{CausalLm, ForwardHook};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Seed of the dataset shuffle
pub const SHUFFLE_SEED: u64 = 42;

/// Directory searched for `<dataset>/<split>.jsonl` when no loader is given
pub const DEFAULT_DATASET_ROOT: &str = "datasets";

/// Runs calibration forwards of a model, reporting linear inputs to the hook
pub type CalibFn = Arc<dyn Fn(&CausalLm, &mut dyn ForwardHook) -> Result<()> + Send + Sync>;

/// At most `limit` batches, replayable from the start
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationLoader {
    batches: Vec<CalibrationBatch>,
    limit: usize,
}

impl CalibrationLoader {
    pub fn from_batches(batches: Vec<CalibrationBatch>, limit: usize) -> Self {
        Self { batches, limit }
    }

    /// Load, optionally shuffle, tokenize and batch a dataset split.
    ///
    /// Every record must carry `code`, `prompt` or `text`.
    pub fn from_dataset(
        dataset: &dyn DatasetLoader,
        tokenizer: &dyn Tokenizer,
        params: &CalibrationParams,
        builder: &BatchBuilder,
        limit: usize,
    ) -> Result<Self> {
        let mut records = dataset.load(&params.dataset, split_for(&params.dataset))?;
        if params.calib_shuffle {
            records.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));
        }
        let texts = records.iter().map(record_text).collect::<Result<Vec<_>>>()?;
        let batches = texts
            .into_iter()
            .take(limit)
            .map(|t| tokenizer.encode(t).map(|ids| builder.build(ids)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { batches, limit })
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalibrationBatch> {
        self.batches.iter().take(self.limit)
    }

    pub fn len(&self) -> usize {
        self.batches.len().min(self.limit)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<&CalibrationBatch> {
        self.iter().next()
    }

    /// Forward every batch through `model`
    pub fn run(&self, model: &CausalLm, hook: &mut dyn ForwardHook) -> Result<()> {
        for batch in self.iter() {
            if batch.is_empty() {
                continue;
            }
            model.forward_with_hook(&batch.input_ids, hook)?;
        }
        Ok(())
    }

    pub fn into_calib_fn(self) -> CalibFn {
        Arc::new(move |model: &CausalLm, hook: &mut dyn ForwardHook| self.run(model, hook))
    }
}

/// Caller-supplied collaborators of the calibrating paths
#[derive(Clone, Default)]
pub struct CalibrationInputs {
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    pub dataset: Option<Arc<dyn DatasetLoader>>,
    pub calib_fn: Option<CalibFn>,
    pub example_inputs: Option<CalibrationBatch>,
}

impl std::fmt::Debug for CalibrationInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationInputs")
            .field("tokenizer", &self.tokenizer.is_some())
            .field("dataset", &self.dataset.is_some())
            .field("calib_fn", &self.calib_fn.is_some())
            .field("example_inputs", &self.example_inputs.is_some())
            .finish()
    }
}

impl CalibrationInputs {
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_dataset(mut self, dataset: Arc<dyn DatasetLoader>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_calib_fn(mut self, calib_fn: CalibFn) -> Self {
        self.calib_fn = Some(calib_fn);
        self
    }

    /// Build the default loader from the tokenizer and dataset
    pub fn loader(
        &self,
        params: &CalibrationParams,
        builder: &BatchBuilder,
        limit: usize,
    ) -> Result<CalibrationLoader> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            Error::MissingCalibrationInputs(
                "please provide the tokenizer or provide calib_func directly".to_string(),
            )
        })?;
        let default_loader;
        let dataset: &dyn DatasetLoader = match &self.dataset {
            Some(d) => d.as_ref(),
            None => {
                default_loader = JsonlDatasetLoader::new(DEFAULT_DATASET_ROOT);
                &default_loader
            }
        };
        CalibrationLoader::from_dataset(dataset, tokenizer.as_ref(), params, builder, limit)
    }

    /// The caller's calibration function, or the default one over the
    /// calibration dataset together with its first batch
    pub fn resolve(
        &self,
        params: &CalibrationParams,
        builder: &BatchBuilder,
    ) -> Result<(CalibFn, Option<CalibrationBatch>)> {
        if let Some(f) = &self.calib_fn {
            return Ok((f.clone(), self.example_inputs.clone()));
        }
        let loader = self.loader(params, builder, params.calib_iters)?;
        tracing::info!(
            "The default calibration function is used, the calibration dataset is {}, \
             batchsize is 1 and calibration iteration is {}.",
            params.dataset,
            params.calib_iters
        );
        let example = self.example_inputs.clone().or_else(|| loader.first().cloned());
        Ok((loader.into_calib_fn(), example))
    }
}
