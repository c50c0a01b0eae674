//! Training loop driving quantization-aware training

use super::backprop::{backward, forward_train, LayerGrad, Tape};
use crate::calibration::{
    record_text, split_for, BatchBuilder, CalibrationBatch, CalibrationInputs, DatasetLoader,
    JsonlDatasetLoader, DEFAULT_DATASET_ROOT, SHUFFLE_SEED,
};
use crate::config::TrainParams;
use crate::nn::{CausalLm, Flow, Layer, Module};
use crate::optim::{Optimizer, TrainableParam, SGD};
use crate::{Error, Result};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Caller-supplied training loop; runs between `on_train_begin` and
/// `on_train_end`
pub type TrainFn = Arc<dyn Fn(&mut CausalLm) -> Result<()> + Send + Sync>;

/// Learning rate of the default loop
pub const DEFAULT_QAT_LR: f32 = 1e-4;

fn merge(acc: &mut Vec<LayerGrad>, grads: Vec<LayerGrad>) {
    for g in grads {
        match acc.iter_mut().find(|a| a.name == g.name) {
            Some(a) => {
                a.weight += &g.weight;
                if let (Some(ab), Some(gb)) = (a.bias.as_mut(), g.bias.as_ref()) {
                    *ab += gb;
                }
            }
            None => acc.push(g),
        }
    }
}

/// One optimization step on the mean-of-logits loss of a batch.
///
/// Gradients are averaged over the rows; returns the mean loss.
pub fn train_step(
    model: &mut CausalLm,
    batch: &[CalibrationBatch],
    optimizer: &mut dyn Optimizer,
) -> Result<f32> {
    let mut acc: Vec<LayerGrad> = Vec::new();
    let mut loss = 0.0f32;
    let mut rows = 0usize;
    for row in batch.iter().filter(|r| !r.is_empty()) {
        let mut tape = Tape::new();
        let logits = forward_train(
            &mut model.root,
            "",
            Flow::Ids(row.input_ids.clone()),
            &mut tape,
        )?
            .into_hidden()?;
        let numel = logits.len().max(1) as f32;
        loss += logits.sum() / numel;
        let mut grads = Vec::new();
        backward(&model.root, "", Array2::from_elem(logits.dim(), 1.0 / numel), &tape, &mut grads)?;
        merge(&mut acc, grads);
        rows += 1;
    }
    if rows == 0 {
        return Ok(0.0);
    }
    let rows = rows as f32;

    let mut params: Vec<TrainableParam> = Vec::new();
    let mut slots: Vec<(String, bool)> = Vec::new();
    for g in acc {
        let Some(Module {
            layer: Layer::Qat(q),
            ..
        }) = model.root.get(&g.name)
        else {
            continue;
        };
        let mut weight = TrainableParam::new(q.linear.weight.clone());
        weight.set_grad(g.weight / rows);
        params.push(weight);
        slots.push((g.name.clone(), false));
        if let (Some(b), Some(gb)) = (&q.linear.bias, g.bias) {
            let mut bias = TrainableParam::new(b.clone().insert_axis(Axis(0)));
            bias.set_grad(gb.insert_axis(Axis(0)) / rows);
            params.push(bias);
            slots.push((g.name, true));
        }
    }

    let mut refs: Vec<&mut TrainableParam> = params.iter_mut().collect();
    optimizer.step(&mut refs);

    for ((name, is_bias), param) in slots.into_iter().zip(params) {
        if let Some(Module {
            layer: Layer::Qat(q),
            ..
        }) = model.root.get_mut(&name)
        {
            if is_bias {
                q.linear.bias = Some(param.value.row(0).to_owned());
            } else {
                q.linear.weight = param.value;
            }
        }
    }
    Ok(loss / rows)
}

/// Plain SGD at [`DEFAULT_QAT_LR`] over at most `train_iters` batches
pub fn default_train_fn(batches: Vec<Vec<CalibrationBatch>>, train_iters: usize) -> TrainFn {
    Arc::new(move |model: &mut CausalLm| {
        let mut optimizer = SGD::new(DEFAULT_QAT_LR, 0.0);
        for (i, batch) in batches.iter().take(train_iters).enumerate() {
            let loss = train_step(model, batch, &mut optimizer)?;
            tracing::info!("Iteration [{}], Loss: {:.4}", i + 1, loss);
        }
        Ok(())
    })
}

/// Tokenized, padded training batches of `train_batch_size` rows
pub fn train_batches(
    inputs: &CalibrationInputs,
    params: &TrainParams,
    model_type: &str,
) -> Result<Vec<Vec<CalibrationBatch>>> {
    let tokenizer = inputs.tokenizer.as_ref().ok_or_else(|| {
        Error::MissingCalibrationInputs(
            "please provide the tokenizer or provide train_func directly".to_string(),
        )
    })?;
    let default_loader;
    let dataset: &dyn DatasetLoader = match &inputs.dataset {
        Some(d) => d.as_ref(),
        None => {
            default_loader = JsonlDatasetLoader::new(DEFAULT_DATASET_ROOT);
            &default_loader
        }
    };
    let mut records = dataset.load(&params.train_dataset, split_for(&params.train_dataset))?;
    if params.train_shuffle {
        records.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));
    }
    let sequences = records
        .iter()
        .map(|r| record_text(r).and_then(|t| tokenizer.encode(t)))
        .collect::<Result<Vec<_>>>()?;
    let builder = BatchBuilder::new(
        model_type,
        params.train_len,
        params.train_padding,
        params.train_pad_val,
    );
    let mut batches = builder.build_batches(sequences, params.train_batch_size);
    batches.truncate(params.train_iters);
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{ByteTokenizer, InMemoryDataset};

    #[test]
    fn test_train_batches_are_padded_and_bounded() {
        let inputs = CalibrationInputs::default()
            .with_tokenizer(Arc::new(ByteTokenizer))
            .with_dataset(Arc::new(InMemoryDataset::from_texts(
                "pile",
                ["a", "bb", "ccc", "dddd", "eeeee"],
            )));
        let params = TrainParams {
            train_dataset: "pile".to_string(),
            train_iters: 2,
            train_len: 4,
            train_batch_size: 2,
            ..TrainParams::default()
        };
        let batches = train_batches(&inputs, &params, "opt").unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().flatten().all(|b| b.len() == 4));
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn test_train_batches_need_a_tokenizer() {
        let err = train_batches(
            &CalibrationInputs::default(),
            &TrainParams::default(),
            "opt",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingCalibrationInputs(_)));
    }
}
