//! Training loop for the slot filling model.

use anyhow::{Context, Result, bail};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use slotfill_core::{Span, SpanMetrics, compute_span_f1};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::data::SlotDataset;
use crate::model::{SlotFillingModel, decode_logits};

/// Outcome of an early-stopping check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    NoImprovement,
    Stop,
}

/// Stops training after `patience` evaluations without an improvement of
/// more than `threshold` over the best metric so far.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    threshold: f32,
    best: Option<f32>,
    bad_evaluations: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, threshold: f32) -> Self {
        Self {
            patience,
            threshold,
            best: None,
            bad_evaluations: 0,
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn update(&mut self, metric: f32) -> Verdict {
        let improved = match self.best {
            None => true,
            Some(best) => metric > best + self.threshold,
        };
        if improved {
            self.best = Some(metric);
            self.bad_evaluations = 0;
            return Verdict::Improved;
        }
        self.bad_evaluations += 1;
        if self.bad_evaluations >= self.patience {
            Verdict::Stop
        } else {
            Verdict::NoImprovement
        }
    }
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutcome {
    pub epochs: usize,
    pub steps: usize,
    pub best_f1: Option<f32>,
}

/// Result of [`Trainer::predict`].
#[derive(Debug, Clone)]
pub struct PredictionOutput {
    /// Logits per example, `[seq_len][head_width]`.
    pub logits: Vec<Vec<Vec<f32>>>,
    /// Gold token spans per example, when the dataset is labeled.
    pub labels: Option<Vec<Vec<Span>>>,
    /// Span metrics, when the dataset is labeled.
    pub metrics: Option<SpanMetrics>,
}

pub struct Trainer<'a> {
    config: &'a RunConfig,
    model: SlotFillingModel,
    varmap: VarMap,
    device: Device,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &'a RunConfig,
        model: SlotFillingModel,
        varmap: VarMap,
        device: Device,
    ) -> Self {
        Self {
            config,
            model,
            varmap,
            device,
        }
    }

    /// Train on `train`, evaluating on `eval` after every epoch and saving
    /// the best checkpoint to the run's output directory.
    pub fn train(&mut self, train: &SlotDataset, eval: &SlotDataset) -> Result<TrainOutcome> {
        if train.is_empty() {
            bail!("training set is empty");
        }
        let config = self.config;
        let args = config.training();
        let batch_size = args.per_device_train_batch_size.max(1);

        let mut optimizer = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: args.learning_rate,
                weight_decay: args.weight_decay,
                ..Default::default()
            },
        )?;
        let mut stopping =
            EarlyStopping::new(args.early_stopping_patience, args.early_stopping_threshold);
        let mut rng = oorandom::Rand32::new(args.seed);
        let checkpoint = config.checkpoint_path();
        std::fs::create_dir_all(config.output_dir()).with_context(|| {
            format!("failed to create {}", config.output_dir().display())
        })?;

        info!(
            examples = train.len(),
            epochs = args.num_train_epochs,
            batch_size,
            "starting training"
        );

        let mut steps = 0usize;
        let mut epochs = 0usize;
        for epoch in 0..args.num_train_epochs {
            epochs = epoch + 1;
            let mut indices: Vec<usize> = (0..train.len()).collect();
            for i in (1..indices.len()).rev() {
                let j = rng.rand_range(0..(i as u32 + 1)) as usize;
                indices.swap(i, j);
            }

            let mut running = 0f32;
            let mut since_log = 0usize;
            for chunk in indices.chunks(batch_size) {
                let batch = train.collate(chunk, &self.device)?;
                let Some(targets) = batch.targets.as_ref() else {
                    bail!("training batch has no targets");
                };
                let logits = self.model.forward(&batch)?;
                let loss = self.model.loss(&logits, targets)?;
                optimizer.backward_step(&loss)?;

                running += loss.to_scalar::<f32>()?;
                since_log += 1;
                steps += 1;
                if args.logging_steps > 0 && steps % args.logging_steps == 0 {
                    info!(
                        epoch = epochs,
                        step = steps,
                        loss = running / since_log as f32,
                        "training"
                    );
                    running = 0.0;
                    since_log = 0;
                }
            }

            let metrics = self.evaluate(eval)?;
            info!(
                epoch = epochs,
                precision = metrics.precision,
                recall = metrics.recall,
                f1 = metrics.f1,
                "evaluation"
            );

            match stopping.update(metrics.f1) {
                Verdict::Improved => {
                    self.varmap
                        .save(&checkpoint)
                        .with_context(|| format!("failed to save {}", checkpoint.display()))?;
                    info!(path = %checkpoint.display(), f1 = metrics.f1, "saved best checkpoint");
                }
                Verdict::NoImprovement => {}
                Verdict::Stop => {
                    info!(epoch = epochs, "early stopping");
                    break;
                }
            }
        }

        // Later epochs may have moved past the best weights.
        if checkpoint.exists() {
            self.varmap
                .load(&checkpoint)
                .with_context(|| format!("failed to reload {}", checkpoint.display()))?;
        }

        Ok(TrainOutcome {
            epochs,
            steps,
            best_f1: stopping.best(),
        })
    }

    /// Span metrics on a labeled dataset.
    pub fn evaluate(&self, dataset: &SlotDataset) -> Result<SpanMetrics> {
        if dataset.is_empty() {
            warn!("evaluation set is empty");
            return Ok(SpanMetrics::default());
        }
        let output = self.predict(dataset)?;
        output
            .metrics
            .context("evaluation set carries no gold slots")
    }

    /// Run the model over `dataset`, returning per-example logits, gold
    /// spans and metrics when gold spans are available.
    pub fn predict(&self, dataset: &SlotDataset) -> Result<PredictionOutput> {
        let batch_size = self.config.training().per_device_eval_batch_size.max(1);
        let indices: Vec<usize> = (0..dataset.len()).collect();

        let mut logits = Vec::with_capacity(dataset.len());
        for chunk in indices.chunks(batch_size) {
            let batch = dataset.collate(chunk, &self.device)?;
            let output = self.model.forward(&batch)?.to_vec3::<f32>()?;
            for (row, &index) in output.into_iter().zip(&batch.indices) {
                let len = dataset.features()[index].len();
                logits.push(row.into_iter().take(len).collect::<Vec<_>>());
            }
        }

        if !dataset.has_labels() {
            return Ok(PredictionOutput {
                logits,
                labels: None,
                metrics: None,
            });
        }

        let labels: Vec<Vec<Span>> = dataset
            .features()
            .iter()
            .map(|f| f.gold.clone().unwrap_or_default())
            .collect();
        let predictions = self.decode(dataset, &logits);
        let metrics = compute_span_f1(&predictions, &labels);

        Ok(PredictionOutput {
            logits,
            labels: Some(labels),
            metrics: Some(metrics),
        })
    }

    /// Decode per-example logits into token spans.
    pub fn decode(&self, dataset: &SlotDataset, logits: &[Vec<Vec<f32>>]) -> Vec<Vec<Span>> {
        let threshold = self.config.data().pointer_threshold;
        dataset
            .features()
            .iter()
            .zip(logits)
            .map(|(feature, rows)| {
                decode_logits(self.config.labels(), rows, &feature.active, threshold)
            })
            .collect()
    }

    /// Restore weights from a saved checkpoint.
    pub fn load_checkpoint(&mut self) -> Result<bool> {
        let checkpoint = self.config.checkpoint_path();
        if !checkpoint.exists() {
            return Ok(false);
        }
        self.varmap
            .load(&checkpoint)
            .with_context(|| format!("failed to load {}", checkpoint.display()))?;
        info!(path = %checkpoint.display(), "loaded checkpoint");
        Ok(true)
    }
}
