//! # Slotfill Trainer
//!
//! Fine-tunes a pretrained encoder for slot filling and runs it over a test
//! set. A run is described by a [`config::RunConfig`], built from a JSON or
//! YAML document or from command-line flags, and executed by [`run`].

pub mod backbone;
pub mod cli;
pub mod config;
pub mod data;
pub mod dump;
pub mod model;
pub mod trainer;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backbone::get_backbone;
use crate::cli::Cli;
use crate::config::RunConfig;
use crate::data::SlotDataset;
use crate::dump::dump_predictions;
use crate::model::get_model;
use crate::trainer::Trainer;

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed when embedded in another program.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn select_device(no_cuda: bool) -> Result<Device> {
    if no_cuda {
        return Ok(Device::Cpu);
    }
    Device::cuda_if_available(0).context("failed to initialise device")
}

/// Execute one run end to end.
pub fn run(cli: Cli) -> Result<()> {
    let arguments = cli.into_arguments()?;
    let config = RunConfig::builder(arguments).build()?;
    let args = config.training();

    std::fs::create_dir_all(config.output_dir()).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir().display()
        )
    })?;

    let device = select_device(args.no_cuda)?;
    if let Err(e) = device.set_seed(args.seed) {
        debug!(error = %e, "device does not support seeding");
    }

    info!(
        model = %config.model_path().display(),
        paradigm = %config.paradigm(),
        labels = config.labels().num_labels(),
        markers = config.markers().len(),
        output_dir = %config.output_dir().display(),
        do_train = args.do_train,
        do_predict = args.do_predict,
        "run configuration"
    );
    if !args.do_train && !args.do_predict {
        warn!("neither do_train nor do_predict is set, nothing to do");
        return Ok(());
    }

    let varmap = VarMap::new();
    let (backbone, tokenizer, backbone_config) = get_backbone(
        config.model().model_type,
        config.model_path(),
        &config.markers().tokens(),
        &varmap,
        &device,
    )?;
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = get_model(config.labels(), backbone, &backbone_config, vb)?;
    let mut trainer = Trainer::new(&config, model, varmap, device);

    if args.do_train {
        let data = config.data();
        let train_path = data.train_file.as_ref().context("train_file is not set")?;
        let eval_path = data
            .validation_file
            .as_ref()
            .context("validation_file is not set")?;
        let train = SlotDataset::new(&config, &tokenizer, train_path, false)?;
        let eval = SlotDataset::new(&config, &tokenizer, eval_path, false)?;

        let outcome = trainer.train(&train, &eval)?;
        info!(
            epochs = outcome.epochs,
            steps = outcome.steps,
            best_f1 = outcome.best_f1.unwrap_or_default(),
            "training finished"
        );
    }

    if args.do_predict {
        if !args.do_train && !trainer.load_checkpoint()? {
            warn!(
                path = %config.checkpoint_path().display(),
                "no fine-tuned checkpoint found, predicting with a fresh head"
            );
        }

        let data = config.data();
        let test_path = data.test_file.as_ref().context("test_file is not set")?;
        let test = SlotDataset::new(&config, &tokenizer, test_path, true)?;
        let output = trainer.predict(&test)?;

        match output.metrics {
            Some(metrics) if data.test_exists_labels => {
                info!(
                    precision = metrics.precision,
                    recall = metrics.recall,
                    f1 = metrics.f1,
                    predicted = metrics.predicted,
                    gold = metrics.gold,
                    correct = metrics.correct,
                    "test metrics"
                );
            }
            _ => {
                let predictions = trainer.decode(&test, &output.logits);
                dump_predictions(&test, &predictions, config.predictions_path())?;
            }
        }
    }

    Ok(())
}
