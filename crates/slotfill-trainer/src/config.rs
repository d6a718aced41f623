//! Run configuration.
//!
//! Arguments come in three groups (model, data, training). Each group can be
//! given as command-line flags or as part of a flat JSON/YAML document; both
//! surfaces share the same defaults. The groups and everything derived from
//! them are frozen into a [`RunConfig`] by [`RunConfigBuilder`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use slotfill_core::{IdMap, LabelSpace, MarkerSet, Paradigm, SlotFillError, build_markers};
use tracing::{debug, warn};

use crate::backbone::ModelType;

const DEFAULT_TASK_NAME: &str = "SF";
const DEFAULT_MAX_SEQ_LENGTH: usize = 256;
const DEFAULT_POINTER_THRESHOLD: f32 = 0.5;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_EPOCHS: usize = 3;
const DEFAULT_BATCH_SIZE: usize = 8;
const DEFAULT_LEARNING_RATE: f64 = 5e-5;
const DEFAULT_WEIGHT_DECAY: f64 = 0.01;
const DEFAULT_LOGGING_STEPS: usize = 100;
const DEFAULT_PATIENCE: usize = 3;

/// Backbone and output formulation.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArguments {
    /// Directory holding tokenizer.json, config.json and model.safetensors
    #[arg(long)]
    pub model_name_or_path: Option<PathBuf>,

    /// Encoder family of the backbone checkpoint
    #[arg(long, value_enum, default_value_t = ModelType::Bert)]
    pub model_type: ModelType,

    /// Output formulation: sequence_labeling or span_pointer
    #[arg(long, default_value_t = Paradigm::SequenceLabeling)]
    pub paradigm: Paradigm,
}

impl Default for ModelArguments {
    fn default() -> Self {
        Self {
            model_name_or_path: None,
            model_type: ModelType::Bert,
            paradigm: Paradigm::SequenceLabeling,
        }
    }
}

/// Vocabulary and dataset files.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct DataArguments {
    /// Entity type to id map (flat JSON object)
    #[arg(long)]
    pub type2id_path: Option<PathBuf>,

    /// Role to id map (flat JSON object)
    #[arg(long)]
    pub role2id_path: Option<PathBuf>,

    /// Training examples (JSON Lines)
    #[arg(long)]
    pub train_file: Option<PathBuf>,

    /// Validation examples (JSON Lines)
    #[arg(long)]
    pub validation_file: Option<PathBuf>,

    /// Test examples (JSON Lines)
    #[arg(long)]
    pub test_file: Option<PathBuf>,

    /// Whether the test file carries gold slots
    #[arg(long)]
    pub test_exists_labels: bool,

    /// Maximum number of tokens per example, longer inputs are truncated
    #[arg(long, default_value_t = DEFAULT_MAX_SEQ_LENGTH)]
    pub max_seq_length: usize,

    /// Probability a span pointer must reach to fire
    #[arg(long, default_value_t = DEFAULT_POINTER_THRESHOLD)]
    pub pointer_threshold: f32,
}

impl Default for DataArguments {
    fn default() -> Self {
        Self {
            type2id_path: None,
            role2id_path: None,
            train_file: None,
            validation_file: None,
            test_file: None,
            test_exists_labels: false,
            max_seq_length: DEFAULT_MAX_SEQ_LENGTH,
            pointer_threshold: DEFAULT_POINTER_THRESHOLD,
        }
    }
}

/// Optimisation, evaluation and output settings.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArguments {
    /// Root directory for checkpoints and predictions
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Task name, used as the first level below the output root
    #[arg(long, default_value = DEFAULT_TASK_NAME)]
    pub task_name: String,

    /// Run training
    #[arg(long)]
    pub do_train: bool,

    /// Run prediction on the test file
    #[arg(long)]
    pub do_predict: bool,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[arg(long, default_value_t = DEFAULT_EPOCHS)]
    pub num_train_epochs: usize,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub per_device_train_batch_size: usize,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub per_device_eval_batch_size: usize,

    #[arg(long, default_value_t = DEFAULT_LEARNING_RATE)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = DEFAULT_WEIGHT_DECAY)]
    pub weight_decay: f64,

    /// Log the running loss every N optimisation steps
    #[arg(long, default_value_t = DEFAULT_LOGGING_STEPS)]
    pub logging_steps: usize,

    /// Evaluations without improvement before training stops
    #[arg(long, default_value_t = DEFAULT_PATIENCE)]
    pub early_stopping_patience: usize,

    /// Minimum F1 gain that counts as an improvement
    #[arg(long, default_value_t = 0.0)]
    pub early_stopping_threshold: f32,

    /// Stay on the CPU even when CUDA is available
    #[arg(long)]
    pub no_cuda: bool,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: None,
            task_name: DEFAULT_TASK_NAME.to_string(),
            do_train: false,
            do_predict: false,
            seed: DEFAULT_SEED,
            num_train_epochs: DEFAULT_EPOCHS,
            per_device_train_batch_size: DEFAULT_BATCH_SIZE,
            per_device_eval_batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            logging_steps: DEFAULT_LOGGING_STEPS,
            early_stopping_patience: DEFAULT_PATIENCE,
            early_stopping_threshold: 0.0,
            no_cuda: false,
        }
    }
}

/// Which phase a YAML-configured run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Train,
    Test,
}

/// All three argument groups, as read from one flat document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Arguments {
    #[serde(flatten)]
    pub model: ModelArguments,
    #[serde(flatten)]
    pub data: DataArguments,
    #[serde(flatten)]
    pub training: TrainingArguments,
    /// Keys no group consumed. Must stay the last flattened field.
    #[serde(flatten)]
    unknown: BTreeMap<String, IgnoredAny>,
}

impl Arguments {
    pub fn new(model: ModelArguments, data: DataArguments, training: TrainingArguments) -> Self {
        Self {
            model,
            data,
            training,
            unknown: BTreeMap::new(),
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let arguments: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?;
        arguments.warn_unknown(path);
        Ok(arguments)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let arguments: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?;
        arguments.warn_unknown(path);
        Ok(arguments)
    }

    /// Document keys that match no argument, in sorted order.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.unknown.keys().map(String::as_str)
    }

    fn warn_unknown(&self, path: &Path) {
        for key in self.unknown_keys() {
            warn!(key, config = %path.display(), "ignoring unknown configuration key");
        }
    }

    /// Restrict the run to exactly one phase.
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.training.do_train = mode == RunMode::Train;
        self.training.do_predict = mode == RunMode::Test;
        self
    }
}

/// `root / task / paradigm / basename(model)`.
pub fn resolve_output_dir(
    root: &Path,
    task_name: &str,
    paradigm: Paradigm,
    model_name_or_path: &Path,
) -> PathBuf {
    let model_name = model_name_or_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    root.join(task_name).join(paradigm.as_str()).join(model_name)
}

/// Frozen configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    model: ModelArguments,
    data: DataArguments,
    training: TrainingArguments,
    model_path: PathBuf,
    output_dir: PathBuf,
    labels: LabelSpace,
    markers: MarkerSet,
}

impl RunConfig {
    pub fn builder(arguments: Arguments) -> RunConfigBuilder {
        RunConfigBuilder::new(arguments)
    }

    pub fn model(&self) -> &ModelArguments {
        &self.model
    }

    pub fn data(&self) -> &DataArguments {
        &self.data
    }

    pub fn training(&self) -> &TrainingArguments {
        &self.training
    }

    pub fn paradigm(&self) -> Paradigm {
        self.labels.paradigm()
    }

    /// Backbone directory.
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Resolved per-run output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.labels
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join("model.safetensors")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.output_dir.join("predictions.jsonl")
    }
}

/// Assembles a [`RunConfig`], loading the vocabularies unless they are
/// supplied directly.
#[derive(Debug)]
pub struct RunConfigBuilder {
    arguments: Arguments,
    role2id: Option<IdMap>,
    type2id: Option<IdMap>,
}

impl RunConfigBuilder {
    pub fn new(arguments: Arguments) -> Self {
        Self {
            arguments,
            role2id: None,
            type2id: None,
        }
    }

    /// Use this role map instead of reading `role2id_path`.
    pub fn role2id(mut self, role2id: IdMap) -> Self {
        self.role2id = Some(role2id);
        self
    }

    /// Use this type map instead of reading `type2id_path`.
    pub fn type2id(mut self, type2id: IdMap) -> Self {
        self.type2id = Some(type2id);
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        let Arguments {
            model,
            data,
            training,
            ..
        } = self.arguments;

        let model_path = require(&model.model_name_or_path, "model_name_or_path")?.clone();
        let output_root = require(&training.output_dir, "output_dir")?;
        if training.do_train {
            require(&data.train_file, "train_file")?;
            require(&data.validation_file, "validation_file")?;
        }
        if training.do_predict {
            require(&data.test_file, "test_file")?;
        }
        if data.max_seq_length < 2 {
            return Err(SlotFillError::Configuration(
                "max_seq_length must leave room for special tokens".to_string(),
            )
            .into());
        }

        // Vocabularies are built before anything expensive is loaded.
        let role2id = match self.role2id {
            Some(map) => map,
            None => IdMap::from_path(require(&data.role2id_path, "role2id_path")?)?,
        };
        let labels = model.paradigm.label_space(&role2id)?;

        let type2id = match self.type2id {
            Some(map) => map,
            None => IdMap::from_path(require(&data.type2id_path, "type2id_path")?)?,
        };
        let markers = build_markers(&type2id)?;

        let output_dir =
            resolve_output_dir(output_root, &training.task_name, model.paradigm, &model_path);

        debug!(
            num_labels = labels.num_labels(),
            markers = markers.len(),
            output_dir = %output_dir.display(),
            "assembled run configuration"
        );

        Ok(RunConfig {
            model,
            data,
            training,
            model_path,
            output_dir,
            labels,
            markers,
        })
    }
}

fn require<'a, T>(value: &'a Option<T>, name: &str) -> std::result::Result<&'a T, SlotFillError> {
    value
        .as_ref()
        .ok_or_else(|| SlotFillError::Configuration(format!("missing required argument {name}")))
}
