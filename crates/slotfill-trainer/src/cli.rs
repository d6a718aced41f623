//! Command-line surface of the `train` binary.
//!
//! ```text
//! train run.json                  # everything from a JSON document
//! train run.yaml [train|test]     # YAML document, optionally one phase
//! train --model-name-or-path ...  # plain flags
//! ```

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::warn;

use crate::config::{Arguments, DataArguments, ModelArguments, RunMode, TrainingArguments};

#[derive(Debug, Parser)]
#[command(name = "train")]
#[command(about = "Train and evaluate slot filling models")]
#[command(version)]
pub struct Cli {
    /// JSON or YAML run configuration; flags are ignored when given
    pub config: Option<PathBuf>,

    /// Phase to run with a YAML configuration
    #[arg(value_enum, requires = "config")]
    pub mode: Option<RunMode>,

    #[command(flatten)]
    pub model: ModelArguments,

    #[command(flatten)]
    pub data: DataArguments,

    #[command(flatten)]
    pub training: TrainingArguments,
}

impl Cli {
    /// Resolve the argument groups from whichever surface was used.
    pub fn into_arguments(self) -> Result<Arguments> {
        let Some(path) = self.config else {
            return Ok(Arguments::new(self.model, self.data, self.training));
        };

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => {
                if let Some(mode) = self.mode {
                    warn!(?mode, "run mode is ignored for JSON configurations");
                }
                Arguments::from_json_file(&path)
            }
            Some("yaml" | "yml") => {
                let arguments = Arguments::from_yaml_file(&path)?;
                Ok(match self.mode {
                    Some(mode) => arguments.with_mode(mode),
                    None => arguments,
                })
            }
            _ => bail!(
                "unsupported configuration file {}, expected .json, .yaml or .yml",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotfill_core::Paradigm;

    #[test]
    fn test_flag_surface() {
        let cli = Cli::try_parse_from([
            "train",
            "--model-name-or-path",
            "models/bert",
            "--paradigm",
            "span_pointer",
            "--do-train",
            "--num-train-epochs",
            "5",
        ])
        .unwrap();
        assert!(cli.config.is_none());

        let args = cli.into_arguments().unwrap();
        assert_eq!(args.model.model_name_or_path, Some(PathBuf::from("models/bert")));
        assert_eq!(args.model.paradigm, Paradigm::SpanPointer);
        assert!(args.training.do_train);
        assert_eq!(args.training.num_train_epochs, 5);
        assert_eq!(args.data.max_seq_length, 256);
    }

    #[test]
    fn test_yaml_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(
            &path,
            "model_name_or_path: models/bert\ndo_train: true\ndo_predict: false\nseed: 7\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from(["train", path.to_str().unwrap(), "test"]).unwrap();
        assert_eq!(cli.mode, Some(RunMode::Test));

        let args = cli.into_arguments().unwrap();
        assert!(!args.training.do_train);
        assert!(args.training.do_predict);
        assert_eq!(args.training.seed, 7);
    }

    #[test]
    fn test_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"model_name_or_path": "m", "do_predict": true}"#).unwrap();

        let cli = Cli::try_parse_from(["train", path.to_str().unwrap()]).unwrap();
        let args = cli.into_arguments().unwrap();
        assert!(args.training.do_predict);
        assert!(!args.training.do_train);
    }

    #[test]
    fn test_unknown_extension_and_bad_mode() {
        let cli = Cli::try_parse_from(["train", "run.toml"]).unwrap();
        assert!(cli.into_arguments().is_err());

        assert!(Cli::try_parse_from(["train", "run.yaml", "deploy"]).is_err());
    }
}
