//! Backbone and tokenizer loading.
//!
//! The pretrained directory holds a HuggingFace `tokenizer.json`, a
//! `config.json` and `model.safetensors`. Marker tokens are appended to the
//! tokenizer as special tokens and the word embedding matrix is grown to
//! match before the pretrained weights are copied in.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info, warn};

/// Encoder family of the pretrained checkpoint.
///
/// Only BERT-style encoders with absolute positions from 0 are supported;
/// RoBERTa checkpoints offset their position ids and are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Bert,
}

impl ModelType {
    fn as_str(&self) -> &'static str {
        match self {
            ModelType::Bert => "bert",
        }
    }

    /// Prefix HuggingFace checkpoints put in front of encoder weights.
    fn checkpoint_prefix(&self) -> &'static str {
        self.as_str()
    }

    /// Fail unless the `model_type` recorded in `config.json`, if any,
    /// belongs to this family.
    fn check_config(&self, config: &serde_json::Value) -> Result<()> {
        match config.get("model_type").and_then(serde_json::Value::as_str) {
            Some(found) if found != self.as_str() => bail!(
                "checkpoint model_type {found:?} is not supported, expected {:?}",
                self.as_str()
            ),
            _ => Ok(()),
        }
    }
}

/// Shape information of the loaded backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneConfig {
    pub model_type: ModelType,
    pub hidden_size: usize,
    /// Vocabulary size after the marker tokens were added.
    pub vocab_size: usize,
    /// Vocabulary size of the pretrained checkpoint.
    pub pretrained_vocab_size: usize,
}

/// The pretrained encoder.
pub struct Backbone {
    pub encoder: BertModel,
}

/// Load a tokenizer and append `new_tokens` as special tokens.
///
/// Tokens already present keep their id; new ones get fresh ids after the
/// existing vocabulary.
pub fn load_tokenizer(model_path: &Path, new_tokens: &[String]) -> Result<Tokenizer> {
    let path = model_path.join("tokenizer.json");
    let mut tokenizer = Tokenizer::from_file(&path)
        .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", path.display()))?;

    let before = tokenizer.get_vocab_size(true);
    let tokens: Vec<AddedToken> = new_tokens
        .iter()
        .map(|token| AddedToken::from(token.clone(), true))
        .collect();
    let added = tokenizer.add_special_tokens(&tokens);
    if added != new_tokens.len() {
        warn!(
            requested = new_tokens.len(),
            added, "some marker tokens were already in the vocabulary"
        );
    }

    debug!(
        before,
        after = tokenizer.get_vocab_size(true),
        "extended tokenizer vocabulary"
    );
    Ok(tokenizer)
}

/// Build the encoder in `varmap` and fill it with the pretrained weights.
pub fn get_backbone(
    model_type: ModelType,
    model_path: &Path,
    new_tokens: &[String],
    varmap: &VarMap,
    device: &Device,
) -> Result<(Backbone, Tokenizer, BackboneConfig)> {
    let tokenizer = load_tokenizer(model_path, new_tokens)?;
    let vocab_size = tokenizer.get_vocab_size(true);

    let config_path = model_path.join("config.json");
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    model_type
        .check_config(&value)
        .with_context(|| format!("unsupported encoder {}", config_path.display()))?;

    let hidden_size = read_dim(&value, "hidden_size")?;
    let pretrained_vocab_size = read_dim(&value, "vocab_size")?;
    let vocab_size = vocab_size.max(pretrained_vocab_size);
    value["vocab_size"] = vocab_size.into();

    let bert_config: BertConfig = serde_json::from_value(value)
        .with_context(|| format!("unsupported encoder config {}", config_path.display()))?;

    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let encoder = BertModel::load(vb, &bert_config).context("failed to build encoder")?;

    let weights_path = model_path.join("model.safetensors");
    let pretrained = candle_core::safetensors::load(&weights_path, device)
        .with_context(|| format!("failed to load {}", weights_path.display()))?;
    let copied = copy_pretrained(varmap, &pretrained, model_type.checkpoint_prefix())?;

    let config = BackboneConfig {
        model_type,
        hidden_size,
        vocab_size,
        pretrained_vocab_size,
    };
    info!(
        path = %model_path.display(),
        hidden_size,
        vocab_size,
        copied,
        "loaded backbone"
    );

    Ok((Backbone { encoder }, tokenizer, config))
}

fn read_dim(config: &serde_json::Value, key: &str) -> Result<usize> {
    config
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("encoder config has no integer {key:?}"))
}

/// Checkpoint names a variable may be stored under.
fn checkpoint_names(name: &str, prefix: &str) -> Vec<String> {
    let mut names = vec![name.to_string(), format!("{prefix}.{name}")];
    // Older checkpoints store layer norms as gamma/beta.
    if name.contains("LayerNorm") {
        let legacy = name
            .strip_suffix(".weight")
            .map(|stem| format!("{stem}.gamma"))
            .or_else(|| name.strip_suffix(".bias").map(|stem| format!("{stem}.beta")));
        if let Some(legacy) = legacy {
            names.push(format!("{prefix}.{legacy}"));
            names.push(legacy);
        }
    }
    names
}

/// Copy every pretrained tensor into the matching variable. A variable with
/// more rows than its checkpoint tensor (the grown word embeddings) keeps its
/// fresh initialisation for the extra rows. Returns the number of copied
/// variables.
pub(crate) fn copy_pretrained(
    varmap: &VarMap,
    pretrained: &HashMap<String, Tensor>,
    prefix: &str,
) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?;

    let mut copied = 0;
    let mut missing = Vec::new();
    for (name, var) in data.iter() {
        let Some(source) = checkpoint_names(name, prefix)
            .iter()
            .find_map(|candidate| pretrained.get(candidate))
        else {
            missing.push(name.as_str());
            continue;
        };
        let source = source.to_dtype(var.dtype())?;
        let target = var.dims().to_vec();

        if source.dims() == target.as_slice() {
            var.set(&source)?;
        } else if source.rank() == 2
            && target.len() == 2
            && source.dim(1)? == target[1]
            && source.dim(0)? < target[0]
        {
            let rows = source.dim(0)?;
            let fresh = var.as_tensor().narrow(0, rows, target[0] - rows)?;
            var.set(&Tensor::cat(&[&source, &fresh], 0)?)?;
            debug!(name = %name, rows, grown_to = target[0], "grew embedding matrix");
        } else {
            bail!(
                "checkpoint tensor for {name} has shape {:?}, expected {:?}",
                source.dims(),
                target
            );
        }
        copied += 1;
    }

    if !missing.is_empty() {
        warn!(count = missing.len(), first = missing[0], "variables not found in checkpoint");
    }
    Ok(copied)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::data::test_support::tokenizer;

    pub(crate) const PRETRAINED_VOCAB: usize = 10;

    /// Encoder config small enough to train on CPU in a test.
    pub(crate) fn tiny_config() -> serde_json::Value {
        serde_json::json!({
            "vocab_size": PRETRAINED_VOCAB,
            "hidden_size": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "hidden_act": "gelu",
            "hidden_dropout_prob": 0.0,
            "max_position_embeddings": 32,
            "type_vocab_size": 2,
            "initializer_range": 0.02,
            "layer_norm_eps": 1e-12,
            "pad_token_id": 1,
            "position_embedding_type": "absolute",
            "use_cache": false,
            "classifier_dropout": null,
            "model_type": "bert"
        })
    }

    /// Write a randomly initialised pretrained directory under `dir`.
    pub(crate) fn write_tiny_backbone(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        tokenizer().save(dir.join("tokenizer.json"), false).unwrap();

        let config = tiny_config();
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bert_config: BertConfig = serde_json::from_value(config).unwrap();
        BertModel::load(vb, &bert_config).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{PRETRAINED_VOCAB, tiny_config, write_tiny_backbone};
    use super::*;
    use candle_nn::Init;

    #[test]
    fn test_get_backbone_grows_vocabulary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_tiny_backbone(dir.path());
        let markers = vec!["<entity_0>".to_string(), "</entity_0>".to_string()];

        let varmap = VarMap::new();
        let (_, tokenizer, config) =
            get_backbone(ModelType::Bert, dir.path(), &markers, &varmap, &Device::Cpu)?;

        assert_eq!(config.hidden_size, 8);
        assert_eq!(config.pretrained_vocab_size, PRETRAINED_VOCAB);
        assert_eq!(config.vocab_size, PRETRAINED_VOCAB + 2);
        assert_eq!(tokenizer.token_to_id("</entity_0>"), Some(11));

        let data = varmap.data().lock().unwrap();
        let emb = &data["embeddings.word_embeddings.weight"];
        assert_eq!(emb.dims(), [PRETRAINED_VOCAB + 2, 8]);
        Ok(())
    }

    #[test]
    fn test_roberta_checkpoint_rejected() {
        let mut config = tiny_config();
        assert!(ModelType::Bert.check_config(&config).is_ok());

        config["model_type"] = "roberta".into();
        let err = ModelType::Bert.check_config(&config).unwrap_err();
        assert!(err.to_string().contains("roberta"));

        config.as_object_mut().unwrap().remove("model_type");
        assert!(ModelType::Bert.check_config(&config).is_ok());
    }

    #[test]
    fn test_checkpoint_names() {
        let names = checkpoint_names("embeddings.LayerNorm.weight", "bert");
        assert_eq!(
            names,
            [
                "embeddings.LayerNorm.weight",
                "bert.embeddings.LayerNorm.weight",
                "bert.embeddings.LayerNorm.gamma",
                "embeddings.LayerNorm.gamma",
            ]
        );
        assert_eq!(checkpoint_names("pooler.dense.bias", "bert").len(), 2);
    }

    #[test]
    fn test_copy_grows_embeddings() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((5, 2), "embeddings.word_embeddings.weight", Init::Const(7.0))?;
        vb.get_with_hints(2, "embeddings.LayerNorm.weight", Init::Const(0.0))?;

        let mut pretrained = HashMap::new();
        pretrained.insert(
            "bert.embeddings.word_embeddings.weight".to_string(),
            Tensor::zeros((3, 2), DType::F32, &device)?,
        );
        pretrained.insert(
            "bert.embeddings.LayerNorm.gamma".to_string(),
            Tensor::ones(2, DType::F32, &device)?,
        );

        let copied = copy_pretrained(&varmap, &pretrained, "bert")?;
        assert_eq!(copied, 2);

        let data = varmap.data().lock().unwrap();
        let emb = data["embeddings.word_embeddings.weight"].as_tensor().to_vec2::<f32>()?;
        assert_eq!(emb[0], [0.0, 0.0]);
        assert_eq!(emb[2], [0.0, 0.0]);
        assert_eq!(emb[3], [7.0, 7.0]);
        assert_eq!(emb[4], [7.0, 7.0]);
        let norm = data["embeddings.LayerNorm.weight"].as_tensor().to_vec1::<f32>()?;
        assert_eq!(norm, [1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_copy_rejects_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((2, 2), "classifier.weight", Init::Const(0.0))?;

        let mut pretrained = HashMap::new();
        pretrained.insert(
            "classifier.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &device)?,
        );
        assert!(copy_pretrained(&varmap, &pretrained, "bert").is_err());
        Ok(())
    }
}
