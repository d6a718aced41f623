//! Data loading for slot filling examples.
//!
//! Examples are JSON Lines:
//!
//! ```json
//! {"id": "d1-3", "text": "...", "mentions": [{"start": 0, "end": 2, "category": "PER"}],
//!  "slots": [{"start": 5, "end": 9, "role": "owner"}]}
//! ```
//!
//! Offsets are character offsets, `end` exclusive.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{Device, Tensor};
use serde::Deserialize;
use slotfill_core::{FormattedText, LabelSpace, Mention, Paradigm, Span, format_with_markers};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::config::RunConfig;

/// A raw example as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RawExample {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    /// Gold slots; absent in unlabeled test files.
    #[serde(default)]
    pub slots: Option<Vec<Span>>,
}

/// Per-token supervision of one example.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// Label id per token, `None` for ignored positions.
    Tags(Vec<Option<u32>>),
    /// `2 * num_labels` start/end indicators per token.
    Pointers(Vec<Vec<f32>>),
}

/// A tokenized example.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: String,
    pub text: String,
    pub formatted: FormattedText,
    pub input_ids: Vec<u32>,
    /// Character offsets of every token in the formatted text.
    pub offsets: Vec<(usize, usize)>,
    /// Whether a token covers original characters (not a special or marker token).
    pub active: Vec<bool>,
    /// Gold slots as token spans, when the example is labeled.
    pub gold: Option<Vec<Span>>,
    pub targets: Option<Targets>,
    /// Whether the example was truncated to fit `max_seq_length`.
    pub is_overflow: bool,
}

impl Feature {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Character span of the original text covered by a token span.
    pub fn original_span(&self, span: &Span) -> Option<(usize, usize)> {
        if span.start >= span.end || span.end > self.offsets.len() {
            return None;
        }
        let start = self.offsets[span.start].0;
        let end = self.offsets[span.end - 1].1;
        self.formatted.original_span(start, end)
    }
}

/// Targets of a padded batch.
#[derive(Debug)]
pub enum BatchTargets {
    /// `labels`: `[b, l]` u32, `mask`: `[b, l]` f32.
    Tags {
        labels: Tensor,
        mask: Tensor,
        active: usize,
    },
    /// `labels`: `[b, l, 2 * num_labels]` f32, `mask`: `[b, l]` f32.
    Pointers {
        labels: Tensor,
        mask: Tensor,
        active: usize,
    },
}

/// A padded batch of features.
#[derive(Debug)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
    pub targets: Option<BatchTargets>,
    /// Dataset indices of the batch rows.
    pub indices: Vec<usize>,
}

/// A tokenized dataset.
#[derive(Debug)]
pub struct SlotDataset {
    features: Vec<Feature>,
    paradigm: Paradigm,
    num_labels: usize,
    pad_id: u32,
}

impl SlotDataset {
    /// Load and tokenize a JSON Lines file.
    pub fn new<P: AsRef<Path>>(
        config: &RunConfig,
        tokenizer: &Tokenizer,
        path: P,
        is_test: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let examples = load_examples(path)?;
        let dataset = Self::from_examples(config, tokenizer, examples, is_test)
            .with_context(|| format!("failed to prepare {}", path.display()))?;
        info!(
            path = %path.display(),
            examples = dataset.len(),
            overflow = dataset.is_overflow().iter().filter(|&&o| o).count(),
            "loaded dataset"
        );
        Ok(dataset)
    }

    /// Tokenize in-memory examples. Unlabeled test examples get no targets;
    /// unlabeled training examples are treated as having no slots.
    pub fn from_examples(
        config: &RunConfig,
        tokenizer: &Tokenizer,
        examples: Vec<RawExample>,
        is_test: bool,
    ) -> Result<Self> {
        let mut tokenizer = tokenizer.clone();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.data().max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("invalid truncation settings: {e}"))?;

        let labels = config.labels();
        let features = examples
            .into_iter()
            .map(|example| {
                let id = example.id.clone();
                build_feature(config, &tokenizer, example, is_test)
                    .with_context(|| format!("example {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let pad_id = ["[PAD]", "<pad>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            .unwrap_or(0);

        Ok(Self {
            features,
            paradigm: labels.paradigm(),
            num_labels: labels.num_labels(),
            pad_id,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Truncation flag of every example, in order.
    pub fn is_overflow(&self) -> Vec<bool> {
        self.features.iter().map(|f| f.is_overflow).collect()
    }

    /// Whether every example carries gold slots.
    pub fn has_labels(&self) -> bool {
        !self.features.is_empty() && self.features.iter().all(|f| f.targets.is_some())
    }

    /// Pad the selected features into a batch.
    pub fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let rows: Vec<&Feature> = indices
            .iter()
            .map(|&i| {
                self.features
                    .get(i)
                    .ok_or_else(|| anyhow!("index {i} out of range for {} examples", self.len()))
            })
            .collect::<Result<_>>()?;
        if rows.is_empty() {
            bail!("cannot collate an empty batch");
        }

        let b = rows.len();
        let l = rows.iter().map(|f| f.len()).max().unwrap_or(0);

        let mut input_ids = vec![self.pad_id; b * l];
        let mut attention = vec![0u32; b * l];
        let mut mask = vec![0f32; b * l];
        for (r, feature) in rows.iter().enumerate() {
            for (t, &id) in feature.input_ids.iter().enumerate() {
                input_ids[r * l + t] = id;
                attention[r * l + t] = 1;
                if feature.active[t] {
                    mask[r * l + t] = 1.0;
                }
            }
        }

        let active = mask.iter().filter(|&&m| m > 0.0).count();
        let targets = if rows.iter().all(|f| f.targets.is_some()) {
            Some(self.collate_targets(&rows, l, mask, active, device)?)
        } else {
            None
        };

        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, (b, l), device)?,
            attention_mask: Tensor::from_vec(attention, (b, l), device)?,
            token_type_ids: Tensor::zeros((b, l), candle_core::DType::U32, device)?,
            targets,
            indices: indices.to_vec(),
        })
    }

    fn collate_targets(
        &self,
        rows: &[&Feature],
        l: usize,
        mask: Vec<f32>,
        active: usize,
        device: &Device,
    ) -> Result<BatchTargets> {
        let b = rows.len();
        let mask = Tensor::from_vec(mask, (b, l), device)?;

        match self.paradigm {
            Paradigm::SequenceLabeling => {
                let mut labels = vec![0u32; b * l];
                for (r, feature) in rows.iter().enumerate() {
                    let Some(Targets::Tags(tags)) = &feature.targets else {
                        bail!("example {} has no tag targets", feature.id);
                    };
                    for (t, tag) in tags.iter().enumerate() {
                        labels[r * l + t] = tag.unwrap_or(0);
                    }
                }
                Ok(BatchTargets::Tags {
                    labels: Tensor::from_vec(labels, (b, l), device)?,
                    mask,
                    active,
                })
            }
            Paradigm::SpanPointer => {
                let k = 2 * self.num_labels;
                let mut labels = vec![0f32; b * l * k];
                for (r, feature) in rows.iter().enumerate() {
                    let Some(Targets::Pointers(pointers)) = &feature.targets else {
                        bail!("example {} has no pointer targets", feature.id);
                    };
                    for (t, row) in pointers.iter().enumerate() {
                        let at = (r * l + t) * k;
                        labels[at..at + k].copy_from_slice(row);
                    }
                }
                Ok(BatchTargets::Pointers {
                    labels: Tensor::from_vec(labels, (b, l, k), device)?,
                    mask,
                    active,
                })
            }
        }
    }
}

/// Read a JSON Lines file, skipping blank lines.
pub fn load_examples<P: AsRef<Path>>(path: P) -> Result<Vec<RawExample>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut examples = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let example: RawExample = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed example", path.display(), number + 1))?;
        examples.push(example);
    }

    Ok(examples)
}

fn build_feature(
    config: &RunConfig,
    tokenizer: &Tokenizer,
    example: RawExample,
    is_test: bool,
) -> Result<Feature> {
    let formatted = format_with_markers(&example.text, &example.mentions, config.markers())?;
    let encoding = tokenizer
        .encode_char_offsets(formatted.text(), true)
        .map_err(|e| anyhow!("tokenization failed: {e}"))?;

    let input_ids = encoding.get_ids().to_vec();
    let offsets = encoding.get_offsets().to_vec();
    let is_overflow = !encoding.get_overflowing().is_empty();
    let active = offsets
        .iter()
        .map(|&(s, e)| s < e && formatted.original_span(s, e).is_some())
        .collect::<Vec<_>>();

    let slots = match example.slots {
        Some(slots) => Some(slots),
        None if is_test => None,
        None => Some(Vec::new()),
    };

    let (gold, targets) = match slots {
        Some(slots) => {
            let gold = token_spans(config.labels(), &formatted, &offsets, &active, &slots)?;
            let targets = build_targets(config.labels(), &gold, &active);
            (Some(gold), Some(targets))
        }
        None => (None, None),
    };

    if is_overflow {
        debug!(id = %example.id, tokens = input_ids.len(), "example truncated");
    }

    Ok(Feature {
        id: example.id,
        text: example.text,
        formatted,
        input_ids,
        offsets,
        active,
        gold,
        targets,
        is_overflow,
    })
}

/// Project character-level slots onto active tokens. Slots whose tokens
/// were truncated away are dropped.
fn token_spans(
    labels: &LabelSpace,
    formatted: &FormattedText,
    offsets: &[(usize, usize)],
    active: &[bool],
    slots: &[Span],
) -> Result<Vec<Span>> {
    let mut spans = Vec::with_capacity(slots.len());
    for slot in slots {
        if labels.role_id(&slot.role, false).is_none() {
            bail!("unknown slot role {:?}", slot.role);
        }
        let (from, to) = formatted.project(slot.start, slot.end).ok_or_else(|| {
            anyhow!(
                "slot [{}, {}) is out of range for a text of {} characters",
                slot.start,
                slot.end,
                formatted.original_len()
            )
        })?;

        let mut covered = offsets
            .iter()
            .enumerate()
            .filter(|&(t, &(s, e))| active[t] && s < to && e > from)
            .map(|(t, _)| t);
        let Some(first) = covered.next() else {
            continue;
        };
        let last = covered.last().unwrap_or(first);
        spans.push(Span::new(slot.role.clone(), first, last + 1));
    }
    spans.sort();
    Ok(spans)
}

fn build_targets(labels: &LabelSpace, spans: &[Span], active: &[bool]) -> Targets {
    match labels.paradigm() {
        Paradigm::SequenceLabeling => {
            let outside = labels.outside_id().unwrap_or(0);
            let mut tags: Vec<Option<u32>> = active
                .iter()
                .map(|&on| on.then_some(outside))
                .collect();
            for span in spans {
                let begin = labels.role_id(&span.role, false);
                let inside = labels.role_id(&span.role, true);
                for t in span.start..span.end {
                    if active[t] {
                        tags[t] = if t == span.start { begin } else { inside };
                    }
                }
            }
            Targets::Tags(tags)
        }
        Paradigm::SpanPointer => {
            let n = labels.num_labels();
            let mut pointers = vec![vec![0f32; 2 * n]; active.len()];
            for span in spans {
                if let Some(role) = labels.column(&span.role) {
                    pointers[span.start][role] = 1.0;
                    pointers[span.end - 1][n + role] = 1.0;
                }
            }
            Targets::Pointers(pointers)
        }
    }
}
