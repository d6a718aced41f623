//! Prediction output.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use slotfill_core::Span;
use tracing::{info, warn};

use crate::data::{Feature, SlotDataset};

/// A predicted slot in original-text character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictedSlot {
    pub role: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// One line of the predictions file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionRecord {
    pub id: String,
    pub slots: Vec<PredictedSlot>,
    pub is_overflow: bool,
}

/// Map token spans of one example back onto its original text. Spans that
/// cover only marker or special tokens are dropped.
pub fn to_record(feature: &Feature, spans: &[Span]) -> PredictionRecord {
    let slots = spans
        .iter()
        .filter_map(|span| {
            let (start, end) = feature.original_span(span)?;
            let text: String = feature.text.chars().skip(start).take(end - start).collect();
            Some(PredictedSlot {
                role: span.role.clone(),
                start,
                end,
                text,
            })
        })
        .collect();

    PredictionRecord {
        id: feature.id.clone(),
        slots,
        is_overflow: feature.is_overflow,
    }
}

/// Write one JSON record per example to `path`.
pub fn dump_predictions<P: AsRef<Path>>(
    dataset: &SlotDataset,
    predictions: &[Vec<Span>],
    path: P,
) -> Result<usize> {
    let path = path.as_ref();
    if predictions.len() != dataset.len() {
        bail!(
            "got {} predictions for {} examples",
            predictions.len(),
            dataset.len()
        );
    }

    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut overflow = 0;
    for (feature, spans) in dataset.features().iter().zip(predictions) {
        let record = to_record(feature, spans);
        overflow += usize::from(record.is_overflow);
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;

    if overflow > 0 {
        warn!(overflow, "some predictions come from truncated examples");
    }
    info!(path = %path.display(), examples = dataset.len(), "wrote predictions");
    Ok(dataset.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RawExample;
    use crate::data::test_support::{config, marked_tokenizer};
    use slotfill_core::{Mention, Paradigm};

    fn dataset(texts: &[&str]) -> SlotDataset {
        let config = config(Paradigm::SequenceLabeling, 64);
        let tokenizer = marked_tokenizer(&config);
        let examples = texts
            .iter()
            .enumerate()
            .map(|(i, text)| RawExample {
                id: format!("ex-{i}"),
                text: text.to_string(),
                mentions: vec![Mention {
                    start: 5,
                    end: 8,
                    category: "PER".into(),
                }],
                slots: None,
            })
            .collect();
        SlotDataset::from_examples(&config, &tokenizer, examples, true).unwrap()
    }

    #[test]
    fn test_record_uses_original_offsets() {
        let dataset = dataset(&["call bob about the bill for march"]);
        let feature = &dataset.features()[0];

        // Token 1 is the open marker in front of "bob".
        let spans = [
            Span::new("owner", 2, 3),
            Span::new("owner", 1, 2),
            Span::new("month", 8, 9),
        ];
        let record = to_record(feature, &spans);

        assert_eq!(record.id, "ex-0");
        assert_eq!(
            record.slots,
            vec![
                PredictedSlot {
                    role: "owner".into(),
                    start: 5,
                    end: 8,
                    text: "bob".into(),
                },
                PredictedSlot {
                    role: "month".into(),
                    start: 28,
                    end: 33,
                    text: "march".into(),
                },
            ]
        );
        assert!(!record.is_overflow);
    }

    #[test]
    fn test_dump_writes_one_line_per_example() {
        let dataset = dataset(&["call bob about the bill for march", "call bob"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.jsonl");

        let predictions = vec![vec![Span::new("month", 8, 9)], vec![]];
        let written = dump_predictions(&dataset, &predictions, &path).unwrap();
        assert_eq!(written, 2);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], "ex-0");
        assert_eq!(lines[0]["slots"][0]["text"], "march");
        assert_eq!(lines[0]["is_overflow"], false);
        assert_eq!(lines[1]["slots"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_dump_rejects_length_mismatch() {
        let dataset = dataset(&["call bob"]);
        let dir = tempfile::tempdir().unwrap();
        assert!(dump_predictions(&dataset, &[], dir.path().join("p.jsonl")).is_err());
    }
}
