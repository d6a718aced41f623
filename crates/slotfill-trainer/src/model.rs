//! Slot filling model: the pretrained encoder plus a paradigm-specific
//! classification head, with the matching losses and output decoding.

use candle_core::{D, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::BertModel;
use slotfill_core::{LabelSpace, Paradigm, Span, decode_bio, decode_pointer};

use crate::backbone::{Backbone, BackboneConfig};
use crate::data::{Batch, BatchTargets};

/// Encoder + linear head over every token.
///
/// For sequence labeling the head emits one logit per label. For span
/// pointing it emits `2 * num_labels` logits per token: start logits for
/// every role followed by end logits for every role, in
/// [`LabelSpace::columns`] order.
pub struct SlotFillingModel {
    encoder: BertModel,
    classifier: Linear,
    paradigm: Paradigm,
    num_labels: usize,
}

/// Head width for a label space.
pub fn head_width(labels: &LabelSpace) -> usize {
    match labels.paradigm() {
        Paradigm::SequenceLabeling => labels.num_labels(),
        Paradigm::SpanPointer => 2 * labels.num_labels(),
    }
}

/// Attach a freshly initialised head to the backbone.
pub fn get_model(
    labels: &LabelSpace,
    backbone: Backbone,
    config: &BackboneConfig,
    vb: VarBuilder,
) -> Result<SlotFillingModel> {
    let classifier = candle_nn::linear(config.hidden_size, head_width(labels), vb.pp("classifier"))?;

    Ok(SlotFillingModel {
        encoder: backbone.encoder,
        classifier,
        paradigm: labels.paradigm(),
        num_labels: labels.num_labels(),
    })
}

impl SlotFillingModel {
    /// Logits of shape `[batch, seq_len, head_width]`.
    pub fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let hidden = self.encoder.forward(
            &batch.input_ids,
            &batch.token_type_ids,
            Some(&batch.attention_mask),
        )?;
        self.classifier.forward(&hidden)
    }

    /// Training loss of `logits` against the batch targets.
    pub fn loss(&self, logits: &Tensor, targets: &BatchTargets) -> Result<Tensor> {
        match (self.paradigm, targets) {
            (Paradigm::SequenceLabeling, BatchTargets::Tags { labels, mask, active }) => {
                masked_cross_entropy(logits, labels, mask, *active)
            }
            (Paradigm::SpanPointer, BatchTargets::Pointers { labels, mask, active }) => {
                masked_binary_cross_entropy(logits, labels, mask, *active * 2 * self.num_labels)
            }
            _ => candle_core::bail!("batch targets do not match the {} head", self.paradigm),
        }
    }
}

/// Mean negative log-likelihood over the active positions.
///
/// `logits`: `[b, l, c]`, `labels`: `[b, l]` u32, `mask`: `[b, l]` f32.
pub fn masked_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    mask: &Tensor,
    active: usize,
) -> Result<Tensor> {
    let (b, l, c) = logits.dims3()?;
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((b * l, c))?, D::Minus1)?;
    let picked = log_probs
        .gather(&labels.reshape((b * l, 1))?, 1)?
        .squeeze(1)?;
    let total = picked.mul(&mask.reshape(b * l)?)?.sum_all()?;
    total.affine(-1.0 / active.max(1) as f64, 0.0)
}

/// Mean binary cross entropy with logits over the active positions, in the
/// numerically stable form `max(x, 0) - x * z + ln(1 + exp(-|x|))`.
///
/// `logits` and `labels`: `[b, l, k]`, `mask`: `[b, l]` f32.
pub fn masked_binary_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    mask: &Tensor,
    active: usize,
) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = logits.relu()?.sub(&logits.mul(labels)?)?.add(&softplus)?;
    let total = loss.broadcast_mul(&mask.unsqueeze(2)?)?.sum_all()?;
    total.affine(1.0 / active.max(1) as f64, 0.0)
}

/// Decode the logits of one example into token spans.
///
/// `logits` rows past `active.len()` are ignored.
pub fn decode_logits(
    labels: &LabelSpace,
    logits: &[Vec<f32>],
    active: &[bool],
    pointer_threshold: f32,
) -> Vec<Span> {
    match labels.paradigm() {
        Paradigm::SequenceLabeling => {
            let tags: Vec<Option<u32>> = logits
                .iter()
                .zip(active)
                .map(|(row, &on)| if on { argmax(row) } else { None })
                .collect();
            decode_bio(&tags, labels.id2label())
        }
        Paradigm::SpanPointer => {
            let n = labels.num_labels();
            let (starts, ends): (Vec<Vec<f32>>, Vec<Vec<f32>>) = logits
                .iter()
                .map(|row| {
                    let (start, end) = row.split_at(n.min(row.len()));
                    (start.to_vec(), end.to_vec())
                })
                .unzip();
            decode_pointer(&starts, &ends, active, labels.columns(), pointer_threshold)
        }
    }
}

fn argmax(row: &[f32]) -> Option<u32> {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use slotfill_core::IdMap;

    fn roles() -> IdMap {
        IdMap::from_pairs([("owner", 0), ("value", 1)]).unwrap()
    }

    #[test]
    fn test_head_width() {
        let tagging = Paradigm::SequenceLabeling.label_space(&roles()).unwrap();
        let pointer = Paradigm::SpanPointer.label_space(&roles()).unwrap();
        assert_eq!(head_width(&tagging), 5);
        assert_eq!(head_width(&pointer), 4);
    }

    #[test]
    fn test_cross_entropy_ignores_masked() -> Result<()> {
        let device = Device::Cpu;
        // Uniform logits over 4 classes: every active position costs ln 4.
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let labels = Tensor::new(&[[1u32, 2, 0]], &device)?;
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device)?;

        let loss = masked_cross_entropy(&logits, &labels, &mask, 2)?.to_scalar::<f32>()?;
        assert!((loss - 4f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_binary_cross_entropy_zero_logits() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 2), DType::F32, &device)?;
        let labels = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0]]], &device)?;
        let mask = Tensor::new(&[[1f32, 0.0]], &device)?;

        let loss = masked_binary_cross_entropy(&logits, &labels, &mask, 2)?.to_scalar::<f32>()?;
        assert!((loss - 2f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_decode_tagging_logits() {
        let space = Paradigm::SequenceLabeling.label_space(&roles()).unwrap();
        let row = |hot: usize| {
            let mut r = vec![0.0; 5];
            r[hot] = 3.0;
            r
        };
        let logits = vec![row(1), row(1), row(2), row(0), row(3)];
        let active = [false, true, true, true, true];

        let spans = decode_logits(&space, &logits, &active, 0.5);
        assert_eq!(
            spans,
            vec![Span::new("owner", 1, 3), Span::new("value", 4, 5)]
        );
    }

    #[test]
    fn test_decode_pointer_logits() {
        let space = Paradigm::SpanPointer.label_space(&roles()).unwrap();
        // [start_owner, start_value, end_owner, end_value]
        let logits = vec![
            vec![4.0, -4.0, -4.0, -4.0],
            vec![-4.0, -4.0, 4.0, -4.0],
        ];
        let spans = decode_logits(&space, &logits, &[true, true], 0.5);
        assert_eq!(spans, vec![Span::new("owner", 0, 2)]);
    }

    #[test]
    fn test_decode_pointer_logits_gapped_ids() {
        let roles = IdMap::from_pairs([("owner", 0), ("month", 5)]).unwrap();
        let space = Paradigm::SpanPointer.label_space(&roles).unwrap();
        // [start_owner, start_month, end_owner, end_month]
        let logits = vec![
            vec![-4.0, 4.0, -4.0, -4.0],
            vec![-4.0, -4.0, -4.0, 4.0],
            vec![-4.0, 4.0, -4.0, -4.0],
        ];
        let spans = decode_logits(&space, &logits, &[true, true, true], 0.5);
        assert_eq!(spans, vec![Span::new("month", 0, 2)]);
    }
}
