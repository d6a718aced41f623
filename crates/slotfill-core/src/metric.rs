//! Span-level precision, recall and F1.

use std::collections::HashMap;

use serde::Serialize;

use crate::spans::Span;

/// Micro-averaged span scores over a set of examples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpanMetrics {
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub predicted: usize,
    pub gold: usize,
    pub correct: usize,
}

/// Compare predicted and gold spans example by example. A predicted span is
/// correct when an unmatched gold span has the same role and bounds.
pub fn compute_span_f1(preds: &[Vec<Span>], golds: &[Vec<Span>]) -> SpanMetrics {
    let mut predicted = 0;
    let mut gold = 0;
    let mut correct = 0;

    for (pred, truth) in preds.iter().zip(golds) {
        predicted += pred.len();
        gold += truth.len();

        let mut remaining: HashMap<&Span, usize> = HashMap::new();
        for span in truth {
            *remaining.entry(span).or_default() += 1;
        }
        for span in pred {
            if let Some(count) = remaining.get_mut(span).filter(|c| **c > 0) {
                *count -= 1;
                correct += 1;
            }
        }
    }

    let precision = ratio(correct, predicted);
    let recall = ratio(correct, gold);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    SpanMetrics {
        precision,
        recall,
        f1,
        predicted,
        gold,
        correct,
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 { 0.0 } else { num as f32 / den as f32 }
}
