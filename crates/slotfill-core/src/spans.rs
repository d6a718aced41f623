//! # Span Decoding
//!
//! Turns per-token model outputs back into labeled spans, for both
//! paradigms. Positions are token indices, `end` exclusive.

use serde::{Deserialize, Serialize};

use crate::vocab::{LabelNames, Tag};

/// A labeled span.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub role: String,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(role: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            role: role.into(),
            start,
            end,
        }
    }
}

/// Decode BIO tag ids into spans.
///
/// `None` marks ignored positions (special and marker tokens); they neither
/// open nor close a span. An `I-r` that does not continue an `r` span opens a
/// new one. Unknown ids decode as `O`.
pub fn decode_bio(tags: &[Option<u32>], id2label: &LabelNames) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Option<Span> = None;

    for (i, id) in tags.iter().enumerate() {
        let Some(id) = id else {
            continue;
        };
        let tag = id2label
            .get(*id)
            .and_then(Tag::parse)
            .unwrap_or(Tag::Outside);

        match tag {
            Tag::Inside(role) if current.as_ref().is_some_and(|s| s.role == role) => {
                if let Some(span) = current.as_mut() {
                    span.end = i + 1;
                }
            }
            Tag::Begin(role) | Tag::Inside(role) => {
                spans.extend(current.take());
                current = Some(Span::new(role, i, i + 1));
            }
            Tag::Outside => spans.extend(current.take()),
        }
    }
    spans.extend(current);

    spans
}

/// Decode per-token, per-role start/end logits into spans.
///
/// Column `r` of each row belongs to `roles[r]`. Every active position whose
/// start probability reaches `threshold` is paired with the nearest active
/// position at or after it whose end probability for the same role reaches
/// `threshold`; a start without such an end yields nothing.
pub fn decode_pointer(
    start_logits: &[Vec<f32>],
    end_logits: &[Vec<f32>],
    active: &[bool],
    roles: &[String],
    threshold: f32,
) -> Vec<Span> {
    let len = start_logits.len().min(end_logits.len()).min(active.len());
    let mut spans = Vec::new();

    for (r, role) in roles.iter().enumerate() {
        let fires = |logits: &[Vec<f32>], i: usize| {
            active[i] && logits[i].get(r).is_some_and(|&x| sigmoid(x) >= threshold)
        };

        for start in 0..len {
            if !fires(start_logits, start) {
                continue;
            }
            if let Some(end) = (start..len).find(|&j| fires(end_logits, j)) {
                spans.push(Span::new(role.as_str(), start, end + 1));
            }
        }
    }

    spans.sort();
    spans
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
