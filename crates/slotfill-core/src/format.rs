//! # Marker Formatting
//!
//! Wraps annotated mentions of an utterance in their marker tokens before
//! tokenization, keeping track of where every original character lands so
//! that slot annotations and predictions can move between the two texts.
//!
//! All offsets are character offsets, `end` exclusive.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlotFillError};
use crate::vocab::MarkerSet;
use crate::vocab::markers::ENTITY;

/// An annotated mention to be wrapped in markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub start: usize,
    pub end: usize,
    /// Marker category: an entity type name or one of the fixed categories.
    /// Unknown categories fall back to the generic entity markers.
    pub category: String,
}

/// Text with markers inserted and the original-to-formatted offset map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedText {
    text: String,
    /// Formatted character index of every original character.
    positions: Vec<usize>,
}

impl FormattedText {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of characters of the original text.
    pub fn original_len(&self) -> usize {
        self.positions.len()
    }

    /// Project an original `[start, end)` span onto the formatted text.
    pub fn project(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        if start >= end || end > self.positions.len() {
            return None;
        }
        Some((self.positions[start], self.positions[end - 1] + 1))
    }

    /// Original span covered by a formatted `[start, end)` span. Marker
    /// characters have no original counterpart and are dropped.
    pub fn original_span(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let from = self.positions.partition_point(|&p| p < start);
        let to = self.positions.partition_point(|&p| p < end);
        (from < to).then_some((from, to))
    }
}

/// Insert the marker pair of every mention around it.
pub fn format_with_markers(
    text: &str,
    mentions: &[Mention],
    markers: &MarkerSet,
) -> Result<FormattedText> {
    let chars: Vec<char> = text.chars().collect();

    let mut ordered: Vec<&Mention> = mentions.iter().collect();
    ordered.sort_by_key(|m| (m.start, m.end));

    let mut previous_end = 0;
    for mention in &ordered {
        if mention.start >= mention.end || mention.end > chars.len() {
            return Err(SlotFillError::data(format!(
                "mention [{}, {}) is out of range for a text of {} characters",
                mention.start,
                mention.end,
                chars.len()
            )));
        }
        if mention.start < previous_end {
            return Err(SlotFillError::data(format!(
                "mention [{}, {}) overlaps a previous mention",
                mention.start, mention.end
            )));
        }
        previous_end = mention.end;
    }

    let generic = markers
        .get(ENTITY)
        .ok_or_else(|| SlotFillError::config("marker set has no generic entity markers"))?;

    let mut out = String::with_capacity(text.len() + 16 * ordered.len());
    let mut count = 0usize;
    let mut positions = Vec::with_capacity(chars.len());
    let mut pending = ordered.iter().peekable();
    let mut open: Option<(&Mention, &str)> = None;

    let push = |out: &mut String, s: &str, count: &mut usize| {
        out.push_str(s);
        *count += s.chars().count();
    };

    for (i, c) in chars.iter().enumerate() {
        if let Some((mention, close)) = open {
            if mention.end == i {
                push(&mut out, " ", &mut count);
                push(&mut out, close, &mut count);
                open = None;
            }
        }
        if let Some(mention) = pending.next_if(|m| m.start == i) {
            let pair = markers.get(&mention.category).unwrap_or(generic);
            push(&mut out, &pair.open, &mut count);
            push(&mut out, " ", &mut count);
            open = Some((*mention, pair.close.as_str()));
        }
        positions.push(count);
        out.push(*c);
        count += 1;
    }
    if let Some((_, close)) = open {
        push(&mut out, " ", &mut count);
        push(&mut out, close, &mut count);
    }

    Ok(FormattedText {
        text: out,
        positions,
    })
}
