//! # Label Spaces
//!
//! The supervision label space depends on the output paradigm. Per-token
//! tagging expands every role into `B-`/`I-` tags plus `O`; span pointing
//! keeps the role map as is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SlotFillError};
use crate::vocab::{IdMap, LabelNames};

/// Name of the outside label.
pub const OUTSIDE: &str = "O";

/// A BIO tag over an open set of roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    Begin(String),
    Inside(String),
    Outside,
}

impl Tag {
    /// Parse a label name such as `B-owner`, `I-owner` or `O`.
    pub fn parse(label: &str) -> Option<Self> {
        if label == OUTSIDE {
            return Some(Tag::Outside);
        }
        if let Some(role) = label.strip_prefix("B-") {
            return Some(Tag::Begin(role.to_string()));
        }
        label
            .strip_prefix("I-")
            .map(|role| Tag::Inside(role.to_string()))
    }

    /// Role carried by the tag, `None` for `O`.
    pub fn role(&self) -> Option<&str> {
        match self {
            Tag::Begin(role) | Tag::Inside(role) => Some(role),
            Tag::Outside => None,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, Tag::Begin(_))
    }

    pub fn is_inside(&self) -> bool {
        matches!(self, Tag::Inside(_))
    }

    /// `I-r` may only follow `B-r` or `I-r`; everything else is allowed.
    pub fn is_valid_transition(from: &Tag, to: &Tag) -> bool {
        match to {
            Tag::Inside(role) => from.role() == Some(role.as_str()),
            _ => true,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Begin(role) => write!(f, "B-{role}"),
            Tag::Inside(role) => write!(f, "I-{role}"),
            Tag::Outside => f.write_str(OUTSIDE),
        }
    }
}

/// Expand a role map into a BIO label map.
///
/// `O` gets id 0; roles are visited in ascending original id and each gets
/// the next two ids, `B-<role>` then `I-<role>`.
pub fn expand_bio(role2id: &IdMap) -> Result<IdMap> {
    if role2id.is_empty() {
        return Err(SlotFillError::config("role map is empty"));
    }

    let mut labels = Vec::with_capacity(2 * role2id.len() + 1);
    labels.push(Tag::Outside.to_string());
    for (role, _) in role2id.by_id() {
        labels.push(Tag::Begin(role.to_string()).to_string());
        labels.push(Tag::Inside(role.to_string()).to_string());
    }

    IdMap::from_pairs(labels.into_iter().zip(0u32..))
}

/// Output formulation of the slot filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    /// One BIO tag per token.
    #[default]
    SequenceLabeling,
    /// Per-role start and end pointers per token.
    SpanPointer,
}

impl Paradigm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Paradigm::SequenceLabeling => "sequence_labeling",
            Paradigm::SpanPointer => "span_pointer",
        }
    }

    /// Build the label space this paradigm trains against.
    pub fn label_space(self, role2id: &IdMap) -> Result<LabelSpace> {
        let label2id = match self {
            Paradigm::SequenceLabeling => expand_bio(role2id)?,
            Paradigm::SpanPointer => {
                if role2id.is_empty() {
                    return Err(SlotFillError::config("role map is empty"));
                }
                role2id.clone()
            }
        };
        let id2label = label2id.invert()?;
        let columns = label2id
            .by_id()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();

        debug!(paradigm = %self, num_labels = label2id.len(), "built label space");
        Ok(LabelSpace {
            paradigm: self,
            label2id,
            id2label,
            columns,
        })
    }
}

impl fmt::Display for Paradigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Paradigm {
    type Err = SlotFillError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequence_labeling" => Ok(Paradigm::SequenceLabeling),
            "span_pointer" => Ok(Paradigm::SpanPointer),
            other => Err(SlotFillError::config(format!(
                "unknown paradigm {other:?}, expected sequence_labeling or span_pointer"
            ))),
        }
    }
}

/// The active label map of a run and its inverse.
///
/// Role ids need not be contiguous, so the classification head is laid out
/// by `columns`: label names in ascending id order, one per output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSpace {
    paradigm: Paradigm,
    label2id: IdMap,
    id2label: LabelNames,
    columns: Vec<String>,
}

impl LabelSpace {
    pub fn paradigm(&self) -> Paradigm {
        self.paradigm
    }

    pub fn label2id(&self) -> &IdMap {
        &self.label2id
    }

    pub fn id2label(&self) -> &LabelNames {
        &self.id2label
    }

    /// Width of the classification head.
    pub fn num_labels(&self) -> usize {
        self.label2id.len()
    }

    /// Id of the `B-`/`I-` tag of `role` (sequence labeling) or of `role`
    /// itself (span pointer).
    pub fn role_id(&self, role: &str, inside: bool) -> Option<u32> {
        match self.paradigm {
            Paradigm::SequenceLabeling => {
                let tag = if inside {
                    Tag::Inside(role.to_string())
                } else {
                    Tag::Begin(role.to_string())
                };
                self.label2id.get(&tag.to_string())
            }
            Paradigm::SpanPointer => self.label2id.get(role),
        }
    }

    /// Label names in head column order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Head column of `label`. For span pointing this is the role's rank
    /// among the role ids, not the id itself.
    pub fn column(&self, label: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == label)
    }

    /// Id of the outside label, if this space has one.
    pub fn outside_id(&self) -> Option<u32> {
        match self.paradigm {
            Paradigm::SequenceLabeling => self.label2id.get(OUTSIDE),
            Paradigm::SpanPointer => None,
        }
    }
}
