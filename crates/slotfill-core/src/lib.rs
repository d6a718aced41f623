//! # Slotfill Core
//!
//! Framework-free building blocks of the slot filling pipeline: marker token
//! vocabularies, paradigm-dependent label spaces, marker formatting of
//! utterances, span decoding and span-level scoring.
//!
//! ## Quick Start
//!
//! ```rust
//! use slotfill_core::{IdMap, Paradigm, build_markers};
//!
//! let types = IdMap::from_pairs([("PER", 0), ("ORG", 1)]).unwrap();
//! let markers = build_markers(&types).unwrap();
//! assert_eq!(markers.tokens().len(), 10);
//!
//! let roles = IdMap::from_pairs([("owner", 0), ("value", 1)]).unwrap();
//! let space = Paradigm::SequenceLabeling.label_space(&roles).unwrap();
//! assert_eq!(space.num_labels(), 5);
//! assert_eq!(space.id2label().get(1), Some("B-owner"));
//! ```
pub mod error;
pub mod format;
pub mod metric;
pub mod spans;
pub mod vocab;

// Re-export primary API
pub use error::{Result, SlotFillError};
pub use format::{FormattedText, Mention, format_with_markers};
pub use metric::{SpanMetrics, compute_span_f1};
pub use spans::{Span, decode_bio, decode_pointer};
pub use vocab::{
    IdMap, LabelNames, LabelSpace, MarkerPair, MarkerSet, Paradigm, Tag, build_markers, expand_bio,
};
