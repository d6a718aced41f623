pub mod id_map;
pub mod labels;
pub mod markers;

pub use id_map::{IdMap, LabelNames};
pub use labels::{LabelSpace, OUTSIDE, Paradigm, Tag, expand_bio};
pub use markers::{MarkerPair, MarkerSet, build_markers};
