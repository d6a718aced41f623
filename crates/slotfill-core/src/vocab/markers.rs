//! # Marker Tokens
//!
//! Marker tokens delimit spans of interest in the text fed to the encoder.
//! Every entity type gets an indexed pair (`<entity_3>` / `</entity_3>`);
//! three fixed categories get literal pairs.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{Result, SlotFillError};
use crate::vocab::IdMap;

/// Fixed category for slot spans.
pub const SLOT: &str = "slot";
/// Fixed category for user turns.
pub const USER: &str = "user";
/// Fixed category for untyped entity mentions.
pub const ENTITY: &str = "entity";

/// The fixed categories, in the order they are appended.
pub const FIXED_CATEGORIES: [&str; 3] = [SLOT, USER, ENTITY];

/// An opening and closing marker token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerPair {
    pub open: String,
    pub close: String,
}

impl MarkerPair {
    fn tagged(name: &str) -> Self {
        Self {
            open: format!("<{name}>"),
            close: format!("</{name}>"),
        }
    }
}

/// Category key to marker pair, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    categories: Vec<(String, MarkerPair)>,
}

impl MarkerSet {
    /// Number of categories.
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Marker pair for a category key.
    pub fn get(&self, category: &str) -> Option<&MarkerPair> {
        self.categories
            .iter()
            .find(|(key, _)| key == category)
            .map(|(_, pair)| pair)
    }

    /// Categories in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MarkerPair)> {
        self.categories.iter().map(|(key, pair)| (key.as_str(), pair))
    }

    /// Flatten into the list of tokens to add to the tokenizer vocabulary:
    /// categories in order, open before close.
    pub fn tokens(&self) -> Vec<String> {
        self.categories
            .iter()
            .flat_map(|(_, pair)| [pair.open.clone(), pair.close.clone()])
            .collect()
    }
}

/// Build the marker set for a type map.
///
/// Type categories come first in ascending id order, followed by
/// [`FIXED_CATEGORIES`].
pub fn build_markers(type2id: &IdMap) -> Result<MarkerSet> {
    if type2id.is_empty() {
        return Err(SlotFillError::config("type map is empty"));
    }

    let mut seen_ids = HashSet::new();
    let mut categories = Vec::with_capacity(type2id.len() + FIXED_CATEGORIES.len());

    for (name, id) in type2id.by_id() {
        if FIXED_CATEGORIES.contains(&name) {
            return Err(SlotFillError::config(format!(
                "entity type {name:?} clashes with a fixed marker category"
            )));
        }
        if !seen_ids.insert(id) {
            return Err(SlotFillError::config(format!(
                "entity type id {id} is used more than once"
            )));
        }
        categories.push((name.to_string(), MarkerPair::tagged(&format!("entity_{id}"))));
    }

    for name in FIXED_CATEGORIES {
        categories.push((name.to_string(), MarkerPair::tagged(name)));
    }

    debug!(categories = categories.len(), "built marker set");
    Ok(MarkerSet { categories })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(pairs: &[(&str, u32)]) -> IdMap {
        IdMap::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn test_markers_for_two_types() {
        let markers = build_markers(&types(&[("PER", 0), ("ORG", 1)])).unwrap();

        let keys: Vec<_> = markers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["PER", "ORG", "slot", "user", "entity"]);
        assert_eq!(
            markers.tokens(),
            [
                "<entity_0>",
                "</entity_0>",
                "<entity_1>",
                "</entity_1>",
                "<slot>",
                "</slot>",
                "<user>",
                "</user>",
                "<entity>",
                "</entity>",
            ]
        );
        assert_eq!(markers.get("ORG").unwrap().open, "<entity_1>");
        assert_eq!(markers.get("user").unwrap().close, "</user>");
        assert!(markers.get("LOC").is_none());
    }

    #[test]
    fn test_marker_tokens_distinct() {
        let map = IdMap::from_pairs((0..40).map(|i| (format!("type{i}"), i * 3))).unwrap();
        let markers = build_markers(&map).unwrap();
        let tokens = markers.tokens();

        assert_eq!(markers.len(), 43);
        assert_eq!(tokens.len(), 86);
        let unique: HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), tokens.len());
    }

    #[test]
    fn test_empty_type_map_rejected() {
        let err = build_markers(&IdMap::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = build_markers(&types(&[("PER", 2), ("ORG", 2)])).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_reserved_category_rejected() {
        let err = build_markers(&types(&[("PER", 0), ("user", 1)])).unwrap_err();
        assert!(err.is_configuration());
    }
}
