//! # Name/Id Maps
//!
//! Flat `name -> id` maps as stored in `type2id.json` and `role2id.json`,
//! and their `id -> name` inverses.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::path::Path;

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use tracing::debug;

use crate::error::{Result, SlotFillError};

/// A bijective-by-name mapping from label names to integer ids.
///
/// Names are unique by construction. Ids are not checked for uniqueness here;
/// [`IdMap::invert`] and the vocabulary builders reject duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    entries: BTreeMap<String, u32>,
}

impl IdMap {
    /// Load a map from a flat JSON object of string to non-negative integer.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SlotFillError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map: IdMap = serde_json::from_str(&raw).map_err(|source| SlotFillError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), entries = map.len(), "loaded id map");
        Ok(map)
    }

    /// Build a map from `(name, id)` pairs, rejecting empty or repeated names.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut entries = BTreeMap::new();
        for (name, id) in pairs {
            insert_unique(&mut entries, name.into(), id).map_err(SlotFillError::Configuration)?;
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of `name`, if present.
    pub fn get(&self, name: &str) -> Option<u32> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Entries in ascending id order, ties broken by name.
    pub fn by_id(&self) -> Vec<(&str, u32)> {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        pairs
    }

    /// Invert into an `id -> name` map.
    ///
    /// Fails if two names share an id.
    pub fn invert(&self) -> Result<LabelNames> {
        let mut names = BTreeMap::new();
        for (name, id) in self.iter() {
            if let Some(other) = names.insert(id, name.to_string()) {
                return Err(SlotFillError::config(format!(
                    "id {id} is assigned to both {other:?} and {name:?}"
                )));
            }
        }
        Ok(LabelNames { names })
    }
}

fn insert_unique(
    entries: &mut BTreeMap<String, u32>,
    name: String,
    id: u32,
) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("label names must not be empty".to_string());
    }
    match entries.entry(name) {
        Entry::Occupied(e) => Err(format!("duplicate name {:?}", e.key())),
        Entry::Vacant(e) => {
            e.insert(id);
            Ok(())
        }
    }
}

impl<'de> Deserialize<'de> for IdMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdMapVisitor;

        impl<'de> Visitor<'de> for IdMapVisitor {
            type Value = IdMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a flat object of label name to non-negative integer id")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<IdMap, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = BTreeMap::new();
                while let Some(name) = access.next_key::<String>()? {
                    let id = access.next_value::<u32>()?;
                    insert_unique(&mut entries, name, id).map_err(de::Error::custom)?;
                }
                Ok(IdMap { entries })
            }
        }

        deserializer.deserialize_map(IdMapVisitor)
    }
}

/// An `id -> name` map, the inverse of an [`IdMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelNames {
    names: BTreeMap<u32, String>,
}

impl LabelNames {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name for `id`, if present.
    pub fn get(&self, id: u32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Invert back into a `name -> id` map.
    ///
    /// Fails if two ids share a name.
    pub fn invert(&self) -> Result<IdMap> {
        IdMap::from_pairs(self.iter().map(|(id, name)| (name, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> std::result::Result<IdMap, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn test_parse_flat_object() {
        let map = parse(r#"{"PER": 0, "ORG": 1}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("ORG"), Some(1));
        assert_eq!(map.by_id(), vec![("PER", 0), ("ORG", 1)]);
    }

    #[test]
    fn test_parse_rejects_duplicate_names() {
        let err = parse(r#"{"PER": 0, "PER": 1}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate name"));
    }

    #[test]
    fn test_parse_rejects_non_integer_ids() {
        assert!(parse(r#"{"PER": 0.5}"#).is_err());
        assert!(parse(r#"{"PER": -1}"#).is_err());
        assert!(parse(r#"{"PER": "0"}"#).is_err());
        assert!(parse(r#"["PER"]"#).is_err());
    }

    #[test]
    fn test_from_path_reports_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("type2id.json");
        std::fs::write(&path, r#"{"PER": 0, "ORG": "x"}"#).unwrap();

        let err = IdMap::from_path(&path).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("type2id.json"));

        let missing = IdMap::from_path(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, SlotFillError::Io { .. }));
        assert!(missing.is_configuration());
    }

    #[test]
    fn test_invert_involution() {
        let map = IdMap::from_pairs([("owner", 0), ("value", 1), ("time", 7)]).unwrap();
        let names = map.invert().unwrap();
        assert_eq!(names.get(7), Some("time"));
        assert_eq!(names.invert().unwrap(), map);
    }

    #[test]
    fn test_label_names_invert_back() {
        let map = IdMap::from_pairs([("O", 0), ("B-owner", 1), ("I-owner", 2)]).unwrap();
        let names = map.invert().unwrap();
        let back = names.invert().unwrap();
        assert_eq!(back.get("I-owner"), Some(2));
        assert_eq!(back.by_id(), vec![("O", 0), ("B-owner", 1), ("I-owner", 2)]);
    }

    #[test]
    fn test_invert_rejects_shared_ids() {
        let map = IdMap::from_pairs([("owner", 0), ("value", 0)]).unwrap();
        assert!(map.invert().unwrap_err().is_configuration());
    }

    #[test]
    fn test_from_pairs_rejects_duplicates() {
        assert!(IdMap::from_pairs([("a", 0), ("a", 1)]).is_err());
        assert!(IdMap::from_pairs([("", 0)]).is_err());
    }
}
