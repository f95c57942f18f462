use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Every task must request a worker pool through this dimension.
pub const DIMENSION_POOL_KEY: &str = "pool";

/// Capability requirements of a task: a set of `key:value` tags a worker
/// must all carry. Matching is subset inclusion against the worker's tags.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Dimensions(BTreeMap<String, String>);

/// Capabilities a worker advertises. A worker may carry several values per
/// key (e.g. every OS version label it is compatible with).
pub type BotDimensions = BTreeMap<String, BTreeSet<String>>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DimensionError {
    #[error("dimension {0:?} is not of the form key:value")]
    Malformed(String),
    #[error("dimension key {0:?} given twice")]
    Duplicate(String),
}

impl Dimensions {
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, DimensionError> {
        let mut map = BTreeMap::new();
        for entry in raw {
            let entry = entry.as_ref();
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| DimensionError::Malformed(entry.to_string()))?;
            if key.is_empty() || value.is_empty() {
                return Err(DimensionError::Malformed(entry.to_string()));
            }
            if map.insert(key.to_string(), value.to_string()).is_some() {
                return Err(DimensionError::Duplicate(key.to_string()));
            }
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The worker pool this task requests, if declared.
    pub fn pool(&self) -> Option<&str> {
        self.get(DIMENSION_POOL_KEY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when every requested `key:value` appears among the worker's
    /// advertised dimensions.
    pub fn satisfied_by(&self, bot: &BotDimensions) -> bool {
        self.0
            .iter()
            .all(|(k, v)| bot.get(k).map(|vals| vals.contains(v)).unwrap_or(false))
    }
}

impl TryFrom<Vec<String>> for Dimensions {
    type Error = DimensionError;

    fn try_from(raw: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Dimensions> for Vec<String> {
    fn from(dims: Dimensions) -> Vec<String> {
        dims.0.into_iter().map(|(k, v)| format!("{k}:{v}")).collect()
    }
}
