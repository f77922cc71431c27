//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "02-model"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Recursive configuration value model shared by variables and outputs."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Module variables and exported outputs are arbitrarily nested (products map
//! to attribute tables, APIs map to operation tables). [`VarValue`] models
//! them as a recursive sum type so builders and validators can walk any depth
//! without reflection, and so the same value can be written as a
//! `*.tfvars.json` file and parsed back from `terraform output -json`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping of configuration keys to values.
pub type VarMap = IndexMap<String, VarValue>;

/// Leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Explicit null (Terraform `null`).
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Whole number. Listed before `Float` so integers stay integral.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

/// Recursive configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    /// Leaf value.
    Scalar(Scalar),
    /// Ordered sequence.
    List(Vec<VarValue>),
    /// Nested mapping with insertion order preserved.
    Mapping(VarMap),
}

impl VarValue {
    /// Shorthand for a text scalar.
    pub fn text(value: impl Into<String>) -> Self {
        VarValue::Scalar(Scalar::Text(value.into()))
    }

    /// Build a mapping from key/value pairs, keeping their order.
    pub fn mapping<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<VarValue>,
    {
        VarValue::Mapping(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Build a list from anything convertible into values.
    pub fn list<V: Into<VarValue>>(items: impl IntoIterator<Item = V>) -> Self {
        VarValue::List(items.into_iter().map(Into::into).collect())
    }

    /// Text content when this is a text scalar.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            VarValue::Scalar(Scalar::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Nested mapping when this is a mapping.
    pub fn as_mapping(&self) -> Option<&VarMap> {
        match self {
            VarValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a direct child of a mapping.
    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.as_mapping().and_then(|map| map.get(key))
    }

    /// Walk nested mappings following `path`.
    pub fn get_path(&self, path: &[&str]) -> Option<&VarValue> {
        path.iter().try_fold(self, |current, key| current.get(key))
    }

    /// Whether the value carries no content: null, blank text, or an empty collection.
    pub fn is_empty(&self) -> bool {
        match self {
            VarValue::Scalar(Scalar::Null) => true,
            VarValue::Scalar(Scalar::Text(text)) => text.trim().is_empty(),
            VarValue::Scalar(_) => false,
            VarValue::List(items) => items.is_empty(),
            VarValue::Mapping(map) => map.is_empty(),
        }
    }

    /// String form used for substring and equality comparisons.
    ///
    /// Text renders verbatim, other scalars with their natural formatting, and
    /// collections as compact JSON.
    pub fn render(&self) -> String {
        match self {
            VarValue::Scalar(Scalar::Null) => String::new(),
            VarValue::Scalar(Scalar::Bool(flag)) => flag.to_string(),
            VarValue::Scalar(Scalar::Int(number)) => number.to_string(),
            VarValue::Scalar(Scalar::Float(number)) => number.to_string(),
            VarValue::Scalar(Scalar::Text(text)) => text.clone(),
            VarValue::List(_) | VarValue::Mapping(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Depth of the deepest nesting level; scalars are depth zero.
    pub fn depth(&self) -> usize {
        match self {
            VarValue::Scalar(_) => 0,
            VarValue::List(items) => 1 + items.iter().map(VarValue::depth).max().unwrap_or(0),
            VarValue::Mapping(map) => 1 + map.values().map(VarValue::depth).max().unwrap_or(0),
        }
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::text(value)
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::text(value)
    }
}

impl From<&String> for VarValue {
    fn from(value: &String) -> Self {
        VarValue::text(value.clone())
    }
}

impl From<bool> for VarValue {
    fn from(value: bool) -> Self {
        VarValue::Scalar(Scalar::Bool(value))
    }
}

impl From<i64> for VarValue {
    fn from(value: i64) -> Self {
        VarValue::Scalar(Scalar::Int(value))
    }
}

impl From<u32> for VarValue {
    fn from(value: u32) -> Self {
        VarValue::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Scalar(Scalar::Float(value))
    }
}

impl From<VarMap> for VarValue {
    fn from(value: VarMap) -> Self {
        VarValue::Mapping(value)
    }
}

impl<V: Into<VarValue>> From<Vec<V>> for VarValue {
    fn from(value: Vec<V>) -> Self {
        VarValue::list(value)
    }
}
