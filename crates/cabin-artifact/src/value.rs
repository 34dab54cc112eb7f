//! Canonical metadata values
//!
//! Engine-defined `config`, `context`, `metadata` and `evidence` maps are
//! modelled as [`MetaMap`], an ordered map over the closed [`MetaValue`]
//! variant. Keys serialize in sorted order, so hashing a map is reproducible
//! regardless of how it was built.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Ordered string-keyed metadata map
pub type MetaMap = BTreeMap<String, MetaValue>;

/// A metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// JSON `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Integer that fits in `i64`
    Int(i64),
    /// Any other finite number
    ///
    /// Build through [`MetaValue::float`] or `From<f64>`; JSON has no
    /// spelling for NaN or infinity, so those never round-trip.
    Float(#[serde(deserialize_with = "finite")] f64),
    /// UTF-8 string
    String(String),
    /// Ordered sequence
    List(Vec<MetaValue>),
    /// Nested ordered map
    Map(MetaMap),
}

impl MetaValue {
    /// A float value, or [`MetaValue::Null`] when `value` is not finite
    #[must_use]
    pub fn float(value: f64) -> Self {
        if value.is_finite() {
            Self::Float(value)
        } else {
            Self::Null
        }
    }

    /// Borrow as string if this is a string value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as map if this is a map value
    #[must_use]
    pub fn as_map(&self) -> Option<&MetaMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Canonical JSON bytes of this value
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Convert arbitrary JSON into a metadata value
    ///
    /// Numbers that fit in `i64` become [`MetaValue::Int`]; everything else
    /// numeric becomes [`MetaValue::Float`].
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::float),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for MetaValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<MetaMap> for MetaValue {
    fn from(value: MetaMap) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<MetaValue>> From<Vec<T>> for MetaValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

fn finite<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(D::Error::custom("metadata numbers must be finite"))
    }
}

/// Build a [`MetaMap`] from key/value pairs
pub fn meta_map<K, V, I>(pairs: I) -> MetaMap
where
    K: Into<String>,
    V: Into<MetaValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
