use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Values pulled for one field by a single extract pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedField {
    pub name: String,
    pub values: Vec<String>,
}

impl ExtractedField {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// One output record. Column order is the plan's field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(IndexMap<String, String>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Zip per-field value lists into rows, padding short lists with "".
///
/// The longest list decides the row count; every row carries every field.
pub fn materialize(fields: &[ExtractedField]) -> Vec<Row> {
    let row_count = fields.iter().map(|f| f.values.len()).max().unwrap_or(0);

    (0..row_count)
        .map(|i| {
            fields
                .iter()
                .map(|f| {
                    let value = f.values.get(i).map(String::as_str).unwrap_or("");
                    (f.name.as_str(), value)
                })
                .collect()
        })
        .collect()
}
