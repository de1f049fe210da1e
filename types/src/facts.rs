//! Sticky facts: a small categorized memory distilled from the conversation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The fixed set of fact categories.
///
/// Declaration order is the order facts are rendered in prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Goal,
    Constraints,
    Preferences,
    Decisions,
    Agreements,
}

impl FactCategory {
    pub const ALL: [FactCategory; 5] = [
        FactCategory::Goal,
        FactCategory::Constraints,
        FactCategory::Preferences,
        FactCategory::Decisions,
        FactCategory::Agreements,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FactCategory::Goal => "goal",
            FactCategory::Constraints => "constraints",
            FactCategory::Preferences => "preferences",
            FactCategory::Decisions => "decisions",
            FactCategory::Agreements => "agreements",
        }
    }
}

impl fmt::Display for FactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactCategory {
    type Err = FactParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| FactParseError::UnknownCategory(s.to_string()))
    }
}

/// A category's value: a single statement, or keyed entries (used by `decisions`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Text(String),
    Entries(BTreeMap<String, String>),
}

impl FactValue {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            FactValue::Text(text) => text.trim().is_empty(),
            FactValue::Entries(entries) => entries.is_empty(),
        }
    }

    /// Number of individual facts this value holds.
    #[must_use]
    pub fn fact_count(&self) -> usize {
        match self {
            FactValue::Text(text) if text.trim().is_empty() => 0,
            FactValue::Text(_) => 1,
            FactValue::Entries(entries) => entries.len(),
        }
    }

    /// Converts loosely typed model output into a value.
    ///
    /// Strings stay text, objects become entries (non-string leaves are
    /// stringified), arrays are joined with `"; "`. `null` yields `None`.
    fn from_json(value: Value) -> Option<Self> {
        let parsed = match value {
            Value::Null => return None,
            Value::String(text) => FactValue::Text(text.trim().to_string()),
            Value::Object(map) => FactValue::Entries(
                map.into_iter()
                    .filter_map(|(key, leaf)| scalar_text(leaf).map(|text| (key, text)))
                    .collect(),
            ),
            Value::Array(items) => FactValue::Text(
                items
                    .into_iter()
                    .filter_map(scalar_text)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            other => FactValue::Text(other.to_string()),
        };
        (!parsed.is_empty()).then_some(parsed)
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let text = text.trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        other => Some(other.to_string()),
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Text(text) => f.write_str(text),
            FactValue::Entries(entries) => {
                let mut first = true;
                for (key, value) in entries {
                    if !first {
                        f.write_str("; ")?;
                    }
                    first = false;
                    write!(f, "{key}: {value}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactParseError {
    #[error("fact sheet must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("unknown fact category: {0}")]
    UnknownCategory(String),
}

/// One persisted fact row: `(category, key, value)`. Text facts have no key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRow {
    pub category: FactCategory,
    pub key: Option<String>,
    pub value: String,
}

/// The complete fact store for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactSheet(BTreeMap<FactCategory, FactValue>);

impl FactSheet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a model-produced JSON object.
    ///
    /// Unknown categories are ignored, as are empty or `null` values. The
    /// result is always a complete sheet, never a patch.
    pub fn from_json(value: Value) -> Result<Self, FactParseError> {
        let Value::Object(map) = value else {
            return Err(FactParseError::NotAnObject(json_kind(&value)));
        };
        let mut sheet = BTreeMap::new();
        for (name, raw) in map {
            let Ok(category) = name.parse::<FactCategory>() else {
                continue;
            };
            if let Some(value) = FactValue::from_json(raw) {
                sheet.insert(category, value);
            }
        }
        Ok(Self(sheet))
    }

    pub fn insert(&mut self, category: FactCategory, value: FactValue) {
        if value.is_empty() {
            self.0.remove(&category);
        } else {
            self.0.insert(category, value);
        }
    }

    #[must_use]
    pub fn get(&self, category: FactCategory) -> Option<&FactValue> {
        self.0.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactCategory, &FactValue)> {
        self.0.iter().map(|(category, value)| (*category, value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(FactValue::is_empty)
    }

    /// Total individual facts, counting each keyed entry separately.
    #[must_use]
    pub fn total_facts(&self) -> usize {
        self.0.values().map(FactValue::fact_count).sum()
    }

    /// Facts present in `self` that `next` no longer carries.
    ///
    /// Returns `category` for a dropped category and `category.key` for a
    /// dropped keyed entry. Changed values are not losses.
    #[must_use]
    pub fn losses_in(&self, next: &FactSheet) -> Vec<String> {
        let mut lost = Vec::new();
        for (category, value) in self.iter().filter(|(_, value)| !value.is_empty()) {
            match (value, next.get(category)) {
                (_, None) => lost.push(category.to_string()),
                (_, Some(after)) if after.is_empty() => lost.push(category.to_string()),
                (FactValue::Entries(before), Some(FactValue::Entries(after))) => {
                    lost.extend(
                        before
                            .keys()
                            .filter(|key| !after.contains_key(*key))
                            .map(|key| format!("{category}.{key}")),
                    );
                }
                // Keyed entries collapsed into prose drop every key.
                (FactValue::Entries(before), Some(FactValue::Text(_))) => {
                    lost.extend(before.keys().map(|key| format!("{category}.{key}")));
                }
                (FactValue::Text(_), Some(_)) => {}
            }
        }
        lost
    }

    /// Prompt addendum listing every non-empty category, or `""` when empty.
    #[must_use]
    pub fn render_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = self
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(category, value)| format!("- {category}: {value}"))
            .collect();
        format!("\n\nKEY FACTS FROM CONVERSATION:\n{}", lines.join("\n"))
    }

    /// Pretty JSON of the sheet, `{}` when empty.
    #[must_use]
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    #[must_use]
    pub fn to_rows(&self) -> Vec<FactRow> {
        let mut rows = Vec::new();
        for (category, value) in self.iter() {
            match value {
                FactValue::Text(text) if !text.trim().is_empty() => rows.push(FactRow {
                    category,
                    key: None,
                    value: text.clone(),
                }),
                FactValue::Text(_) => {}
                FactValue::Entries(entries) => {
                    rows.extend(entries.iter().map(|(key, value)| FactRow {
                        category,
                        key: Some(key.clone()),
                        value: value.clone(),
                    }));
                }
            }
        }
        rows
    }

    /// Rebuilds a sheet from persisted rows; keyed rows collect into entries.
    #[must_use]
    pub fn from_rows(rows: impl IntoIterator<Item = FactRow>) -> Self {
        let mut sheet: BTreeMap<FactCategory, FactValue> = BTreeMap::new();
        for row in rows {
            match row.key {
                None => {
                    sheet.insert(row.category, FactValue::Text(row.value));
                }
                Some(key) => {
                    let slot = sheet
                        .entry(row.category)
                        .or_insert_with(|| FactValue::Entries(BTreeMap::new()));
                    if let FactValue::Entries(entries) = slot {
                        entries.insert(key, row.value);
                    } else {
                        *slot = FactValue::Entries(BTreeMap::from([(key, row.value)]));
                    }
                }
            }
        }
        Self(sheet)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
