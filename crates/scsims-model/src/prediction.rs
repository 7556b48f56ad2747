//! Prediction output table

use serde::{Deserialize, Serialize};
use std::fmt;

/// A predicted class, as an index or as a decoded label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Index(u32),
    Name(String),
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{}", i),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Top-3 classes for one sample, best first.
///
/// The `*_prob` names are kept for compatibility with existing outputs; the
/// columns hold classes, not probabilities. With fewer than three classes the
/// trailing columns are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub first_prob: LabelValue,
    pub second_prob: Option<LabelValue>,
    pub third_prob: Option<LabelValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_label: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionFrame {
    pub rows: Vec<PredictionRow>,
}

impl PredictionFrame {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_actual_label(&self) -> bool {
        self.rows.iter().any(|r| r.actual_label.is_some())
    }

    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["first_prob", "second_prob", "third_prob"];
        if self.has_actual_label() {
            columns.push("actual_label");
        }
        columns
    }

    pub fn first(&self) -> Vec<&LabelValue> {
        self.rows.iter().map(|r| &r.first_prob).collect()
    }

    /// Comma-separated table with a header row
    pub fn to_csv_string(&self) -> String {
        let with_actual = self.has_actual_label();
        let mut out = self.columns().join(",");
        out.push('\n');

        let cell = |v: &Option<LabelValue>| v.as_ref().map(csv_field).unwrap_or_default();
        for row in &self.rows {
            out.push_str(&csv_field(&row.first_prob));
            out.push(',');
            out.push_str(&cell(&row.second_prob));
            out.push(',');
            out.push_str(&cell(&row.third_prob));
            if with_actual {
                out.push(',');
                if let Some(actual) = row.actual_label {
                    out.push_str(&actual.to_string());
                }
            }
            out.push('\n');
        }
        out
    }
}

fn csv_field(value: &LabelValue) -> String {
    let text = value.to_string();
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}
