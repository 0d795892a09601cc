//! Flat, read-only record sets returned by `dump()` and `summary()`.
//!
//! A [`RecordSet`] is a list of rows sharing one header. It can be filtered,
//! projected and rendered as JSON or CSV without touching the engine.
//!
//! ```ignore
//! let json = ndb
//!     .addresses()
//!     .summary()
//!     .await?
//!     .select_records(&[("ifname", "eth0".into())])
//!     .select_fields(&["address", "prefixlen"])
//!     .format(Format::Json)?;
//! ```

use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::Result;
use crate::value::{Fields, Value};

/// Output format of [`RecordSet::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Csv,
}

/// One row of a record set.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    /// Get a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let pos = self.names.iter().position(|n| n == name)?;
        self.values.get(pos)
    }

    /// Field names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Field values, in header order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The record as a field map.
    pub fn to_fields(&self) -> Fields {
        self.names
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.names.iter().zip(&self.values) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A list of records sharing one header.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    names: Arc<[String]>,
    rows: Vec<Vec<Value>>,
}

impl RecordSet {
    /// Build a record set. Rows shorter than the header are padded with nulls.
    pub fn new(names: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let width = names.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self {
            names: names.into(),
            rows,
        }
    }

    /// Header.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of records.
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> impl Iterator<Item = Record> + '_ {
        self.rows.iter().map(|values| Record {
            names: self.names.clone(),
            values: values.clone(),
        })
    }

    /// Collect the records.
    pub fn materialize(self) -> Vec<Record> {
        let names = self.names;
        self.rows
            .into_iter()
            .map(|values| Record {
                names: names.clone(),
                values,
            })
            .collect()
    }

    /// Keep the records matching `pred`.
    pub fn filter(mut self, pred: impl Fn(&Record) -> bool) -> Self {
        let names = self.names.clone();
        self.rows.retain(|values| {
            pred(&Record {
                names: names.clone(),
                values: values.clone(),
            })
        });
        self
    }

    /// Keep the records whose fields equal every given value.
    pub fn select_records(self, spec: &[(&str, Value)]) -> Self {
        self.filter(|record| {
            spec.iter()
                .all(|(name, value)| record.get(name).is_some_and(|v| v == value))
        })
    }

    /// Keep only the named fields, in the given order. Unknown names yield nulls.
    pub fn select_fields(self, fields: &[&str]) -> Self {
        let positions: Vec<Option<usize>> = fields
            .iter()
            .map(|f| self.names.iter().position(|n| n == f))
            .collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                positions
                    .iter()
                    .map(|p| p.and_then(|p| row.get(p).cloned()).unwrap_or_default())
                    .collect()
            })
            .collect();
        Self {
            names: fields.iter().map(|f| f.to_string()).collect::<Vec<_>>().into(),
            rows,
        }
    }

    /// Rewrite one field of every record.
    pub fn transform_fields(mut self, field: &str, transform: impl Fn(Value) -> Value) -> Self {
        if let Some(pos) = self.names.iter().position(|n| n == field) {
            for row in &mut self.rows {
                let value = std::mem::take(&mut row[pos]);
                row[pos] = transform(value);
            }
        }
        self
    }

    /// Render the set.
    pub fn format(&self, format: Format) -> Result<String> {
        match format {
            Format::Json => {
                let records: Vec<Record> = self.iter().collect();
                Ok(serde_json::to_string_pretty(&records)?)
            }
            Format::Csv => Ok(self.to_csv()),
        }
    }

    fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.names.iter().map(|n| csv_field(n)).collect();
        out.push_str(&header.join(","));
        out.push('\n');
        for row in &self.rows {
            let line: Vec<String> = row
                .iter()
                .map(|v| match v {
                    Value::Null => String::new(),
                    Value::Int(i) => i.to_string(),
                    other => csv_field(&other.to_string()),
                })
                .collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        out
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv())
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.materialize().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordSet {
        RecordSet::new(
            vec!["target".into(), "ifname".into(), "index".into()],
            vec![
                vec!["localhost".into(), "lo".into(), 1.into()],
                vec!["localhost".into(), "eth0".into(), 2.into()],
                vec!["ns1".into(), "eth0".into(), 2.into()],
            ],
        )
    }

    #[test]
    fn test_select_records_and_fields() {
        let set = sample()
            .select_records(&[("ifname", "eth0".into())])
            .select_fields(&["target", "index"]);
        assert_eq!(set.count(), 2);
        assert_eq!(set.names(), ["target", "index"]);
        let first = set.iter().next().unwrap();
        assert_eq!(first.get("target"), Some(&Value::from("localhost")));
        assert_eq!(first.get("ifname"), None);
    }

    #[test]
    fn test_filter_and_transform() {
        let set = sample()
            .filter(|r| r.get("index").and_then(Value::as_int) == Some(2))
            .transform_fields("ifname", |v| Value::from(v.to_string().to_uppercase()));
        let names: Vec<Value> = set
            .materialize()
            .into_iter()
            .map(|r| r.get("ifname").cloned().unwrap())
            .collect();
        assert_eq!(names, vec![Value::from("ETH0"), Value::from("ETH0")]);
    }

    #[test]
    fn test_format_json() {
        let json = sample().select_fields(&["ifname"]).format(Format::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[1]["ifname"], "eth0");
        assert_eq!(parsed.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_format_csv() {
        let set = RecordSet::new(
            vec!["name".into(), "value".into()],
            vec![vec!["a,b".into(), Value::Null], vec!["c".into(), 3.into()]],
        );
        assert_eq!(
            set.format(Format::Csv).unwrap(),
            "name,value\n\"a,b\",\nc,3\n"
        );
    }
}
