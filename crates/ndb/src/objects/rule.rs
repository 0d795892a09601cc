//! Policy routing rules.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::object::ObjectClass;
use crate::schema::TableId;
use crate::value::{Fields, Value};

#[derive(Debug)]
pub(crate) struct Rule;

#[async_trait]
impl ObjectClass for Rule {
    fn table(&self) -> TableId {
        TableId::Rules
    }

    fn kind(&self) -> EventKind {
        EventKind::Rule
    }

    fn replace_on_key_change(&self) -> bool {
        true
    }

    fn parse(&self, selector: &str) -> Result<Fields> {
        Err(Error::invalid_value(
            "rule",
            format!("rules are selected by fields, not by {selector:?}"),
        ))
    }

    /// Rules are selected by priority.
    fn parse_index(&self, priority: i64) -> Result<Fields> {
        Ok(Fields::from([("priority".to_string(), Value::Int(priority))]))
    }

    fn normalize(&self, fields: &mut Fields) {
        super::normalize_prefix(fields, "dst", "dst_len");
        super::normalize_prefix(fields, "src", "src_len");
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["family", "priority", "action", "table", "src", "src_len", "dst", "dst_len"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors() {
        assert!(Rule.parse("x").is_err());
        let fields = Rule.parse_index(100).unwrap();
        assert_eq!(fields.get("priority"), Some(&Value::Int(100)));

        let mut fields = Fields::new();
        fields.insert("src".into(), "10.0.0.0/8".into());
        Rule.normalize(&mut fields);
        assert_eq!(fields.get("src_len"), Some(&Value::Int(8)));
    }
}
