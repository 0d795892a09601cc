//! Network namespaces, keyed by their path.

use async_trait::async_trait;

use crate::error::Result;
use crate::event::EventKind;
use crate::object::ObjectClass;
use crate::schema::TableId;
use crate::value::{Fields, Value};

const NETNS_RUN_DIR: &str = "/var/run/netns";

#[derive(Debug)]
pub(crate) struct Netns;

#[async_trait]
impl ObjectClass for Netns {
    fn table(&self) -> TableId {
        TableId::Netns
    }

    fn kind(&self) -> EventKind {
        EventKind::NetNs
    }

    /// A namespace name or a full path.
    fn parse(&self, selector: &str) -> Result<Fields> {
        let path = if selector.contains('/') {
            selector.to_string()
        } else {
            format!("{NETNS_RUN_DIR}/{selector}")
        };
        Ok(Fields::from([("path".to_string(), Value::Str(path))]))
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["path", "nsid"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let fields = Netns.parse("test").unwrap();
        assert_eq!(fields.get("path"), Some(&Value::from("/var/run/netns/test")));
        let fields = Netns.parse("/run/netns/x").unwrap();
        assert_eq!(fields.get("path"), Some(&Value::from("/run/netns/x")));
    }
}
