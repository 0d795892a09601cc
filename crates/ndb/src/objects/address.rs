//! IP addresses.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event::{AF_INET, EventKind};
use crate::object::{ObjectClass, ObjectState};
use crate::schema::TableId;
use crate::store::Filter;
use crate::value::{Attrs, Fields, Value};

use super::{normalize_prefix, split_prefix};

#[derive(Debug)]
pub(crate) struct Address;

#[async_trait]
impl ObjectClass for Address {
    fn table(&self) -> TableId {
        TableId::Addresses
    }

    fn kind(&self) -> EventKind {
        EventKind::Address
    }

    /// `"10.0.0.1/24"`; a bare address gets the host prefix.
    fn parse(&self, selector: &str) -> Result<Fields> {
        let (address, prefixlen) =
            split_prefix(selector).map_err(|message| Error::invalid_value("address", message))?;
        let mut fields = Fields::new();
        fields.insert("family".into(), Value::Int(super::family_of(&address)));
        fields.insert("address".into(), Value::Str(address));
        fields.insert("prefixlen".into(), Value::Int(prefixlen));
        Ok(fields)
    }

    fn normalize(&self, fields: &mut Fields) {
        normalize_prefix(fields, "address", "prefixlen");
    }

    fn references(&self) -> &'static [&'static str] {
        &["index"]
    }

    fn check_create(&self, fields: &Fields) -> Result<()> {
        if fields.get("address").is_none_or(Value::is_null) {
            return Err(Error::invalid_value("address", "required to create an address"));
        }
        if fields.get("index").is_none_or(Value::is_null) {
            return Err(Error::invalid_value("index", "required to create an address"));
        }
        Ok(())
    }

    fn chain_context(&self, chain: &Fields) -> Fields {
        chain
            .get("index")
            .map(|index| Fields::from([("index".to_string(), index.clone())]))
            .unwrap_or_default()
    }

    fn chain_filter(&self, chain: &Fields) -> Filter {
        Filter::new().eq("index", chain.get("index").cloned().unwrap_or_default())
    }

    fn adjust_request(&self, state: ObjectState, fields: &Fields, request: &mut Attrs) {
        // IPv4 addresses carry the local address too.
        if matches!(state, ObjectState::Invalid | ObjectState::Replace)
            && fields.get("family").and_then(Value::as_int) == Some(AF_INET)
            && request.get("local").is_none_or(|v| v.is_null() || v.as_str() == Some(""))
            && let Some(address) = request.get("address").cloned()
        {
            request.set("local", address);
        }
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["ifname", "address", "prefixlen"]
    }

    fn ifname_join(&self) -> Option<&'static str> {
        Some("index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let fields = Address.parse("10.0.0.1/24").unwrap();
        assert_eq!(fields.get("address"), Some(&Value::from("10.0.0.1")));
        assert_eq!(fields.get("prefixlen"), Some(&Value::Int(24)));
        assert_eq!(fields.get("family"), Some(&Value::Int(AF_INET)));

        let fields = Address.parse("fd00::1").unwrap();
        assert_eq!(fields.get("prefixlen"), Some(&Value::Int(128)));
        assert!(Address.parse("nonsense").is_err());
    }

    #[test]
    fn test_normalize_spec() {
        let mut fields = Fields::new();
        fields.insert("address".into(), "10.1.2.3/16".into());
        fields.insert("index".into(), 5.into());
        Address.normalize(&mut fields);
        assert_eq!(fields.get("address"), Some(&Value::from("10.1.2.3")));
        assert_eq!(fields.get("prefixlen"), Some(&Value::Int(16)));
        assert!(Address.check_create(&fields).is_ok());
    }

    #[test]
    fn test_local_added_on_create() {
        let mut fields = Fields::new();
        fields.insert("family".into(), AF_INET.into());
        let mut request = Attrs::new().with("address", "10.0.0.1");
        Address.adjust_request(ObjectState::Invalid, &fields, &mut request);
        assert_eq!(request.get_str("local"), Some("10.0.0.1"));

        let mut request = Attrs::new().with("address", "10.0.0.1");
        Address.adjust_request(ObjectState::Remove, &fields, &mut request);
        assert!(!request.contains("local"));
    }
}
