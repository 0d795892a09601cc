//! Neighbour and bridge FDB entries.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event::{AF_BRIDGE, EventKind};
use crate::object::{Fallback, ObjectClass, ObjectState, default_fallback};
use crate::schema::TableId;
use crate::store::Filter;
use crate::transport::Verb;
use crate::value::{Attrs, Fields, Value};

use super::{family_of, lowercase};

fn ifindex_context(chain: &Fields) -> Fields {
    chain
        .get("index")
        .map(|index| Fields::from([("ifindex".to_string(), index.clone())]))
        .unwrap_or_default()
}

fn ifindex_filter(chain: &Fields) -> Filter {
    Filter::new().eq("ifindex", chain.get("index").cloned().unwrap_or_default())
}

fn drop_zero_vlan(request: &mut Attrs) {
    if request.get_int("vlan") == Some(0) {
        request.remove("vlan");
    }
}

fn neighbour_fallback(verb: Verb, errno: i32) -> Option<Fallback> {
    // An existing entry is loaded by dumping the family.
    if verb == Verb::Create && errno == libc::EEXIST {
        return Some(Fallback::Dump);
    }
    default_fallback(verb, errno)
}

#[derive(Debug)]
pub(crate) struct Neighbour;

#[async_trait]
impl ObjectClass for Neighbour {
    fn table(&self) -> TableId {
        TableId::Neighbours
    }

    fn kind(&self) -> EventKind {
        EventKind::Neighbour
    }

    fn parse(&self, selector: &str) -> Result<Fields> {
        let dst: std::net::IpAddr = selector
            .parse()
            .map_err(|_| Error::invalid_value("dst", format!("not an IP address: {selector:?}")))?;
        let mut fields = Fields::new();
        fields.insert("dst".into(), Value::Str(dst.to_string()));
        fields.insert("family".into(), Value::Int(family_of(selector)));
        Ok(fields)
    }

    fn normalize(&self, fields: &mut Fields) {
        if !fields.contains_key("family")
            && let Some(dst) = fields.get("dst").and_then(Value::as_str)
        {
            let family = family_of(dst);
            fields.insert("family".into(), Value::Int(family));
        }
    }

    fn normalize_value(&self, name: &str, value: Value) -> Value {
        match name {
            "lladdr" => lowercase(value),
            _ => value,
        }
    }

    fn references(&self) -> &'static [&'static str] {
        &["ifindex"]
    }

    fn fallback(&self, verb: Verb, errno: i32, _request: &Attrs) -> Option<Fallback> {
        neighbour_fallback(verb, errno)
    }

    fn chain_context(&self, chain: &Fields) -> Fields {
        ifindex_context(chain)
    }

    fn chain_filter(&self, chain: &Fields) -> Filter {
        ifindex_filter(chain)
    }

    fn adjust_request(&self, _state: ObjectState, _fields: &Fields, request: &mut Attrs) {
        drop_zero_vlan(request);
    }

    fn restore_fields(&self) -> &'static [&'static str] {
        &["lladdr"]
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["ifname", "dst", "lladdr"]
    }

    fn ifname_join(&self) -> Option<&'static str> {
        Some("ifindex")
    }
}

/// Bridge forwarding database entries: neighbours of the bridge family,
/// keyed by MAC address.
#[derive(Debug)]
pub(crate) struct Fdb;

#[async_trait]
impl ObjectClass for Fdb {
    fn table(&self) -> TableId {
        TableId::AfBridgeFdb
    }

    fn kind(&self) -> EventKind {
        EventKind::Neighbour
    }

    fn parse(&self, selector: &str) -> Result<Fields> {
        let mut fields = Fields::new();
        fields.insert("lladdr".into(), lowercase(Value::from(selector)));
        Ok(fields)
    }

    fn normalize(&self, fields: &mut Fields) {
        if let Some(lladdr) = fields.remove("lladdr") {
            fields.insert("lladdr".into(), lowercase(lladdr));
        }
    }

    fn normalize_value(&self, name: &str, value: Value) -> Value {
        match name {
            "lladdr" => lowercase(value),
            _ => value,
        }
    }

    fn references(&self) -> &'static [&'static str] {
        &["ifindex"]
    }

    fn fallback(&self, verb: Verb, errno: i32, _request: &Attrs) -> Option<Fallback> {
        neighbour_fallback(verb, errno)
    }

    fn chain_context(&self, chain: &Fields) -> Fields {
        ifindex_context(chain)
    }

    fn chain_filter(&self, chain: &Fields) -> Filter {
        ifindex_filter(chain)
    }

    fn adjust_request(&self, _state: ObjectState, _fields: &Fields, request: &mut Attrs) {
        request.set("family", AF_BRIDGE);
        drop_zero_vlan(request);
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["ifname", "lladdr", "vlan"]
    }

    fn ifname_join(&self) -> Option<&'static str> {
        Some("ifindex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let fields = Neighbour.parse("10.0.0.2").unwrap();
        assert_eq!(fields.get("dst"), Some(&Value::from("10.0.0.2")));
        assert!(Neighbour.parse("eth0").is_err());
        let fields = Fdb.parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(fields.get("lladdr"), Some(&Value::from("aa:bb:cc:dd:ee:ff")));
    }

    #[test]
    fn test_vlan_zero_dropped() {
        let mut request = Attrs::new().with("dst", "10.0.0.2").with("vlan", 0);
        Neighbour.adjust_request(ObjectState::Invalid, &Fields::new(), &mut request);
        assert!(!request.contains("vlan"));

        let mut request = Attrs::new().with("lladdr", "aa:bb:cc:dd:ee:ff").with("vlan", 10);
        Fdb.adjust_request(ObjectState::Invalid, &Fields::new(), &mut request);
        assert_eq!(request.get_int("vlan"), Some(10));
        assert_eq!(request.get_int("family"), Some(AF_BRIDGE));
    }

    #[test]
    fn test_exists_falls_back_to_dump() {
        assert_eq!(
            Neighbour.fallback(Verb::Create, libc::EEXIST, &Attrs::new()),
            Some(Fallback::Dump)
        );
        assert_eq!(
            Neighbour.fallback(Verb::Delete, libc::ENOENT, &Attrs::new()),
            Some(Fallback::Ignore)
        );
    }
}
