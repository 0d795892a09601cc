//! Routes.
//!
//! Routes are replaced, not modified, when a key field changes: the new
//! route is created first and the old one removed after it is confirmed.
//! Multipath hops, metrics and MPLS encapsulation live in child tables and
//! are merged back into the route as `multipath`, `metrics` and `encap`.

use async_trait::async_trait;

use crate::db::Context;
use crate::error::{Error, Result};
use crate::event::{AF_INET, EventKind};
use crate::object::{ObjectClass, ObjectState, Rows};
use crate::schema::TableId;
use crate::store::{Filter, Row};
use crate::value::{Attrs, Fields, Value};

use super::{contained_in, normalize_prefix, split_prefix};

const RT_TABLE_MAIN: i64 = 254;

#[derive(Debug)]
pub(crate) struct Route;

fn child_attrs(row: &Row, skip: &[&str]) -> Attrs {
    let mut attrs = Attrs::new();
    for (name, value) in row.to_fields() {
        if name == "target" || name == "tflags" || skip.contains(&name.as_str()) || value.is_null()
        {
            continue;
        }
        attrs.set(name, value);
    }
    attrs
}

#[async_trait]
impl ObjectClass for Route {
    fn table(&self) -> TableId {
        TableId::Routes
    }

    fn kind(&self) -> EventKind {
        EventKind::Route
    }

    fn replace_on_key_change(&self) -> bool {
        true
    }

    /// `"default"`, or a destination prefix such as `"10.1.0.0/24"`.
    fn parse(&self, selector: &str) -> Result<Fields> {
        let mut fields = Fields::new();
        if selector == "default" {
            fields.insert("dst".into(), Value::from(""));
            fields.insert("dst_len".into(), Value::Int(0));
            fields.insert("family".into(), Value::Int(AF_INET));
            return Ok(fields);
        }
        let (dst, dst_len) =
            split_prefix(selector).map_err(|message| Error::invalid_value("dst", message))?;
        fields.insert("family".into(), Value::Int(super::family_of(&dst)));
        fields.insert("dst".into(), Value::Str(dst));
        fields.insert("dst_len".into(), Value::Int(dst_len));
        Ok(fields)
    }

    fn normalize(&self, fields: &mut Fields) {
        if fields.get("dst").and_then(Value::as_str) == Some("default") {
            fields.insert("dst".into(), Value::from(""));
            fields.insert("dst_len".into(), Value::Int(0));
        }
        normalize_prefix(fields, "dst", "dst_len");
    }

    fn same_value(&self, name: &str, expected: &Value, loaded: &Value) -> bool {
        match name {
            "multipath" | "metrics" | "encap" => contained_in(expected, loaded),
            _ => expected == loaded,
        }
    }

    fn is_loadable(&self, name: &str, _fields: &Fields) -> bool {
        matches!(name, "multipath" | "metrics" | "encap")
    }

    fn references(&self) -> &'static [&'static str] {
        &["oif", "iif"]
    }

    fn chain_context(&self, chain: &Fields) -> Fields {
        chain
            .get("index")
            .map(|index| Fields::from([("oif".to_string(), index.clone())]))
            .unwrap_or_default()
    }

    fn chain_filter(&self, chain: &Fields) -> Filter {
        Filter::new().eq("oif", chain.get("index").cloned().unwrap_or_default())
    }

    fn adjust_request(&self, state: ObjectState, _fields: &Fields, request: &mut Attrs) {
        if matches!(state, ObjectState::Invalid | ObjectState::Replace)
            && request.get("table").is_none_or(Value::is_null)
        {
            request.set("table", RT_TABLE_MAIN);
        }
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["table", "ifname", "dst", "dst_len", "gateway"]
    }

    fn ifname_join(&self) -> Option<&'static str> {
        Some("oif")
    }

    async fn load_extra(
        &self,
        ctx: &Context,
        rows: Rows,
        row: &Row,
        fields: &mut Fields,
    ) -> Result<()> {
        let Some(route_id) = row.get("route_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let filter = || {
            Filter::new()
                .eq("target", row.target.as_str())
                .eq("route_id", route_id)
        };

        let mut hops = ctx.fetch(rows, TableId::Nh, filter()).await?;
        if !hops.is_empty() {
            hops.sort_by_key(|hop| hop.get("nh_id").and_then(Value::as_int));
            let hops = hops
                .iter()
                .map(|hop| Value::Nested(child_attrs(hop, &["route_id", "nh_id"])))
                .collect();
            fields.insert("multipath".into(), Value::List(hops));
        }
        if let Some(metrics) = ctx.fetch(rows, TableId::Metrics, filter()).await?.first() {
            fields.insert(
                "metrics".into(),
                Value::Nested(child_attrs(metrics, &["route_id"])),
            );
        }
        if let Some(encap) = ctx.fetch(rows, TableId::EncMpls, filter()).await?.first() {
            fields.insert("encap".into(), Value::Nested(child_attrs(encap, &["route_id"])));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let fields = Route.parse("default").unwrap();
        assert_eq!(fields.get("dst"), Some(&Value::from("")));
        assert_eq!(fields.get("dst_len"), Some(&Value::Int(0)));

        let fields = Route.parse("10.1.0.0/24").unwrap();
        assert_eq!(fields.get("dst"), Some(&Value::from("10.1.0.0")));
        assert_eq!(fields.get("dst_len"), Some(&Value::Int(24)));
    }

    #[test]
    fn test_normalize_spec() {
        let mut fields = Fields::new();
        fields.insert("dst".into(), "default".into());
        fields.insert("gateway".into(), "10.0.0.254".into());
        Route.normalize(&mut fields);
        assert_eq!(fields.get("dst"), Some(&Value::from("")));
        assert_eq!(fields.get("dst_len"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_metrics_compare() {
        let loaded = Value::Nested(Attrs::new().with("mtu", 1300).with("window", 0));
        assert!(Route.same_value(
            "metrics",
            &Value::Nested(Attrs::new().with("mtu", 1300)),
            &loaded
        ));
        assert!(!Route.same_value("gateway", &"10.0.0.1".into(), &"10.0.0.2".into()));
        assert!(Route.is_loadable("multipath", &Fields::new()));
    }

    #[test]
    fn test_main_table_on_create() {
        let mut request = Attrs::new().with("dst", "10.1.0.0");
        Route.adjust_request(ObjectState::Invalid, &Fields::new(), &mut request);
        assert_eq!(request.get_int("table"), Some(RT_TABLE_MAIN));
    }
}
