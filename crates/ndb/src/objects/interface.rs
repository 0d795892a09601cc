//! Interfaces.
//!
//! Besides its own row, an interface owns the `ifinfo_<kind>` row of its
//! link kind, and its snapshots capture the interfaces that depend on it:
//! bridge and bond ports, VLANs and VXLANs on top of it. Addresses,
//! neighbours and bridge ports can be queued on an interface and are
//! applied after it:
//!
//! ```ignore
//! let br0 = ndb.interfaces().create(Spec::new().with("ifname", "br0").with("kind", "bridge")).await?;
//! br0.set("state", "up")?;
//! br0.add_ip("10.0.0.1/24")?.add_port("eth1")?;
//! br0.commit().await?;
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::db::Context;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::object::{
    Fallback, ObjectClass, ObjectState, RtnlObject, Rows, SavePoint, default_fallback, key_of,
};
use crate::schema::TableId;
use crate::store::{Filter, Row};
use crate::transport::Verb;
use crate::value::{Attrs, Fields, Value};
use crate::view::{Selector, View};

use super::lowercase;

#[derive(Debug)]
pub(crate) struct Interface;

#[async_trait]
impl ObjectClass for Interface {
    fn table(&self) -> TableId {
        TableId::Interfaces
    }

    fn kind(&self) -> EventKind {
        EventKind::Link
    }

    fn key_extra_fields(&self) -> &'static [&'static str] {
        &["ifname"]
    }

    fn parse(&self, selector: &str) -> Result<Fields> {
        Ok(Fields::from([("ifname".to_string(), Value::from(selector))]))
    }

    fn parse_index(&self, index: i64) -> Result<Fields> {
        Ok(Fields::from([("index".to_string(), Value::Int(index))]))
    }

    fn normalize_value(&self, name: &str, value: Value) -> Value {
        match name {
            "address" | "broadcast" => lowercase(value),
            _ => value,
        }
    }

    fn same_value(&self, name: &str, expected: &Value, loaded: &Value) -> bool {
        match name {
            "master" | "link" => expected.as_int().unwrap_or(0) == loaded.as_int().unwrap_or(0),
            // A peer given by name is confirmed by any peer index.
            "peer" => matches!(expected, Value::Str(_)) && loaded.as_int().is_some(),
            _ => expected == loaded,
        }
    }

    fn is_loadable(&self, name: &str, fields: &Fields) -> bool {
        fields
            .get("kind")
            .and_then(Value::as_str)
            .and_then(TableId::ifinfo_for_kind)
            .is_some_and(|t| name != "index" && t.descriptor().has_column(name))
    }

    fn references(&self) -> &'static [&'static str] {
        &["master", "link"]
    }

    fn check_create(&self, fields: &Fields) -> Result<()> {
        match fields.get("ifname") {
            Some(Value::Str(name)) if !name.is_empty() => Ok(()),
            _ => Err(Error::invalid_value("ifname", "required to create an interface")),
        }
    }

    fn fallback(&self, verb: Verb, errno: i32, request: &Attrs) -> Option<Fallback> {
        if verb == Verb::Create && errno == libc::EINVAL && request.contains("master") {
            return Some(Fallback::CreateWithoutMaster);
        }
        default_fallback(verb, errno)
    }

    fn chain_context(&self, chain: &Fields) -> Fields {
        chain
            .get("index")
            .map(|index| Fields::from([("master".to_string(), index.clone())]))
            .unwrap_or_default()
    }

    fn chain_filter(&self, chain: &Fields) -> Filter {
        Filter::new().eq("master", chain.get("index").cloned().unwrap_or_default())
    }

    fn restore_fields(&self) -> &'static [&'static str] {
        &["ifname", "master", "mtu", "state", "address", "alias"]
    }

    fn summary_columns(&self) -> &'static [&'static str] {
        &["index", "ifname", "address", "flags", "state", "kind"]
    }

    async fn load_extra(
        &self,
        ctx: &Context,
        rows: Rows,
        row: &Row,
        fields: &mut Fields,
    ) -> Result<()> {
        let Some(table) = row
            .get("kind")
            .and_then(Value::as_str)
            .and_then(TableId::ifinfo_for_kind)
        else {
            return Ok(());
        };
        let filter = Filter::new()
            .eq("target", row.target.as_str())
            .eq("index", row.field("index"));
        if let Some(info) = ctx.fetch(rows, table, filter).await?.first() {
            for column in table.descriptor().columns {
                if column.name != "index" {
                    fields
                        .entry(column.name.to_string())
                        .or_insert_with(|| info.field(column.name));
                }
            }
        }
        Ok(())
    }

    async fn dependents(&self, ctx: &Context, fields: &Fields) -> Result<Vec<Fields>> {
        let Some(index) = fields.get("index").and_then(Value::as_int).filter(|i| *i != 0) else {
            return Ok(Vec::new());
        };
        let target = fields.get("target").cloned().unwrap_or_default();
        let live = |table: TableId, name: &'static str| {
            ctx.fetch(
                Rows::Live,
                table,
                Filter::new().eq("target", target.clone()).eq(name, index),
            )
        };

        let mut found = BTreeSet::new();
        for row in live(TableId::Interfaces, "master").await? {
            found.insert(row.field("index"));
        }
        for row in live(TableId::Interfaces, "link").await? {
            if row.get("kind").and_then(Value::as_str) == Some("vlan") {
                found.insert(row.field("index"));
            }
        }
        for row in live(TableId::IfinfoVxlan, "vxlan_link").await? {
            found.insert(row.field("index"));
        }
        found.remove(&Value::Int(index));
        Ok(found
            .into_iter()
            .map(|dep| {
                Fields::from([
                    ("target".to_string(), target.clone()),
                    ("index".to_string(), dep),
                ])
            })
            .collect())
    }
}

// ============================================================================
// Deferred operations
// ============================================================================

/// Changes queued on an interface, run after the interface is applied.
#[derive(Debug, Clone)]
pub(crate) enum DeferredOp {
    AddIp(Selector),
    DelIp(Selector),
    AddPort(Selector),
    DelPort(Selector),
    AddNeighbour(Selector),
    DelNeighbour(Selector),
}

impl DeferredOp {
    /// Run the operation; returns the touched objects with their save points.
    pub(crate) async fn run(self, parent: &RtnlObject) -> Result<Vec<(RtnlObject, SavePoint)>> {
        debug!(op = ?self, "deferred operation");
        match self {
            Self::AddIp(selector) => {
                create_child(parent.chained_view(TableId::Addresses)?, selector).await
            }
            Self::AddNeighbour(selector) => {
                create_child(parent.chained_view(TableId::Neighbours)?, selector).await
            }
            Self::DelIp(selector) => {
                remove_children(parent.chained_view(TableId::Addresses)?, selector).await
            }
            Self::DelNeighbour(selector) => {
                remove_children(parent.chained_view(TableId::Neighbours)?, selector).await
            }
            Self::AddPort(selector) => {
                let master = parent_index(parent)?;
                set_master(parent, selector, master).await
            }
            Self::DelPort(selector) => set_master(parent, selector, 0).await,
        }
    }
}

fn parent_index(parent: &RtnlObject) -> Result<i64> {
    parent
        .get_int("index")
        .ok_or_else(|| Error::InvalidState("interface has no index yet".into()))
}

async fn create_child(view: View, selector: Selector) -> Result<Vec<(RtnlObject, SavePoint)>> {
    let obj = view.create(selector).await?;
    obj.apply().await?;
    Ok(vec![(obj, SavePoint::Missing)])
}

async fn remove_children(view: View, selector: Selector) -> Result<Vec<(RtnlObject, SavePoint)>> {
    let wanted = view.selector_fields(selector)?;
    let matches = view
        .dump()
        .await?
        .filter(|record| wanted.iter().all(|(name, value)| record.get(name) == Some(value)));
    let mut saves = Vec::new();
    for record in matches {
        let key = key_of(view.class(), &record.to_fields());
        let obj = view.get(Selector::Fields(key)).await?;
        obj.remove();
        obj.apply().await?;
        let save = obj.last_save().unwrap_or(SavePoint::Missing);
        saves.push((obj, save));
    }
    if saves.is_empty() {
        return Err(Error::KeyNotFound(format!(
            "no {} matched {}",
            view.table(),
            crate::value::format_fields(&wanted)
        )));
    }
    Ok(saves)
}

async fn set_master(
    parent: &RtnlObject,
    selector: Selector,
    master: i64,
) -> Result<Vec<(RtnlObject, SavePoint)>> {
    let view = View::new(parent.ctx().clone(), &Interface, parent.auth().clone(), None);
    let port = view.get(selector).await?;
    if master == 0 && port.get_int("master") != parent.get_int("index") {
        debug!(port = ?port.get("ifname"), "not a port of this interface");
        return Ok(Vec::new());
    }
    port.set("master", master)?;
    port.apply().await?;
    let save = port.last_save().unwrap_or(SavePoint::Missing);
    Ok(vec![(port, save)])
}

// ============================================================================
// Interface helpers
// ============================================================================

impl RtnlObject {
    fn expect_interface(&self) -> Result<()> {
        if self.table() == TableId::Interfaces {
            Ok(())
        } else {
            Err(Error::InvalidState(format!("{} is not an interface", self.table())))
        }
    }

    fn queue(&self, op: DeferredOp) -> Result<&Self> {
        self.expect_interface()?;
        self.push_op(op);
        Ok(self)
    }

    /// Queue an address, e.g. `"10.0.0.1/24"`.
    pub fn add_ip(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::AddIp(spec.into()))
    }

    /// Queue the removal of the addresses matching `spec`.
    pub fn del_ip(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::DelIp(spec.into()))
    }

    /// Queue enslaving an interface to this one.
    pub fn add_port(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::AddPort(spec.into()))
    }

    /// Queue releasing a port.
    pub fn del_port(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::DelPort(spec.into()))
    }

    /// Queue a neighbour entry on this interface.
    pub fn add_neighbour(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::AddNeighbour(spec.into()))
    }

    /// Queue the removal of neighbour entries matching `spec`.
    pub fn del_neighbour(&self, spec: impl Into<Selector>) -> Result<&Self> {
        self.queue(DeferredOp::DelNeighbour(spec.into()))
    }

    /// Addresses of this interface.
    pub fn ipaddr(&self) -> Result<View> {
        self.expect_interface()?;
        self.chained_view(TableId::Addresses)
    }

    /// Ports of this interface.
    pub fn ports(&self) -> Result<View> {
        self.expect_interface()?;
        self.chained_view(TableId::Interfaces)
    }

    /// Routes through this interface.
    pub fn routes(&self) -> Result<View> {
        self.expect_interface()?;
        self.chained_view(TableId::Routes)
    }

    /// Neighbours on this interface.
    pub fn neighbours(&self) -> Result<View> {
        self.expect_interface()?;
        self.chained_view(TableId::Neighbours)
    }

    /// Check whether the interface is up.
    pub fn is_up(&self) -> bool {
        self.state() == ObjectState::System
            && self.get("state").and_then(|v| v.as_str().map(|s| s == "up")) == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_normalize() {
        let fields = Interface.parse("eth0").unwrap();
        assert_eq!(fields.get("ifname"), Some(&Value::from("eth0")));
        let fields = Interface.parse_index(3).unwrap();
        assert_eq!(fields.get("index"), Some(&Value::Int(3)));
        assert_eq!(
            Interface.normalize_value("address", "AA:BB:CC:00:11:22".into()),
            Value::from("aa:bb:cc:00:11:22")
        );
        assert_eq!(Interface.normalize_value("ifname", "ETH0".into()), Value::from("ETH0"));
    }

    #[test]
    fn test_master_compare() {
        assert!(Interface.same_value("master", &Value::Int(0), &Value::Null));
        assert!(Interface.same_value("master", &Value::Null, &Value::Int(0)));
        assert!(!Interface.same_value("master", &Value::Int(4), &Value::Int(0)));
        assert!(!Interface.same_value("mtu", &Value::Int(0), &Value::Null));
    }

    #[test]
    fn test_loadable_kind_fields() {
        let mut fields = Fields::new();
        fields.insert("kind".into(), "vlan".into());
        assert!(Interface.is_loadable("vlan_id", &fields));
        assert!(!Interface.is_loadable("index", &fields));
        assert!(!Interface.is_loadable("peer", &fields));
        fields.insert("kind".into(), "veth".into());
        assert!(Interface.is_loadable("peer", &fields));
    }

    #[test]
    fn test_create_without_master_fallback() {
        let request = Attrs::new().with("ifname", "eth1").with("master", 4);
        assert_eq!(
            Interface.fallback(Verb::Create, libc::EINVAL, &request),
            Some(Fallback::CreateWithoutMaster)
        );
        assert_eq!(
            Interface.fallback(Verb::Create, libc::EINVAL, &Attrs::new().with("ifname", "x")),
            None
        );
        assert!(Interface.check_create(&Fields::new()).is_err());
    }
}
