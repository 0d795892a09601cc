//! Per-family load handlers.
//!
//! A handler maps one event onto the store. [`load_event`] is the generic
//! contract every family builds on: delete events remove by index fields,
//! everything else is an upsert that updates existing rows in place. The
//! family handlers add the side effects the kernel does not announce: routes
//! dropped silently when a link goes down or loses its last IPv4 address,
//! multipath hops and metrics split into child tables, link-kind specific
//! data, and garbage-collection marks on gateway routes.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::engine::{HandlerRegistry, Outcome};
use crate::error::{Error, Result};
use crate::event::{AF_BRIDGE, AF_INET, Event, EventKind, IFF_UP};
use crate::schema::TableId;
use crate::source::{SourceKind, SourceSpec, Sources};
use crate::store::{Filter, Store};
use crate::value::{Attrs, Value};

/// Route depends on `nh` rows.
pub const DEPS_MULTIPATH: i64 = 1;
/// Route depends on an `enc_mpls` row.
pub const DEPS_ENCAP: i64 = 2;
/// Route depends on a `metrics` row.
pub const DEPS_METRICS: i64 = 4;

const RT_TABLE_MAIN: i64 = 254;
const RTPROT_KERNEL: i64 = 2;
const RT_SCOPE_LINK: i64 = 253;
const LWTUNNEL_ENCAP_MPLS: i64 = 1;

/// Register the default handlers for every family.
pub(crate) fn install(registry: &mut HandlerRegistry, auto_netns: Option<Sources>) {
    registry.register(EventKind::Link, Box::new(load_link));
    registry.register(EventKind::Address, Box::new(load_address));
    registry.register(EventKind::Route, Box::new(load_route));
    registry.register(EventKind::Neighbour, Box::new(load_neighbour));
    registry.register(EventKind::Rule, Box::new(|store, target, event| {
        load_event(store, TableId::Rules, target, event)
    }));
    registry.register(EventKind::NetNs, Box::new(load_netns));
    if let Some(sources) = auto_netns {
        registry.register(
            EventKind::NetNs,
            Box::new(move |_store, target, event| {
                track_netns(&sources, target, event);
                Ok(Outcome::Continue)
            }),
        );
    }
}

pub(crate) fn column_value(table: TableId, event: &Event, name: &str, path: &[&str]) -> Value {
    let desc = table.descriptor();
    match event.get_nested(path, name).cloned().and_then(Value::non_null) {
        Some(value) => desc.coerce(name, value),
        None if desc.is_index(name) => desc.key_default(name),
        None => Value::Null,
    }
}

fn index_filter(table: TableId, target: &str, event: &Event) -> Filter {
    let mut filter = Filter::new().eq("target", target);
    for name in table.descriptor().index {
        filter.push(*name, column_value(table, event, name, &[]));
    }
    filter
}

/// Load one event into one table.
///
/// Delete events remove every row whose index fields match, with missing
/// index fields taking their defaults. Other events update the row with the
/// same key in place, or insert it. An insert whose parent row is not loaded
/// yet asks for rescheduling.
pub fn load_event(store: &mut Store, table: TableId, target: &str, event: &Event) -> Result<Outcome> {
    store.log_event(table, event);
    if event.is_delete() {
        store.delete(table, &index_filter(table, target, event));
        return Ok(Outcome::Continue);
    }
    let values = table
        .descriptor()
        .columns
        .iter()
        .map(|c| column_value(table, event, c.name, c.path))
        .collect();
    match store.upsert(table, target, values) {
        Ok(()) => Ok(Outcome::Continue),
        Err(Error::ForeignKey { table, parent }) => {
            debug!(table, parent, "parent not loaded, rescheduling");
            Ok(Outcome::Reschedule)
        }
        Err(e) => Err(e),
    }
}

fn drop_routes_via(store: &mut Store, target: &str, index: i64) -> usize {
    store.delete(TableId::Routes, &Filter::new().eq("target", target).eq("oif", index))
        + store.delete(TableId::Routes, &Filter::new().eq("target", target).eq("iif", index))
}

// ============================================================================
// Links
// ============================================================================

/// Load a link event into `interfaces` and the per-kind info table.
pub fn load_link(store: &mut Store, target: &str, event: &Event) -> Result<Outcome> {
    let index = event.get_int("index").unwrap_or(0);
    let flags = event.get_int("flags").unwrap_or(0);
    if flags & IFF_UP == 0 {
        let dropped = drop_routes_via(store, target, index);
        if dropped > 0 {
            debug!(target, index, dropped, "link down, routes flushed");
        }
    }
    let mut event = event.clone();
    event
        .fields
        .set("state", if flags & IFF_UP != 0 { "up" } else { "down" });
    let outcome = load_event(store, TableId::Interfaces, target, &event)?;
    if outcome != Outcome::Continue || event.is_delete() {
        return Ok(outcome);
    }
    let kind = event.get_nested(&["linkinfo"], "kind").and_then(Value::as_str);
    if let Some(table) = kind.and_then(TableId::ifinfo_for_kind) {
        let data = event
            .attrs
            .get_path(&["linkinfo", "data"])
            .cloned()
            .unwrap_or_default();
        let info = Event {
            header: event.header.clone(),
            fields: Attrs::new().with("index", index),
            attrs: data,
        };
        load_event(store, table, target, &info)?;
    }
    Ok(Outcome::Continue)
}

// ============================================================================
// Addresses
// ============================================================================

/// Load an address event. Losing the last IPv4 address drops the routes
/// through the interface, as the kernel does without telling.
pub fn load_address(store: &mut Store, target: &str, event: &Event) -> Result<Outcome> {
    let outcome = load_event(store, TableId::Addresses, target, event)?;
    if event.is_delete()
        && let Some(index) = event.get_int("index")
    {
        let left = store.count(
            TableId::Addresses,
            &Filter::new()
                .eq("target", target)
                .eq("index", index)
                .eq("family", AF_INET),
        );
        if left == 0 {
            let dropped = store.delete(
                TableId::Routes,
                &Filter::new().eq("target", target).eq("oif", index),
            );
            debug!(target, index, dropped, "last IPv4 address removed");
        }
    }
    Ok(outcome)
}

// ============================================================================
// Routes
// ============================================================================

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Existing route id for the route described by `event`, or a fresh one.
fn route_id(store: &Store, target: &str, event: &Event) -> String {
    store
        .fetch_one(TableId::Routes, &index_filter(TableId::Routes, target, event))
        .and_then(|row| row.get("route_id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Set (or clear) the GC mark of IPv4 gateway routes through the event's
/// interface whose gateway lies inside the event's link network.
fn gc_mark(store: &mut Store, target: &str, event: &Event, mark: Option<i64>) -> Result<usize> {
    let oif = event.get_int("oif").unwrap_or(0);
    let dst_len = event.get_int("dst_len").unwrap_or(0).clamp(0, 32) as u32;
    let dst: Ipv4Addr = event
        .get_str("dst")
        .unwrap_or_default()
        .parse()
        .map_err(|_| Error::invalid_value("dst", "not an IPv4 address"))?;
    let mask = u32::MAX.checked_shl(32 - dst_len).unwrap_or(0);
    let net = u32::from(dst) & mask;

    let candidates = store.fetch(
        TableId::Routes,
        &Filter::new()
            .eq("target", target)
            .eq("oif", oif)
            .eq("family", AF_INET),
    );
    let mut count = 0;
    for route in candidates {
        let Some(gateway) = route.get("gateway").and_then(Value::as_str) else {
            continue;
        };
        if mark.is_none() && route.get("gc_mark").is_none_or(Value::is_null) {
            continue;
        }
        let Ok(gateway) = gateway.parse::<Ipv4Addr>() else {
            warn!(target, gateway, "gc mark: bad gateway");
            continue;
        };
        if u32::from(gateway) & mask == net {
            let mut key = Filter::new().eq("target", target);
            for name in TableId::Routes.descriptor().index {
                key.push(*name, route.field(name));
            }
            count += store.update(TableId::Routes, &key, "gc_mark", Value::from(mark));
        }
    }
    Ok(count)
}

/// Load a route event, splitting multipath hops, MPLS encap and metrics
/// into their child tables.
pub fn load_route(store: &mut Store, target: &str, event: &Event) -> Result<Outcome> {
    let mut event = event.clone();
    if event.attrs.get("table").is_none_or(Value::is_null) {
        let table = event.fields.get_int("table").unwrap_or(RT_TABLE_MAIN);
        event.attrs.set("table", table);
    } else if event.get_int("table") == Some(RT_TABLE_MAIN)
        && event.get_int("proto") == Some(RTPROT_KERNEL)
        && event.get_int("scope") == Some(RT_SCOPE_LINK)
        && event.get_int("family") == Some(AF_INET)
    {
        // Link routes leaving mark dependent gateway routes, new ones clear the marks.
        let mark = event.is_delete().then(now_secs);
        if let Err(e) = gc_mark(store, target, &event, mark) {
            error!(target, error = %e, "gc mark failed");
        }
    }

    let mut children: Vec<(TableId, Event)> = Vec::new();
    if !event.is_delete() {
        let mut deps = 0;
        let mut id: Option<String> = None;

        if let Some(hops) = event.get("multipath").and_then(Value::as_list) {
            let route_id = id.get_or_insert_with(|| route_id(store, target, &event)).clone();
            for (nh_id, hop) in hops.iter().enumerate() {
                let Some(hop) = hop.as_nested() else { continue };
                let mut attrs = hop.clone();
                attrs.set("route_id", route_id.as_str());
                attrs.set("nh_id", nh_id);
                children.push((TableId::Nh, child_event(&event, attrs)));
            }
            deps |= DEPS_MULTIPATH;
        }
        if event.get_int("encap_type") == Some(LWTUNNEL_ENCAP_MPLS)
            && let Some(encap) = event.get("encap").and_then(Value::as_nested)
        {
            let route_id = id.get_or_insert_with(|| route_id(store, target, &event)).clone();
            let attrs = encap.clone().with("route_id", route_id);
            children.push((TableId::EncMpls, child_event(&event, attrs)));
            deps |= DEPS_ENCAP;
        }
        if let Some(metrics) = event.get("metrics").and_then(Value::as_nested) {
            let route_id = id.get_or_insert_with(|| route_id(store, target, &event)).clone();
            let attrs = metrics.clone().with("route_id", route_id);
            children.push((TableId::Metrics, child_event(&event, attrs)));
            deps |= DEPS_METRICS;
        }
        event.fields.set("deps", deps);
        if let Some(id) = id {
            event.fields.set("route_id", id);
        }
    }

    let outcome = load_event(store, TableId::Routes, target, &event)?;
    if outcome != Outcome::Continue {
        return Ok(outcome);
    }
    for (table, child) in children {
        load_event(store, table, target, &child)?;
    }
    Ok(Outcome::Continue)
}

fn child_event(parent: &Event, attrs: Attrs) -> Event {
    Event {
        header: parent.header.clone(),
        fields: Attrs::new(),
        attrs,
    }
}

// ============================================================================
// Neighbours
// ============================================================================

/// Load a neighbour event. Bridge-family entries go to the FDB table.
pub fn load_neighbour(store: &mut Store, target: &str, event: &Event) -> Result<Outcome> {
    let ifindex = event.get_int("ifindex").unwrap_or(0);
    if ifindex == 0 {
        return Ok(Outcome::Continue);
    }
    if event.get_int("family") == Some(AF_BRIDGE) {
        return match load_event(store, TableId::AfBridgeFdb, target, event) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!(target, error = %e, "fdb load failed, rescheduling");
                Ok(Outcome::Reschedule)
            }
        };
    }
    load_event(store, TableId::Neighbours, target, event)
}

// ============================================================================
// Network namespaces
// ============================================================================

/// Load a namespace info event.
pub fn load_netns(store: &mut Store, target: &str, event: &Event) -> Result<Outcome> {
    if event.get_str("path").is_none() {
        return Ok(Outcome::Continue);
    }
    load_event(store, TableId::Netns, target, event)
}

fn track_netns(sources: &Sources, target: &str, event: &Event) {
    let Some(path) = event.get_str("path") else {
        return;
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    let source = format!("netns/{name}");
    let sources = sources.clone();
    if event.is_delete() {
        debug!(target, source, "namespace gone, removing source");
        tokio::spawn(async move {
            if let Err(e) = sources.remove(&source).await {
                debug!(source, error = %e, "remove namespace source");
            }
        });
    } else if !sources.contains(&source) {
        debug!(target, source, "namespace found, adding source");
        let spec = SourceSpec::new(source.clone())
            .kind(SourceKind::Netns)
            .netns(name);
        tokio::spawn(async move {
            if let Err(e) = sources.add(spec).await {
                warn!(source, error = %e, "add namespace source");
            }
        });
    }
}
