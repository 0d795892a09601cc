//! Per-family object classes.
//!
//! Each family describes how selectors are parsed, which fields reference
//! interfaces, which kernel errors are tolerated and which rows from other
//! tables belong to an object.

pub mod address;
pub mod interface;
pub mod neighbour;
pub mod netns;
pub mod route;
pub mod rule;

use crate::event::{AF_INET, AF_INET6};
use crate::object::ObjectClass;
use crate::schema::TableId;
use crate::value::{Fields, Value};

/// Object class of a table, if the table holds objects.
pub(crate) fn class_for(table: TableId) -> Option<&'static dyn ObjectClass> {
    match table {
        TableId::Interfaces => Some(&interface::Interface),
        TableId::Addresses => Some(&address::Address),
        TableId::Routes => Some(&route::Route),
        TableId::Neighbours => Some(&neighbour::Neighbour),
        TableId::AfBridgeFdb => Some(&neighbour::Fdb),
        TableId::Rules => Some(&rule::Rule),
        TableId::Netns => Some(&netns::Netns),
        _ => None,
    }
}

/// Address family of an IP address string.
pub(crate) fn family_of(address: &str) -> i64 {
    if address.contains(':') { AF_INET6 } else { AF_INET }
}

/// Split `"addr/len"` into address and prefix length. A bare address gets
/// the host prefix of its family.
pub(crate) fn split_prefix(text: &str) -> Result<(String, i64), String> {
    let (addr, len) = match text.split_once('/') {
        Some((addr, len)) => {
            let len = len
                .parse::<i64>()
                .map_err(|_| format!("bad prefix length in {text:?}"))?;
            (addr, len)
        }
        None => (text, -1),
    };
    let family = family_of(addr);
    let max = if family == AF_INET6 { 128 } else { 32 };
    let ip: std::net::IpAddr = addr
        .parse()
        .map_err(|_| format!("not an IP address: {addr:?}"))?;
    if len > max {
        return Err(format!("prefix length {len} out of range"));
    }
    let len = if len < 0 { max } else { len };
    Ok((ip.to_string(), len))
}

/// Rewrite a `"addr/len"` value of `field` into `field` + `len_field`, and
/// derive `family` when it is missing.
pub(crate) fn normalize_prefix(fields: &mut Fields, field: &str, len_field: &str) {
    let Some(Value::Str(text)) = fields.get(field).cloned() else {
        return;
    };
    if text.contains('/')
        && let Ok((addr, len)) = split_prefix(&text)
    {
        fields.insert(field.to_string(), Value::Str(addr));
        fields.entry(len_field.to_string()).or_insert(Value::Int(len));
    }
    if !text.is_empty() && !fields.contains_key("family") {
        fields.insert("family".into(), Value::Int(family_of(&text)));
    }
}

/// Lowercase a MAC address value.
pub(crate) fn lowercase(value: Value) -> Value {
    match value {
        Value::Str(s) => Value::Str(s.to_ascii_lowercase()),
        other => other,
    }
}

/// True when every entry of `expected` appears in `loaded`, recursing into
/// nested attributes and lists.
pub(crate) fn contained_in(expected: &Value, loaded: &Value) -> bool {
    match (expected, loaded) {
        (Value::Nested(expected), Value::Nested(loaded)) => expected
            .iter()
            .all(|(name, value)| loaded.get(name).is_some_and(|l| contained_in(value, l))),
        (Value::List(expected), Value::List(loaded)) => {
            expected.len() == loaded.len()
                && expected.iter().zip(loaded).all(|(e, l)| contained_in(e, l))
        }
        (expected, loaded) => expected == loaded,
    }
}
