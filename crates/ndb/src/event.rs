//! Decoded netlink events.
//!
//! An [`Event`] is what a [`Source`](crate::Source) puts on the queue: a
//! header (message type, originating target, sequence, error payload) plus
//! the fixed message fields and the attribute tree.
//!
//! # Example
//!
//! ```ignore
//! use ndb::event::{Event, RTM_NEWLINK};
//!
//! let event = Event::new(RTM_NEWLINK)
//!     .target("localhost")
//!     .field("index", 2)
//!     .field("flags", 0x1003)
//!     .attr("ifname", "eth0");
//! assert_eq!(event.get_int("index"), Some(2));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Attrs, Value};

// RTNL message types. Delete types are odd, new types even.
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_NEWNEIGH: u16 = 28;
pub const RTM_DELNEIGH: u16 = 29;
pub const RTM_NEWRULE: u16 = 32;
pub const RTM_DELRULE: u16 = 33;
pub const RTM_NEWNSID: u16 = 88;
pub const RTM_DELNSID: u16 = 89;

/// Interface flag: administratively up.
pub const IFF_UP: i64 = 0x1;

pub const AF_INET: i64 = 2;
pub const AF_BRIDGE: i64 = 7;
pub const AF_INET6: i64 = 10;

/// Object family an event (or a request) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Link,
    Address,
    Route,
    Neighbour,
    Rule,
    NetNs,
}

impl EventKind {
    /// All kinds in initial dump order.
    pub const DUMP_ORDER: [EventKind; 6] = [
        EventKind::Link,
        EventKind::Address,
        EventKind::Neighbour,
        EventKind::Route,
        EventKind::Rule,
        EventKind::NetNs,
    ];

    /// Map a message type to its family.
    pub fn from_msg_type(msg_type: u16) -> Option<Self> {
        match msg_type {
            RTM_NEWLINK | RTM_DELLINK => Some(Self::Link),
            RTM_NEWADDR | RTM_DELADDR => Some(Self::Address),
            RTM_NEWROUTE | RTM_DELROUTE => Some(Self::Route),
            RTM_NEWNEIGH | RTM_DELNEIGH => Some(Self::Neighbour),
            RTM_NEWRULE | RTM_DELRULE => Some(Self::Rule),
            RTM_NEWNSID | RTM_DELNSID => Some(Self::NetNs),
            _ => None,
        }
    }

    /// Message type announcing a new or updated object.
    pub fn new_type(self) -> u16 {
        match self {
            Self::Link => RTM_NEWLINK,
            Self::Address => RTM_NEWADDR,
            Self::Route => RTM_NEWROUTE,
            Self::Neighbour => RTM_NEWNEIGH,
            Self::Rule => RTM_NEWRULE,
            Self::NetNs => RTM_NEWNSID,
        }
    }

    /// Message type announcing a removed object.
    pub fn del_type(self) -> u16 {
        self.new_type() + 1
    }

    /// Short name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Address => "addr",
            Self::Route => "route",
            Self::Neighbour => "neigh",
            Self::Rule => "rule",
            Self::NetNs => "netns",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    /// Message type.
    pub msg_type: u16,
    /// Target (source name) the event came from.
    pub target: String,
    /// Sequence number.
    pub sequence: u32,
    /// Embedded failure payload (positive errno), if any.
    pub error: Option<i32>,
    /// How many times the engine rescheduled this event.
    pub(crate) rcounter: u8,
}

/// A decoded netlink event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Event header.
    pub header: Header,
    /// Fixed message fields (family, index, flags, prefixlen ...).
    pub fields: Attrs,
    /// Attribute tree.
    pub attrs: Attrs,
}

impl Event {
    /// Create an empty event of the given message type.
    pub fn new(msg_type: u16) -> Self {
        Self {
            header: Header {
                msg_type,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the originating target.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.header.target = target.into();
        self
    }

    /// Set the sequence number.
    pub fn sequence(mut self, sequence: u32) -> Self {
        self.header.sequence = sequence;
        self
    }

    /// Attach a failure payload.
    pub fn error(mut self, errno: i32) -> Self {
        self.header.error = Some(errno.abs());
        self
    }

    /// Set a fixed message field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.set(name, value);
        self
    }

    /// Set an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.set(name, value);
        self
    }

    /// Family of the event, if known.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_msg_type(self.header.msg_type)
    }

    /// Delete events have an odd message type.
    pub fn is_delete(&self) -> bool {
        self.header.msg_type % 2 == 1
    }

    /// Look up a value: attributes first, then fixed fields.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.fields.get(name))
    }

    /// Look up an integer value.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    /// Look up a text value.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Look up a value below a nested attribute path.
    pub fn get_nested(&self, path: &[&str], name: &str) -> Option<&Value> {
        if path.is_empty() {
            return self.get(name);
        }
        self.attrs.get_path(path)?.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EventKind::from_msg_type(RTM_NEWLINK), Some(EventKind::Link));
        assert_eq!(EventKind::from_msg_type(RTM_DELROUTE), Some(EventKind::Route));
        assert_eq!(EventKind::from_msg_type(3), None);
        for kind in EventKind::DUMP_ORDER {
            assert_eq!(EventKind::from_msg_type(kind.del_type()), Some(kind));
        }
    }

    #[test]
    fn test_is_delete() {
        assert!(Event::new(RTM_DELADDR).is_delete());
        assert!(!Event::new(RTM_NEWADDR).is_delete());
    }

    #[test]
    fn test_get_prefers_attrs() {
        let event = Event::new(RTM_NEWROUTE)
            .field("table", 254)
            .attr("table", 1000)
            .attr("dst", Value::Null)
            .field("dst", "10.0.0.0");
        assert_eq!(event.get_int("table"), Some(1000));
        // Null attributes fall through to the fixed fields.
        assert_eq!(event.get_str("dst"), Some("10.0.0.0"));
    }

    #[test]
    fn test_get_nested() {
        let event = Event::new(RTM_NEWLINK)
            .attr("linkinfo", Attrs::new().with("kind", "bridge"));
        assert_eq!(
            event.get_nested(&["linkinfo"], "kind"),
            Some(&Value::from("bridge"))
        );
        assert_eq!(event.get_nested(&["linkinfo"], "data"), None);
    }
}
