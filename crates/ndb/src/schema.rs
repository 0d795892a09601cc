//! Table descriptors.
//!
//! Every table is described statically: its columns (with the attribute
//! path the value is read from), its index fields and the foreign keys that
//! link it to parent tables. Foreign keys with [`OnDelete::Cascade`] drive
//! cascading deletes and are checked on insert; all foreign keys are
//! followed when marking an object's dependents for a snapshot.

use std::fmt;

use crate::value::Value;

/// Column type, used for key defaults and value coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Text,
}

/// A table column.
#[derive(Debug)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// Nested attribute path the value lives under; empty for top level.
    pub path: &'static [&'static str],
    /// Column type.
    pub ty: ColumnType,
}

const fn int(name: &'static str) -> Column {
    Column {
        name,
        path: &[],
        ty: ColumnType::Int,
    }
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        path: &[],
        ty: ColumnType::Text,
    }
}

const fn nested(path: &'static [&'static str], name: &'static str, ty: ColumnType) -> Column {
    Column { name, path, ty }
}

/// What happens to children when the parent row goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Delete the children too. The reference is enforced on insert.
    Cascade,
    /// Keep the children. The reference is only followed for snapshots.
    Keep,
}

/// A reference from a child table to a parent table.
///
/// Target and transaction flags are implicitly part of every reference.
#[derive(Debug)]
pub struct ForeignKey {
    /// Child columns.
    pub fields: &'static [&'static str],
    /// Parent table.
    pub parent: TableId,
    /// Parent columns.
    pub parent_fields: &'static [&'static str],
    /// Delete behaviour.
    pub on_delete: OnDelete,
}

/// Static description of a table.
#[derive(Debug)]
pub struct TableDescriptor {
    pub id: TableId,
    pub columns: &'static [Column],
    /// Index fields, in key order.
    pub index: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    /// Bookkeeping columns never sent to the kernel.
    pub internal: &'static [&'static str],
}

impl TableDescriptor {
    /// Position of a column.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check whether `name` is a column.
    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Check whether `name` is an index field.
    pub fn is_index(&self, name: &str) -> bool {
        self.index.contains(&name)
    }

    /// Default for a missing index field: "" for text, 0 otherwise.
    pub fn key_default(&self, name: &str) -> Value {
        match self.column(name).map(|c| c.ty) {
            Some(ColumnType::Text) => Value::Str(String::new()),
            _ => Value::Int(0),
        }
    }

    /// Coerce a value to the column type where that is lossless.
    pub fn coerce(&self, name: &str, value: Value) -> Value {
        match (self.column(name).map(|c| c.ty), value) {
            (Some(ColumnType::Int), Value::Str(s)) => match s.parse::<i64>() {
                Ok(v) => Value::Int(v),
                Err(_) => Value::Str(s),
            },
            (Some(ColumnType::Text), Value::Int(v)) => Value::Str(v.to_string()),
            (_, value) => value,
        }
    }
}

/// Table identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableId {
    Interfaces,
    IfinfoBridge,
    IfinfoBond,
    IfinfoVlan,
    IfinfoVxlan,
    IfinfoVeth,
    Addresses,
    Neighbours,
    AfBridgeFdb,
    Routes,
    Nh,
    Metrics,
    EncMpls,
    Rules,
    Netns,
}

impl TableId {
    /// All tables, parents before children.
    pub const ALL: [TableId; 15] = [
        TableId::Interfaces,
        TableId::IfinfoBridge,
        TableId::IfinfoBond,
        TableId::IfinfoVlan,
        TableId::IfinfoVxlan,
        TableId::IfinfoVeth,
        TableId::Addresses,
        TableId::Neighbours,
        TableId::AfBridgeFdb,
        TableId::Routes,
        TableId::Nh,
        TableId::Metrics,
        TableId::EncMpls,
        TableId::Rules,
        TableId::Netns,
    ];

    /// Table name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Interfaces => "interfaces",
            Self::IfinfoBridge => "ifinfo_bridge",
            Self::IfinfoBond => "ifinfo_bond",
            Self::IfinfoVlan => "ifinfo_vlan",
            Self::IfinfoVxlan => "ifinfo_vxlan",
            Self::IfinfoVeth => "ifinfo_veth",
            Self::Addresses => "addresses",
            Self::Neighbours => "neighbours",
            Self::AfBridgeFdb => "af_bridge_fdb",
            Self::Routes => "routes",
            Self::Nh => "nh",
            Self::Metrics => "metrics",
            Self::EncMpls => "enc_mpls",
            Self::Rules => "rules",
            Self::Netns => "netns",
        }
    }

    /// Static descriptor of the table.
    pub fn descriptor(self) -> &'static TableDescriptor {
        match self {
            Self::Interfaces => &INTERFACES,
            Self::IfinfoBridge => &IFINFO_BRIDGE,
            Self::IfinfoBond => &IFINFO_BOND,
            Self::IfinfoVlan => &IFINFO_VLAN,
            Self::IfinfoVxlan => &IFINFO_VXLAN,
            Self::IfinfoVeth => &IFINFO_VETH,
            Self::Addresses => &ADDRESSES,
            Self::Neighbours => &NEIGHBOURS,
            Self::AfBridgeFdb => &AF_BRIDGE_FDB,
            Self::Routes => &ROUTES,
            Self::Nh => &NH,
            Self::Metrics => &METRICS,
            Self::EncMpls => &ENC_MPLS,
            Self::Rules => &RULES,
            Self::Netns => &NETNS,
        }
    }

    /// Per-kind link info table for an interface kind.
    pub fn ifinfo_for_kind(kind: &str) -> Option<Self> {
        match kind {
            "bridge" => Some(Self::IfinfoBridge),
            "bond" => Some(Self::IfinfoBond),
            "vlan" => Some(Self::IfinfoVlan),
            "vxlan" => Some(Self::IfinfoVxlan),
            "veth" => Some(Self::IfinfoVeth),
            _ => None,
        }
    }

    /// Tables holding a foreign key to `self`, with the key.
    pub fn children(self) -> impl Iterator<Item = (TableId, &'static ForeignKey)> {
        Self::ALL.into_iter().flat_map(move |child| {
            child
                .descriptor()
                .foreign_keys
                .iter()
                .filter(move |fk| fk.parent == self)
                .map(move |fk| (child, fk))
        })
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Table definitions
// ============================================================================

const fn iface_ref(fields: &'static [&'static str], on_delete: OnDelete) -> ForeignKey {
    ForeignKey {
        fields,
        parent: TableId::Interfaces,
        parent_fields: &["index"],
        on_delete,
    }
}

const fn route_ref() -> ForeignKey {
    ForeignKey {
        fields: &["route_id"],
        parent: TableId::Routes,
        parent_fields: &["route_id"],
        on_delete: OnDelete::Cascade,
    }
}

static INTERFACES: TableDescriptor = TableDescriptor {
    id: TableId::Interfaces,
    columns: &[
        int("index"),
        int("family"),
        int("ifi_type"),
        int("flags"),
        int("change"),
        text("ifname"),
        text("address"),
        text("broadcast"),
        int("mtu"),
        int("master"),
        int("link"),
        text("qdisc"),
        text("operstate"),
        int("txqlen"),
        text("alias"),
        text("state"),
        nested(&["linkinfo"], "kind", ColumnType::Text),
    ],
    index: &["index"],
    foreign_keys: &[
        iface_ref(&["master"], OnDelete::Keep),
        iface_ref(&["link"], OnDelete::Keep),
    ],
    internal: &[],
};

static IFINFO_BRIDGE: TableDescriptor = TableDescriptor {
    id: TableId::IfinfoBridge,
    columns: &[
        int("index"),
        int("stp_state"),
        int("forward_delay"),
        int("hello_time"),
        int("vlan_filtering"),
    ],
    index: &["index"],
    foreign_keys: &[iface_ref(&["index"], OnDelete::Cascade)],
    internal: &[],
};

static IFINFO_BOND: TableDescriptor = TableDescriptor {
    id: TableId::IfinfoBond,
    columns: &[int("index"), int("mode"), int("miimon")],
    index: &["index"],
    foreign_keys: &[iface_ref(&["index"], OnDelete::Cascade)],
    internal: &[],
};

static IFINFO_VLAN: TableDescriptor = TableDescriptor {
    id: TableId::IfinfoVlan,
    columns: &[int("index"), int("vlan_id"), int("protocol")],
    index: &["index"],
    foreign_keys: &[iface_ref(&["index"], OnDelete::Cascade)],
    internal: &[],
};

static IFINFO_VXLAN: TableDescriptor = TableDescriptor {
    id: TableId::IfinfoVxlan,
    columns: &[
        int("index"),
        int("vxlan_id"),
        int("vxlan_link"),
        text("vxlan_group"),
        int("vxlan_port"),
    ],
    index: &["index"],
    foreign_keys: &[
        iface_ref(&["index"], OnDelete::Cascade),
        iface_ref(&["vxlan_link"], OnDelete::Keep),
    ],
    internal: &[],
};

static IFINFO_VETH: TableDescriptor = TableDescriptor {
    id: TableId::IfinfoVeth,
    columns: &[int("index"), int("peer")],
    index: &["index"],
    foreign_keys: &[iface_ref(&["index"], OnDelete::Cascade)],
    internal: &[],
};

static ADDRESSES: TableDescriptor = TableDescriptor {
    id: TableId::Addresses,
    columns: &[
        int("family"),
        int("prefixlen"),
        int("flags"),
        int("scope"),
        int("index"),
        text("address"),
        text("local"),
        text("label"),
        text("broadcast"),
    ],
    index: &["family", "prefixlen", "index", "address", "local"],
    foreign_keys: &[iface_ref(&["index"], OnDelete::Cascade)],
    internal: &[],
};

const NEIGH_COLUMNS: &[Column] = &[
    int("family"),
    int("ifindex"),
    int("state"),
    int("flags"),
    int("ndm_type"),
    text("dst"),
    text("lladdr"),
    int("vlan"),
    int("probes"),
];

static NEIGHBOURS: TableDescriptor = TableDescriptor {
    id: TableId::Neighbours,
    columns: NEIGH_COLUMNS,
    index: &["ifindex", "dst", "vlan"],
    foreign_keys: &[iface_ref(&["ifindex"], OnDelete::Cascade)],
    internal: &[],
};

static AF_BRIDGE_FDB: TableDescriptor = TableDescriptor {
    id: TableId::AfBridgeFdb,
    columns: NEIGH_COLUMNS,
    index: &["ifindex", "lladdr", "vlan"],
    foreign_keys: &[iface_ref(&["ifindex"], OnDelete::Cascade)],
    internal: &[],
};

static ROUTES: TableDescriptor = TableDescriptor {
    id: TableId::Routes,
    columns: &[
        int("family"),
        int("dst_len"),
        int("src_len"),
        int("tos"),
        int("table"),
        int("proto"),
        int("scope"),
        int("type"),
        int("flags"),
        text("dst"),
        text("src"),
        int("oif"),
        int("iif"),
        text("gateway"),
        int("priority"),
        text("prefsrc"),
        text("via"),
        text("newdst"),
        int("encap_type"),
        text("route_id"),
        int("gc_mark"),
        int("deps"),
    ],
    index: &[
        "family", "dst_len", "tos", "scope", "dst", "oif", "priority", "table", "via", "newdst",
    ],
    foreign_keys: &[
        iface_ref(&["oif"], OnDelete::Cascade),
        iface_ref(&["iif"], OnDelete::Cascade),
    ],
    internal: &["route_id", "gc_mark", "deps"],
};

static NH: TableDescriptor = TableDescriptor {
    id: TableId::Nh,
    columns: &[
        text("route_id"),
        int("nh_id"),
        int("flags"),
        int("hops"),
        int("oif"),
        text("gateway"),
    ],
    index: &["route_id", "nh_id"],
    foreign_keys: &[route_ref(), iface_ref(&["oif"], OnDelete::Cascade)],
    internal: &["route_id"],
};

static METRICS: TableDescriptor = TableDescriptor {
    id: TableId::Metrics,
    columns: &[
        text("route_id"),
        int("mtu"),
        int("window"),
        int("rtt"),
        int("hoplimit"),
        int("advmss"),
    ],
    index: &["route_id"],
    foreign_keys: &[route_ref()],
    internal: &["route_id"],
};

static ENC_MPLS: TableDescriptor = TableDescriptor {
    id: TableId::EncMpls,
    columns: &[text("route_id"), text("label")],
    index: &["route_id"],
    foreign_keys: &[route_ref()],
    internal: &["route_id"],
};

static RULES: TableDescriptor = TableDescriptor {
    id: TableId::Rules,
    columns: &[
        int("family"),
        int("dst_len"),
        int("src_len"),
        int("tos"),
        int("table"),
        int("action"),
        int("flags"),
        text("dst"),
        text("src"),
        text("iifname"),
        text("oifname"),
        int("fwmark"),
        int("priority"),
    ],
    index: &[
        "family", "dst_len", "src_len", "tos", "table", "action", "dst", "src", "priority",
        "iifname", "oifname", "fwmark",
    ],
    foreign_keys: &[],
    internal: &[],
};

static NETNS: TableDescriptor = TableDescriptor {
    id: TableId::Netns,
    columns: &[text("path"), int("nsid")],
    index: &["path"],
    foreign_keys: &[],
    internal: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_consistent() {
        for table in TableId::ALL {
            let desc = table.descriptor();
            assert_eq!(desc.id, table);
            for name in desc.index {
                assert!(desc.has_column(name), "{table}: index {name}");
            }
            for fk in desc.foreign_keys {
                let parent = fk.parent.descriptor();
                for name in fk.fields {
                    assert!(desc.has_column(name), "{table}: fk {name}");
                }
                for name in fk.parent_fields {
                    assert!(parent.has_column(name), "{table}: parent {name}");
                }
            }
        }
    }

    #[test]
    fn test_key_defaults() {
        let routes = TableId::Routes.descriptor();
        assert_eq!(routes.key_default("dst"), Value::Str(String::new()));
        assert_eq!(routes.key_default("table"), Value::Int(0));
    }

    #[test]
    fn test_children() {
        let children: Vec<TableId> = TableId::Routes.children().map(|(t, _)| t).collect();
        assert_eq!(children, vec![TableId::Nh, TableId::Metrics, TableId::EncMpls]);
        assert!(TableId::Interfaces.children().any(|(t, _)| t == TableId::Addresses));
    }

    #[test]
    fn test_coerce() {
        let desc = TableId::Addresses.descriptor();
        assert_eq!(desc.coerce("prefixlen", "24".into()), Value::Int(24));
        assert_eq!(desc.coerce("address", "10.0.0.1".into()), Value::from("10.0.0.1"));
    }
}
