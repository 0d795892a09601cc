//! In-process kernel simulator.
//!
//! [`SimKernel`] implements [`Connector`] and [`Transport`] on top of a
//! small model of the RTNL state of one or more network namespaces: links,
//! addresses, routes, neighbours and rules. Requests are acknowledged
//! without payload and their effects are broadcast to every bound transport
//! of the namespace, like the kernel does with multicast groups.
//!
//! The model reproduces the side effects NDB has to cope with:
//!
//! - a link going down drops the routes through it without notification
//! - removing the last IPv4 address of a link drops its routes silently
//! - addresses on an up link install a prefix route (announced)
//! - deleting a link deletes its addresses, routes and VLANs and detaches
//!   its ports
//!
//! Faults can be injected to exercise the error paths: failed receives,
//! refused connections, errno replies and requests that are acknowledged
//! but never take effect.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ndb::{Ndb, lab::SimKernel};
//!
//! let kernel = SimKernel::new();
//! let ndb = Ndb::builder().connector(Arc::new(kernel.clone())).build().await?;
//! kernel.fail_next_recv(SimKernel::ROOT);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::{AF_BRIDGE, AF_INET, AF_INET6, Event, EventKind, IFF_UP};
use crate::schema::TableId;
use crate::source::{SourceKind, SourceSpec};
use crate::transport::{Connector, Request, Transport, Verb};
use crate::value::{Attrs, Value};

const IFF_BROADCAST: i64 = 0x2;
const IFF_LOOPBACK: i64 = 0x8;
const IFF_RUNNING: i64 = 0x40;
const IFF_LOWER_UP: i64 = 0x10000;

const ARPHRD_ETHER: i64 = 1;
const ARPHRD_LOOPBACK: i64 = 772;

const RT_TABLE_MAIN: i64 = 254;
const RT_TABLE_DEFAULT: i64 = 253;
const RT_TABLE_LOCAL: i64 = 255;
const RTPROT_KERNEL: i64 = 2;
const RTPROT_BOOT: i64 = 3;
const RT_SCOPE_UNIVERSE: i64 = 0;
const RT_SCOPE_LINK: i64 = 253;
const RT_SCOPE_HOST: i64 = 254;
const RTN_UNICAST: i64 = 1;
const FR_ACT_TO_TBL: i64 = 1;
const IFA_F_PERMANENT: i64 = 0x80;
const NUD_PERMANENT: i64 = 0x80;

const NETNS_RUN_DIR: &str = "/var/run/netns";

const ADDR_FIXED: &[&str] = &["family", "prefixlen", "flags", "scope", "index"];
const ROUTE_FIXED: &[&str] = &[
    "family", "dst_len", "src_len", "tos", "proto", "scope", "type", "flags",
];
const ROUTE_ATTRS: &[&str] = &[
    "table",
    "dst",
    "src",
    "oif",
    "iif",
    "gateway",
    "priority",
    "prefsrc",
    "multipath",
    "metrics",
    "encap_type",
    "encap",
];
const ROUTE_KEY: &[&str] = &["family", "dst", "dst_len", "tos", "table", "priority"];
const NEIGH_FIXED: &[&str] = &["family", "ifindex", "state", "flags", "ndm_type"];
const NEIGH_ATTRS: &[&str] = &["dst", "lladdr", "vlan", "probes"];
const RULE_FIXED: &[&str] = &["family", "dst_len", "src_len", "tos", "action", "flags"];
const RULE_ATTRS: &[&str] = &["table", "dst", "src", "iifname", "oifname", "fwmark", "priority"];

fn int(attrs: &Attrs, name: &str) -> i64 {
    attrs.get_int(name).unwrap_or(0)
}

fn text<'a>(attrs: &'a Attrs, name: &str) -> &'a str {
    attrs.get_str(name).unwrap_or("")
}

fn present(attrs: &Attrs, name: &str) -> Option<Value> {
    attrs.get(name).filter(|v| !v.is_null()).cloned()
}

fn family_of(address: &str) -> i64 {
    if address.contains(':') { AF_INET6 } else { AF_INET }
}

fn ipv4_mask(prefixlen: i64) -> u32 {
    u32::MAX
        .checked_shl(32 - prefixlen.clamp(0, 32) as u32)
        .unwrap_or(0)
}

fn ipv4_network(address: &str, prefixlen: i64) -> Option<Ipv4Addr> {
    let address: Ipv4Addr = address.parse().ok()?;
    Some(Ipv4Addr::from(u32::from(address) & ipv4_mask(prefixlen)))
}

fn render(msg_type: u16, row: &Attrs, fixed: &[&str], attrs: &[&str]) -> Event {
    let mut event = Event::new(msg_type);
    for name in fixed {
        event.fields.set(*name, row.get(name).cloned().unwrap_or(Value::Int(0)));
    }
    for name in attrs {
        if let Some(value) = present(row, name) {
            event.attrs.set(*name, value);
        }
    }
    event
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone)]
struct Link {
    index: i64,
    ifname: String,
    kind: Option<String>,
    ifi_type: i64,
    flags: i64,
    mtu: i64,
    address: String,
    master: i64,
    link: i64,
    alias: Option<String>,
    txqlen: i64,
    info: Attrs,
}

impl Link {
    fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    fn set_up(&mut self, up: bool) {
        let running = IFF_UP | IFF_RUNNING | IFF_LOWER_UP;
        if up {
            self.flags |= running;
        } else {
            self.flags &= !running;
        }
    }

    fn event(&self, msg_type: u16) -> Event {
        let mut event = Event::new(msg_type)
            .field("family", 0)
            .field("ifi_type", self.ifi_type)
            .field("index", self.index)
            .field("flags", self.flags)
            .field("change", 0)
            .attr("ifname", self.ifname.as_str())
            .attr("address", self.address.as_str())
            .attr("mtu", self.mtu)
            .attr("txqlen", self.txqlen)
            .attr("qdisc", "noqueue")
            .attr("operstate", if self.is_up() { "UP" } else { "DOWN" });
        if self.ifi_type == ARPHRD_ETHER {
            event.attrs.set("broadcast", "ff:ff:ff:ff:ff:ff");
        }
        if self.master != 0 {
            event.attrs.set("master", self.master);
        }
        if self.link != 0 {
            event.attrs.set("link", self.link);
        }
        if let Some(alias) = &self.alias {
            event.attrs.set("alias", alias.as_str());
        }
        if let Some(kind) = &self.kind {
            let mut linkinfo = Attrs::new().with("kind", kind.as_str());
            if !self.info.is_empty() {
                linkinfo.set("data", self.info.clone());
            }
            event.attrs.set("linkinfo", linkinfo);
        }
        event
    }

    /// Flat view for inspection.
    fn fields(&self) -> Attrs {
        let mut fields = Attrs::new()
            .with("index", self.index)
            .with("ifname", self.ifname.as_str())
            .with("kind", self.kind.clone())
            .with("flags", self.flags)
            .with("state", if self.is_up() { "up" } else { "down" })
            .with("mtu", self.mtu)
            .with("address", self.address.as_str())
            .with("master", self.master)
            .with("link", self.link)
            .with("alias", self.alias.clone());
        for (name, value) in self.info.iter() {
            fields.set(name, value.clone());
        }
        fields
    }
}

#[derive(Debug)]
enum Feed {
    Events(Vec<Event>),
    Fail(String),
}

#[derive(Debug)]
struct Namespace {
    nsid: i64,
    links: BTreeMap<i64, Link>,
    addresses: Vec<Attrs>,
    routes: Vec<Attrs>,
    neighbours: Vec<Attrs>,
    rules: Vec<Attrs>,
    subscribers: Vec<mpsc::UnboundedSender<Feed>>,
}

impl Namespace {
    fn new(nsid: i64) -> Self {
        let mut ns = Self {
            nsid,
            links: BTreeMap::new(),
            addresses: Vec::new(),
            routes: Vec::new(),
            neighbours: Vec::new(),
            rules: Vec::new(),
            subscribers: Vec::new(),
        };
        ns.links.insert(
            1,
            Link {
                index: 1,
                ifname: "lo".into(),
                kind: None,
                ifi_type: ARPHRD_LOOPBACK,
                flags: IFF_LOOPBACK | IFF_UP | IFF_RUNNING | IFF_LOWER_UP,
                mtu: 65536,
                address: "00:00:00:00:00:00".into(),
                master: 0,
                link: 0,
                alias: None,
                txqlen: 1000,
                info: Attrs::new(),
            },
        );
        ns.addresses.push(
            Attrs::new()
                .with("family", AF_INET)
                .with("prefixlen", 8)
                .with("flags", IFA_F_PERMANENT)
                .with("scope", RT_SCOPE_HOST)
                .with("index", 1)
                .with("address", "127.0.0.1")
                .with("local", "127.0.0.1")
                .with("label", "lo"),
        );
        for (priority, table) in [(0, RT_TABLE_LOCAL), (32766, RT_TABLE_MAIN), (32767, RT_TABLE_DEFAULT)] {
            ns.rules.push(
                Attrs::new()
                    .with("family", AF_INET)
                    .with("action", FR_ACT_TO_TBL)
                    .with("table", table)
                    .with("priority", priority),
            );
        }
        ns
    }

    /// The root namespace also has an uplink with an address and a
    /// default route.
    fn root() -> Self {
        let mut ns = Self::new(0);
        let mut eth0 = Link {
            index: 2,
            ifname: "eth0".into(),
            kind: None,
            ifi_type: ARPHRD_ETHER,
            flags: IFF_BROADCAST,
            mtu: 1500,
            address: "52:54:00:12:34:56".into(),
            master: 0,
            link: 0,
            alias: None,
            txqlen: 1000,
            info: Attrs::new(),
        };
        eth0.set_up(true);
        ns.links.insert(2, eth0);
        let mut quiet = Vec::new();
        let address = Attrs::new()
            .with("family", AF_INET)
            .with("prefixlen", 24)
            .with("index", 2)
            .with("address", "192.168.122.10");
        // Infallible on a fresh namespace.
        let _ = ns.address_create(&address, &mut quiet);
        ns.routes.push(
            Attrs::new()
                .with("family", AF_INET)
                .with("dst_len", 0)
                .with("table", RT_TABLE_MAIN)
                .with("proto", RTPROT_BOOT)
                .with("scope", RT_SCOPE_UNIVERSE)
                .with("type", RTN_UNICAST)
                .with("oif", 2)
                .with("gateway", "192.168.122.1"),
        );
        ns
    }

    fn dump(&self, kind: EventKind, nsids: &[(String, i64)]) -> Vec<Event> {
        match kind {
            EventKind::Link => self
                .links
                .values()
                .map(|link| link.event(kind.new_type()))
                .collect(),
            EventKind::Address => self
                .addresses
                .iter()
                .map(|row| address_event(row, kind.new_type()))
                .collect(),
            EventKind::Route => self
                .routes
                .iter()
                .map(|row| route_event(row, kind.new_type()))
                .collect(),
            EventKind::Neighbour => self
                .neighbours
                .iter()
                .map(|row| neigh_event(row, kind.new_type()))
                .collect(),
            EventKind::Rule => self
                .rules
                .iter()
                .map(|row| rule_event(row, kind.new_type()))
                .collect(),
            EventKind::NetNs => nsids
                .iter()
                .map(|(name, nsid)| netns_event(name, *nsid, kind.new_type()))
                .collect(),
        }
    }

    fn broadcast(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        trace!(count = events.len(), "broadcast");
        self.subscribers
            .retain(|tx| tx.send(Feed::Events(events.clone())).is_ok());
    }

    fn fail_subscribers(&mut self, message: &str) {
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(Feed::Fail(message.to_string()));
        }
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    fn find_link(&self, request: &Attrs) -> Option<i64> {
        let index = int(request, "index");
        if index > 0 && self.links.contains_key(&index) {
            return Some(index);
        }
        let ifname = request.get_str("ifname")?;
        self.links
            .values()
            .find(|link| link.ifname == ifname)
            .map(|link| link.index)
    }

    fn link_by_name(&self, ifname: &str) -> Option<&Link> {
        self.links.values().find(|link| link.ifname == ifname)
    }

    fn next_index(&self) -> i64 {
        self.links.keys().next_back().copied().unwrap_or(0) + 1
    }

    fn check_master(&self, index: i64, master: i64) -> std::result::Result<(), i32> {
        if master == 0 {
            return Ok(());
        }
        match self.links.get(&master) {
            Some(link)
                if master != index
                    && matches!(link.kind.as_deref(), Some("bridge") | Some("bond")) =>
            {
                Ok(())
            }
            _ => Err(libc::EINVAL),
        }
    }

    fn wanted_up(request: &Attrs) -> Option<bool> {
        match request.get_str("state") {
            Some(state) => Some(state == "up"),
            None => request.get_int("flags").map(|flags| flags & IFF_UP != 0),
        }
    }

    fn link_info(kind: &str, request: &Attrs) -> Attrs {
        let mut info = Attrs::new();
        if let Some(table) = TableId::ifinfo_for_kind(kind) {
            for column in table.descriptor().columns {
                if column.name == "index" || column.name == "peer" {
                    continue;
                }
                if let Some(value) = present(request, column.name) {
                    info.set(column.name, value);
                }
            }
        }
        info
    }

    fn link_create(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let ifname = request.get_str("ifname").ok_or(libc::EINVAL)?.to_string();
        if self.link_by_name(&ifname).is_some() {
            return Err(libc::EEXIST);
        }
        let kind = request.get_str("kind").ok_or(libc::EOPNOTSUPP)?.to_string();
        if !matches!(
            kind.as_str(),
            "dummy" | "bridge" | "bond" | "vlan" | "vxlan" | "veth"
        ) {
            return Err(libc::EOPNOTSUPP);
        }
        let wanted = int(request, "index");
        let index = if wanted > 0 && !self.links.contains_key(&wanted) {
            wanted
        } else if wanted > 0 {
            return Err(libc::EEXIST);
        } else {
            self.next_index()
        };
        let master = int(request, "master");
        self.check_master(index, master)?;
        let parent = int(request, "link");
        if kind == "vlan" {
            if parent == 0 {
                return Err(libc::EINVAL);
            }
            if !self.links.contains_key(&parent) {
                return Err(libc::ENODEV);
            }
        }
        let mut info = Self::link_info(&kind, request);
        if kind == "vxlan"
            && let Some(vxlan_link) = info.get_int("vxlan_link")
            && vxlan_link != 0
            && !self.links.contains_key(&vxlan_link)
        {
            return Err(libc::ENODEV);
        }

        let mut link = Link {
            index,
            ifname,
            kind: Some(kind.clone()),
            ifi_type: ARPHRD_ETHER,
            flags: IFF_BROADCAST,
            mtu: request.get_int("mtu").unwrap_or(1500),
            address: request
                .get_str("address")
                .map(str::to_lowercase)
                .unwrap_or_else(|| format!("52:54:00:00:{:02x}:{:02x}", index >> 8 & 0xff, index & 0xff)),
            master,
            link: parent,
            alias: request.get_str("alias").map(str::to_string),
            txqlen: request.get_int("txqlen").unwrap_or(1000),
            info: Attrs::new(),
        };
        link.set_up(Self::wanted_up(request).unwrap_or(false));

        if kind == "veth" {
            let peer_name = match request.get("peer") {
                Some(Value::Str(name)) => name.clone(),
                Some(Value::Nested(attrs)) => text(attrs, "ifname").to_string(),
                _ => format!("veth{}", index + 1),
            };
            if peer_name.is_empty() || peer_name == link.ifname || self.link_by_name(&peer_name).is_some() {
                return Err(libc::EEXIST);
            }
            let peer_index = (index + 1).max(self.next_index());
            let mut peer = link.clone();
            peer.index = peer_index;
            peer.ifname = peer_name;
            peer.master = 0;
            peer.alias = None;
            peer.address = format!("52:54:00:01:{:02x}:{:02x}", peer_index >> 8 & 0xff, peer_index & 0xff);
            peer.set_up(false);
            peer.info = Attrs::new().with("peer", index);
            info.set("peer", peer_index);
            out.push(peer.event(EventKind::Link.new_type()));
            self.links.insert(peer_index, peer);
        }
        link.info = info;
        debug!(index, ifname = %link.ifname, kind, "link created");
        out.push(link.event(EventKind::Link.new_type()));
        self.links.insert(index, link);
        Ok(())
    }

    fn link_modify(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let index = self.find_link(request).ok_or(libc::ENODEV)?;
        if let Some(ifname) = request.get_str("ifname")
            && self
                .link_by_name(ifname)
                .is_some_and(|other| other.index != index)
        {
            return Err(libc::EEXIST);
        }
        if let Some(master) = request.get("master") {
            self.check_master(index, master.as_int().unwrap_or(0))?;
        }
        let up = Self::wanted_up(request);
        let Some(link) = self.links.get_mut(&index) else {
            return Err(libc::ENODEV);
        };
        let was_up = link.is_up();
        if let Some(ifname) = request.get_str("ifname") {
            link.ifname = ifname.to_string();
        }
        if let Some(mtu) = request.get_int("mtu") {
            link.mtu = mtu;
        }
        if let Some(address) = request.get_str("address") {
            link.address = address.to_lowercase();
        }
        if let Some(alias) = request.get("alias") {
            link.alias = alias.as_str().map(str::to_string);
        }
        if let Some(txqlen) = request.get_int("txqlen") {
            link.txqlen = txqlen;
        }
        if let Some(master) = request.get("master") {
            link.master = master.as_int().unwrap_or(0);
        }
        if let Some(kind) = link.kind.clone() {
            for (name, value) in Self::link_info(&kind, request) {
                link.info.set(name, value);
            }
        }
        if let Some(up) = up {
            link.set_up(up);
        }
        let now_up = link.is_up();
        out.push(link.event(EventKind::Link.new_type()));

        if was_up && !now_up {
            // Silent, like the kernel.
            self.routes
                .retain(|route| int(route, "oif") != index && int(route, "iif") != index);
        } else if !was_up && now_up {
            let prefixes: Vec<Attrs> = self
                .addresses
                .iter()
                .filter(|addr| int(addr, "index") == index)
                .cloned()
                .collect();
            for addr in prefixes {
                self.add_prefix_route(&addr, out);
            }
        }
        Ok(())
    }

    fn link_delete(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let index = self.find_link(request).ok_or(libc::ENODEV)?;
        if index == 1 {
            return Err(libc::EOPNOTSUPP);
        }
        self.remove_link(index, out);
        Ok(())
    }

    fn remove_link(&mut self, index: i64, out: &mut Vec<Event>) {
        let Some(link) = self.links.remove(&index) else {
            return;
        };
        debug!(index, ifname = %link.ifname, "link deleted");
        self.addresses.retain(|addr| int(addr, "index") != index);
        self.routes
            .retain(|route| int(route, "oif") != index && int(route, "iif") != index);
        self.neighbours.retain(|neigh| int(neigh, "ifindex") != index);
        out.push(link.event(EventKind::Link.del_type()));

        let ports: Vec<i64> = self
            .links
            .values()
            .filter(|l| l.master == index)
            .map(|l| l.index)
            .collect();
        for port in ports {
            if let Some(port) = self.links.get_mut(&port) {
                port.master = 0;
                out.push(port.event(EventKind::Link.new_type()));
            }
        }
        let mut stacked: Vec<i64> = self
            .links
            .values()
            .filter(|l| l.link == index && l.kind.as_deref() == Some("vlan"))
            .map(|l| l.index)
            .collect();
        if let Some(peer) = link.info.get_int("peer").filter(|_| link.kind.as_deref() == Some("veth")) {
            stacked.push(peer);
        }
        for child in stacked {
            self.remove_link(child, out);
        }
    }

    // ------------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------------

    fn find_address(&self, request: &Attrs) -> Option<usize> {
        let index = int(request, "index");
        let address = text(request, "address");
        let prefixlen = request.get_int("prefixlen");
        self.addresses.iter().position(|addr| {
            int(addr, "index") == index
                && text(addr, "address") == address
                && prefixlen.is_none_or(|len| int(addr, "prefixlen") == len)
        })
    }

    fn prefix_route(addr: &Attrs) -> Option<Attrs> {
        if int(addr, "family") != AF_INET || int(addr, "prefixlen") >= 32 {
            return None;
        }
        let address = text(addr, "address");
        let network = ipv4_network(address, int(addr, "prefixlen"))?;
        Some(
            Attrs::new()
                .with("family", AF_INET)
                .with("dst_len", int(addr, "prefixlen"))
                .with("table", RT_TABLE_MAIN)
                .with("proto", RTPROT_KERNEL)
                .with("scope", RT_SCOPE_LINK)
                .with("type", RTN_UNICAST)
                .with("dst", network.to_string())
                .with("oif", int(addr, "index"))
                .with("prefsrc", address),
        )
    }

    fn add_prefix_route(&mut self, addr: &Attrs, out: &mut Vec<Event>) {
        let index = int(addr, "index");
        let Some(link) = self.links.get(&index) else {
            return;
        };
        if !link.is_up() || link.ifi_type == ARPHRD_LOOPBACK {
            return;
        }
        let Some(route) = Self::prefix_route(addr) else {
            return;
        };
        if self.find_route(&route).is_none() {
            out.push(route_event(&route, EventKind::Route.new_type()));
            self.routes.push(route);
        }
    }

    fn address_create(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let index = int(request, "index");
        let label = self.links.get(&index).ok_or(libc::ENODEV)?.ifname.clone();
        let address = request.get_str("address").ok_or(libc::EINVAL)?;
        let ip: IpAddr = address.parse().map_err(|_| libc::EINVAL)?;
        let family = family_of(address);
        let prefixlen = request
            .get_int("prefixlen")
            .unwrap_or(if family == AF_INET { 32 } else { 128 });
        let mut row = Attrs::new()
            .with("family", family)
            .with("prefixlen", prefixlen)
            .with("flags", IFA_F_PERMANENT)
            .with("scope", RT_SCOPE_UNIVERSE)
            .with("index", index)
            .with("address", ip.to_string());
        if family == AF_INET {
            row.set("local", request.get_str("local").unwrap_or(address));
            row.set("label", request.get_str("label").unwrap_or(&label));
        }
        if self.find_address(&row).is_some() {
            return Err(libc::EEXIST);
        }
        out.push(address_event(&row, EventKind::Address.new_type()));
        self.add_prefix_route(&row, out);
        self.addresses.push(row);
        Ok(())
    }

    fn address_modify(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let pos = self.find_address(request).ok_or(libc::EADDRNOTAVAIL)?;
        let row = &mut self.addresses[pos];
        for name in ["label", "broadcast", "flags", "scope"] {
            if let Some(value) = present(request, name) {
                row.set(name, value);
            }
        }
        out.push(address_event(row, EventKind::Address.new_type()));
        Ok(())
    }

    fn address_delete(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let pos = self.find_address(request).ok_or(libc::EADDRNOTAVAIL)?;
        let row = self.addresses.remove(pos);
        let index = int(&row, "index");
        out.push(address_event(&row, EventKind::Address.del_type()));
        if let Some(route) = Self::prefix_route(&row)
            && let Some(pos) = self.find_route(&route)
        {
            let route = self.routes.remove(pos);
            out.push(route_event(&route, EventKind::Route.del_type()));
        }
        let left = self
            .addresses
            .iter()
            .any(|addr| int(addr, "index") == index && int(addr, "family") == AF_INET);
        if !left && int(&row, "family") == AF_INET {
            self.routes.retain(|route| int(route, "oif") != index);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------------

    fn route_key(row: &Attrs) -> Vec<Value> {
        ROUTE_KEY
            .iter()
            .map(|name| match *name {
                "table" => Value::Int(row.get_int("table").unwrap_or(RT_TABLE_MAIN)),
                "dst" => Value::from(text(row, "dst")),
                "family" => Value::Int(
                    row.get_int("family")
                        .unwrap_or_else(|| family_of(text(row, "dst"))),
                ),
                name => Value::Int(int(row, name)),
            })
            .collect()
    }

    fn find_route(&self, request: &Attrs) -> Option<usize> {
        let key = Self::route_key(request);
        self.routes.iter().position(|route| Self::route_key(route) == key)
    }

    /// Interface reaching `gateway` through a connected network.
    fn gateway_oif(&self, gateway: &str, oif: i64) -> Option<i64> {
        let gateway: Ipv4Addr = gateway.parse().ok()?;
        self.addresses.iter().find_map(|addr| {
            let index = int(addr, "index");
            if int(addr, "family") != AF_INET || (oif != 0 && index != oif) {
                return None;
            }
            if !self.links.get(&index).is_some_and(Link::is_up) {
                return None;
            }
            let mask = ipv4_mask(int(addr, "prefixlen"));
            let network = ipv4_network(text(addr, "address"), int(addr, "prefixlen"))?;
            (u32::from(gateway) & mask == u32::from(network)).then_some(index)
        })
    }

    fn check_route_path(&self, oif: i64, gateway: Option<&str>) -> std::result::Result<i64, i32> {
        if oif != 0 {
            let link = self.links.get(&oif).ok_or(libc::ENODEV)?;
            if !link.is_up() {
                return Err(libc::ENETDOWN);
            }
        }
        match gateway.filter(|gw| family_of(gw) == AF_INET) {
            Some(gateway) => self.gateway_oif(gateway, oif).ok_or(libc::ENETUNREACH),
            None => Ok(oif),
        }
    }

    fn route_row(&self, request: &Attrs) -> std::result::Result<Attrs, i32> {
        let dst = text(request, "dst");
        let family = request.get_int("family").unwrap_or_else(|| {
            if dst.is_empty() {
                family_of(text(request, "gateway"))
            } else {
                family_of(dst)
            }
        });
        let mut row = Attrs::new()
            .with("family", family)
            .with("dst_len", int(request, "dst_len"))
            .with("src_len", int(request, "src_len"))
            .with("tos", int(request, "tos"))
            .with("table", request.get_int("table").unwrap_or(RT_TABLE_MAIN))
            .with("proto", request.get_int("proto").unwrap_or(RTPROT_BOOT))
            .with("scope", request.get_int("scope").unwrap_or(RT_SCOPE_UNIVERSE))
            .with("type", request.get_int("type").unwrap_or(RTN_UNICAST))
            .with("flags", int(request, "flags"));
        for name in ROUTE_ATTRS {
            if *name == "table" {
                continue;
            }
            if let Some(value) = present(request, name) {
                if *name == "dst" && value.as_str() == Some("") {
                    continue;
                }
                row.set(*name, value);
            }
        }

        let oif = self.check_route_path(int(&row, "oif"), row.get_str("gateway"))?;
        if oif != 0 {
            row.set("oif", oif);
        }
        let iif = int(&row, "iif");
        if iif != 0 && !self.links.contains_key(&iif) {
            return Err(libc::ENODEV);
        }
        if let Some(hops) = row.get("multipath").and_then(Value::as_list) {
            let mut resolved = Vec::with_capacity(hops.len());
            for hop in hops {
                let mut hop = hop.as_nested().cloned().ok_or(libc::EINVAL)?;
                let oif = self.check_route_path(int(&hop, "oif"), hop.get_str("gateway"))?;
                hop.set("oif", oif);
                resolved.push(Value::Nested(hop));
            }
            row.set("multipath", resolved);
        }
        Ok(row)
    }

    fn route_create(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let row = self.route_row(request)?;
        if self.find_route(&row).is_some() {
            return Err(libc::EEXIST);
        }
        out.push(route_event(&row, EventKind::Route.new_type()));
        self.routes.push(row);
        Ok(())
    }

    /// Replace semantics: update the route with the same key, or add it.
    fn route_modify(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let merged = match self.find_route(request) {
            Some(pos) => {
                let mut merged = self.routes[pos].clone();
                for (name, value) in request.iter() {
                    merged.set(name, value.clone());
                }
                merged
            }
            None => request.clone(),
        };
        let row = self.route_row(&merged)?;
        match self.find_route(&row) {
            Some(pos) => self.routes[pos] = row.clone(),
            None => self.routes.push(row.clone()),
        }
        out.push(route_event(&row, EventKind::Route.new_type()));
        Ok(())
    }

    fn route_delete(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let pos = self.find_route(request).ok_or(libc::ESRCH)?;
        let row = self.routes.remove(pos);
        out.push(route_event(&row, EventKind::Route.del_type()));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Neighbours
    // ------------------------------------------------------------------------

    fn neigh_key(row: &Attrs) -> (i64, i64, String, i64) {
        let family = row.get_int("family").unwrap_or_else(|| match row.get_str("dst") {
            Some(dst) if !dst.is_empty() => family_of(dst),
            _ => AF_BRIDGE,
        });
        let addr = if family == AF_BRIDGE {
            text(row, "lladdr").to_lowercase()
        } else {
            text(row, "dst").to_string()
        };
        (family, int(row, "ifindex"), addr, int(row, "vlan"))
    }

    fn find_neigh(&self, request: &Attrs) -> Option<usize> {
        let key = Self::neigh_key(request);
        self.neighbours.iter().position(|n| Self::neigh_key(n) == key)
    }

    fn neigh_row(&self, request: &Attrs) -> std::result::Result<Attrs, i32> {
        let ifindex = int(request, "ifindex");
        if !self.links.contains_key(&ifindex) {
            return Err(libc::ENODEV);
        }
        let family = request
            .get_int("family")
            .unwrap_or_else(|| family_of(text(request, "dst")));
        let mut row = Attrs::new()
            .with("family", family)
            .with("ifindex", ifindex)
            .with("state", request.get_int("state").unwrap_or(NUD_PERMANENT))
            .with("flags", int(request, "flags"))
            .with("ndm_type", request.get_int("ndm_type").unwrap_or(RTN_UNICAST));
        for name in NEIGH_ATTRS {
            if let Some(value) = present(request, name) {
                let value = match (*name, value) {
                    ("lladdr", Value::Str(mac)) => Value::Str(mac.to_lowercase()),
                    (_, value) => value,
                };
                row.set(*name, value);
            }
        }
        if family != AF_BRIDGE && text(&row, "dst").is_empty() {
            return Err(libc::EINVAL);
        }
        Ok(row)
    }

    fn neigh_create(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let row = self.neigh_row(request)?;
        if self.find_neigh(&row).is_some() {
            return Err(libc::EEXIST);
        }
        out.push(neigh_event(&row, EventKind::Neighbour.new_type()));
        self.neighbours.push(row);
        Ok(())
    }

    fn neigh_modify(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let mut merged = match self.find_neigh(request) {
            Some(pos) => self.neighbours[pos].clone(),
            None => Attrs::new(),
        };
        for (name, value) in request.iter() {
            merged.set(name, value.clone());
        }
        let row = self.neigh_row(&merged)?;
        match self.find_neigh(&row) {
            Some(pos) => self.neighbours[pos] = row.clone(),
            None => self.neighbours.push(row.clone()),
        }
        out.push(neigh_event(&row, EventKind::Neighbour.new_type()));
        Ok(())
    }

    fn neigh_delete(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let pos = self.find_neigh(request).ok_or(libc::ENOENT)?;
        let row = self.neighbours.remove(pos);
        out.push(neigh_event(&row, EventKind::Neighbour.del_type()));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    fn rule_key(row: &Attrs) -> Vec<Value> {
        TableId::Rules
            .descriptor()
            .index
            .iter()
            .map(|name| match *name {
                "family" => Value::Int(row.get_int("family").unwrap_or(AF_INET)),
                "action" => Value::Int(row.get_int("action").unwrap_or(FR_ACT_TO_TBL)),
                "dst" | "src" | "iifname" | "oifname" => Value::from(text(row, name)),
                name => Value::Int(int(row, name)),
            })
            .collect()
    }

    fn find_rule(&self, request: &Attrs) -> Option<usize> {
        let key = Self::rule_key(request);
        self.rules.iter().position(|rule| Self::rule_key(rule) == key)
    }

    fn rule_create(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let mut row = Attrs::new()
            .with("family", request.get_int("family").unwrap_or(AF_INET))
            .with("action", request.get_int("action").unwrap_or(FR_ACT_TO_TBL))
            .with("table", request.get_int("table").unwrap_or(RT_TABLE_MAIN));
        for name in RULE_FIXED.iter().chain(RULE_ATTRS) {
            if row.contains(name) {
                continue;
            }
            if let Some(value) = present(request, name) {
                row.set(*name, value);
            }
        }
        if !row.contains("priority") {
            // The kernel picks the slot above the first non-zero priority.
            let lowest = self
                .rules
                .iter()
                .map(|rule| int(rule, "priority"))
                .filter(|p| *p > 0)
                .min()
                .unwrap_or(32766);
            row.set("priority", lowest - 1);
        }
        if self.find_rule(&row).is_some() {
            return Err(libc::EEXIST);
        }
        out.push(rule_event(&row, EventKind::Rule.new_type()));
        self.rules.push(row);
        Ok(())
    }

    fn rule_delete(&mut self, request: &Attrs, out: &mut Vec<Event>) -> std::result::Result<(), i32> {
        let pos = self.find_rule(request).ok_or(libc::ENOENT)?;
        let row = self.rules.remove(pos);
        out.push(rule_event(&row, EventKind::Rule.del_type()));
        Ok(())
    }
}

fn address_event(row: &Attrs, msg_type: u16) -> Event {
    render(msg_type, row, ADDR_FIXED, &["address", "local", "label", "broadcast"])
}

fn route_event(row: &Attrs, msg_type: u16) -> Event {
    render(msg_type, row, ROUTE_FIXED, ROUTE_ATTRS)
}

fn neigh_event(row: &Attrs, msg_type: u16) -> Event {
    render(msg_type, row, NEIGH_FIXED, NEIGH_ATTRS)
}

fn rule_event(row: &Attrs, msg_type: u16) -> Event {
    render(msg_type, row, RULE_FIXED, RULE_ATTRS)
}

fn netns_event(name: &str, nsid: i64, msg_type: u16) -> Event {
    Event::new(msg_type)
        .field("nsid", nsid)
        .attr("path", format!("{NETNS_RUN_DIR}/{name}"))
}

fn netns_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ============================================================================
// Kernel
// ============================================================================

#[derive(Debug, Default)]
struct Faults {
    connect: u32,
    requests: Vec<(EventKind, Verb, i32)>,
    drop_requests: bool,
}

#[derive(Debug)]
struct KernelState {
    namespaces: BTreeMap<String, Namespace>,
    next_nsid: i64,
    faults: Faults,
    requests: usize,
}

impl KernelState {
    fn nsids(&self) -> Vec<(String, i64)> {
        self.namespaces
            .iter()
            .filter(|(name, _)| name.as_str() != SimKernel::ROOT)
            .map(|(name, ns)| (name.clone(), ns.nsid))
            .collect()
    }

    fn namespace(&mut self, name: &str) -> Result<&mut Namespace> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| Error::Transport(format!("no namespace {name}")))
    }

    fn add_netns(&mut self, name: &str) -> bool {
        if self.namespaces.contains_key(name) {
            return false;
        }
        let nsid = self.next_nsid;
        self.next_nsid += 1;
        self.namespaces.insert(name.to_string(), Namespace::new(nsid));
        if let Some(root) = self.namespaces.get_mut(SimKernel::ROOT) {
            root.broadcast(vec![netns_event(name, nsid, EventKind::NetNs.new_type())]);
        }
        true
    }

    fn remove_netns(&mut self, name: &str) -> bool {
        if name == SimKernel::ROOT {
            return false;
        }
        let Some(mut ns) = self.namespaces.remove(name) else {
            return false;
        };
        ns.fail_subscribers("namespace removed");
        if let Some(root) = self.namespaces.get_mut(SimKernel::ROOT) {
            root.broadcast(vec![netns_event(name, ns.nsid, EventKind::NetNs.del_type())]);
        }
        true
    }

    fn handle(&mut self, ns_name: &str, request: &Request) -> Result<Vec<Event>> {
        let Request { kind, verb, fields } = request;
        let (kind, verb) = (*kind, *verb);
        let nsids = self.nsids();

        if let Some(pos) = self
            .faults
            .requests
            .iter()
            .position(|(k, v, _)| *k == kind && *v == verb)
        {
            let (_, _, errno) = self.faults.requests.remove(pos);
            debug!(%kind, %verb, errno, "injected request failure");
            return Err(Error::from_errno(kind.as_str(), verb, errno));
        }
        if verb.is_mutating() {
            self.requests += 1;
            if self.faults.drop_requests {
                debug!(%kind, %verb, "request dropped");
                return Ok(Vec::new());
            }
        }

        if kind == EventKind::NetNs && verb.is_mutating() {
            let name = netns_name(text(fields, "path")).to_string();
            let done = match verb {
                Verb::Delete => self.remove_netns(&name),
                _ => self.add_netns(&name),
            };
            return match (done, verb) {
                (true, _) => Ok(Vec::new()),
                (false, Verb::Delete) => Err(Error::from_errno(kind.as_str(), verb, libc::ENOENT)),
                (false, _) => Err(Error::from_errno(kind.as_str(), verb, libc::EEXIST)),
            };
        }

        let ns = self.namespace(ns_name)?;
        let mut out = Vec::new();
        let result = match (kind, verb) {
            (_, Verb::Dump) => return Ok(ns.dump(kind, &nsids)),
            (_, Verb::Get) => {
                let found = ns
                    .dump(kind, &nsids)
                    .into_iter()
                    .find(|event| get_matches(event, fields));
                return found.map(|event| vec![event]).ok_or_else(|| {
                    Error::from_errno(kind.as_str(), verb, libc::ENOENT)
                });
            }
            (EventKind::Link, Verb::Create) => ns.link_create(fields, &mut out),
            (EventKind::Link, Verb::Modify) => ns.link_modify(fields, &mut out),
            (EventKind::Link, Verb::Delete) => ns.link_delete(fields, &mut out),
            (EventKind::Address, Verb::Create) => ns.address_create(fields, &mut out),
            (EventKind::Address, Verb::Modify) => ns.address_modify(fields, &mut out),
            (EventKind::Address, Verb::Delete) => ns.address_delete(fields, &mut out),
            (EventKind::Route, Verb::Create) => ns.route_create(fields, &mut out),
            (EventKind::Route, Verb::Modify) => ns.route_modify(fields, &mut out),
            (EventKind::Route, Verb::Delete) => ns.route_delete(fields, &mut out),
            (EventKind::Neighbour, Verb::Create) => ns.neigh_create(fields, &mut out),
            (EventKind::Neighbour, Verb::Modify) => ns.neigh_modify(fields, &mut out),
            (EventKind::Neighbour, Verb::Delete) => ns.neigh_delete(fields, &mut out),
            (EventKind::Rule, Verb::Create) => ns.rule_create(fields, &mut out),
            (EventKind::Rule, Verb::Modify) => {
                // Missing rules are simply added.
                let _ = ns.rule_delete(fields, &mut out);
                ns.rule_create(fields, &mut out)
            }
            (EventKind::Rule, Verb::Delete) => ns.rule_delete(fields, &mut out),
            (EventKind::NetNs, _) => Err(libc::EOPNOTSUPP),
        };
        match result {
            Ok(()) => {
                ns.broadcast(out);
                Ok(Vec::new())
            }
            Err(errno) => {
                debug!(%kind, %verb, errno, "request rejected");
                Err(Error::from_errno(kind.as_str(), verb, errno))
            }
        }
    }
}

/// Whether a dumped event matches every given request field.
fn get_matches(event: &Event, fields: &Attrs) -> bool {
    fields.iter().all(|(name, value)| {
        value.is_null() || event.get(name).is_some_and(|v| v == value)
    })
}

/// An in-process kernel with network namespaces.
///
/// Cheap to clone; clones share the kernel state.
#[derive(Clone)]
pub struct SimKernel {
    state: Arc<Mutex<KernelState>>,
}

impl fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SimKernel")
            .field("namespaces", &state.namespaces.keys().collect::<Vec<_>>())
            .field("requests", &state.requests)
            .finish()
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// Name of the root namespace.
    pub const ROOT: &'static str = "root";

    /// A kernel with the root namespace: `lo`, and `eth0` with
    /// 192.168.122.10/24 and a default route via 192.168.122.1.
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(Self::ROOT.to_string(), Namespace::root());
        Self {
            state: Arc::new(Mutex::new(KernelState {
                namespaces,
                next_nsid: 1,
                faults: Faults::default(),
                requests: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Namespace a source spec connects to.
    fn namespace_for(spec: &SourceSpec) -> String {
        match spec.kind {
            SourceKind::Local => Self::ROOT.to_string(),
            SourceKind::Netns => netns_name(spec.netns.as_deref().unwrap_or(&spec.target)).to_string(),
            SourceKind::Remote => spec
                .hostname
                .clone()
                .unwrap_or_else(|| spec.target.clone()),
        }
    }

    /// Run a request as another process would: effects are broadcast but
    /// not counted in [`request_count`](Self::request_count).
    pub fn run(&self, ns: &str, kind: EventKind, verb: Verb, fields: Attrs) -> Result<Vec<Event>> {
        let mut state = self.lock();
        let counted = state.requests;
        let result = state.handle(ns, &Request::new(kind, verb, fields));
        state.requests = counted;
        result
    }

    // ------------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------------

    /// Create a namespace with a loopback link. Returns false if it exists.
    pub fn add_netns(&self, name: &str) -> bool {
        self.lock().add_netns(name)
    }

    /// Remove a namespace; its transports fail. Returns false if unknown.
    pub fn remove_netns(&self, name: &str) -> bool {
        self.lock().remove_netns(name)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Flat fields of a link, by name.
    pub fn link(&self, ns: &str, ifname: &str) -> Option<Attrs> {
        let state = self.lock();
        state
            .namespaces
            .get(ns)?
            .link_by_name(ifname)
            .map(Link::fields)
    }

    pub fn links(&self, ns: &str) -> Vec<Attrs> {
        let state = self.lock();
        state
            .namespaces
            .get(ns)
            .map(|ns| ns.links.values().map(Link::fields).collect())
            .unwrap_or_default()
    }

    pub fn addresses(&self, ns: &str) -> Vec<Attrs> {
        self.rows(ns, |ns| &ns.addresses)
    }

    pub fn routes(&self, ns: &str) -> Vec<Attrs> {
        self.rows(ns, |ns| &ns.routes)
    }

    pub fn neighbours(&self, ns: &str) -> Vec<Attrs> {
        self.rows(ns, |ns| &ns.neighbours)
    }

    pub fn rules(&self, ns: &str) -> Vec<Attrs> {
        self.rows(ns, |ns| &ns.rules)
    }

    fn rows(&self, ns: &str, table: impl Fn(&Namespace) -> &Vec<Attrs>) -> Vec<Attrs> {
        let state = self.lock();
        state.namespaces.get(ns).map(|ns| table(ns).clone()).unwrap_or_default()
    }

    /// Mutating requests received from transports so far.
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make the pending or next receive of every transport bound to `ns`
    /// fail, as if the connection dropped.
    pub fn fail_next_recv(&self, ns: &str) {
        if let Some(ns) = self.lock().namespaces.get_mut(ns) {
            ns.fail_subscribers("connection reset by peer");
        }
    }

    /// Refuse the next `count` connections.
    pub fn fail_connect(&self, count: u32) {
        self.lock().faults.connect = count;
    }

    /// Reject the next request of `kind` and `verb` with `errno`.
    pub fn fail_request(&self, kind: EventKind, verb: Verb, errno: i32) {
        self.lock().faults.requests.push((kind, verb, errno));
    }

    /// Acknowledge mutating requests without executing them.
    pub fn drop_requests(&self, drop: bool) {
        self.lock().faults.drop_requests = drop;
    }
}

#[async_trait]
impl Connector for SimKernel {
    async fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn Transport>> {
        let ns = Self::namespace_for(spec);
        {
            let mut state = self.lock();
            if state.faults.connect > 0 {
                state.faults.connect -= 1;
                return Err(Error::Transport(format!("{}: connection refused", spec.target)));
            }
            if !state.namespaces.contains_key(&ns) {
                return Err(Error::Transport(format!("{}: no namespace {ns}", spec.target)));
            }
        }
        debug!(target = %spec.target, ns, "connected");
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(SimTransport {
            kernel: self.clone(),
            ns,
            rx: tokio::sync::Mutex::new(None),
            closed,
            bound: AtomicBool::new(false),
        }))
    }
}

/// One connection to a [`SimKernel`] namespace.
struct SimTransport {
    kernel: SimKernel,
    ns: String,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Feed>>>,
    closed: watch::Sender<bool>,
    bound: AtomicBool,
}

impl SimTransport {
    fn check_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Transport("transport closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn bind(&self) -> Result<()> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.kernel.lock().namespace(&self.ns)?.subscribers.push(tx);
        *self.rx.lock().await = Some(rx);
        self.bound.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, request: Request) -> Result<Vec<Event>> {
        self.check_open()?;
        trace!(ns = %self.ns, kind = %request.kind, verb = %request.verb, "request");
        self.kernel.lock().handle(&self.ns, &request)
    }

    async fn recv(&self) -> Result<Vec<Event>> {
        self.check_open()?;
        if !self.bound.load(Ordering::SeqCst) {
            return Err(Error::Transport("not bound".into()));
        }
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        let Some(rx) = rx.as_mut() else {
            return Err(Error::Transport("transport closed".into()));
        };
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(Error::Transport("transport closed".into())),
            item = rx.recv() => match item {
                Some(Feed::Events(events)) => Ok(events),
                Some(Feed::Fail(message)) => Err(Error::Transport(message)),
                None => Err(Error::Transport("namespace gone".into())),
            },
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.rx.lock().await.take();
    }
}
